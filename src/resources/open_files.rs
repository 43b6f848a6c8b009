//! SMB Open Files
//!
//! Open files are tracked per node, so listing and closing them fans out
//! over every node in the cluster, one node at a time. A node that cannot
//! be reached is reported and skipped; the other nodes are still handled.

use crate::domain::{Endpoint, ResourceType, Snapshot, State};
use crate::error::Result;
use crate::reconcile::{Mutation, Session};
use crate::resources::{object_id, parse_params, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenFilesParams {
    /// `present` reports open files, `absent` closes them
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub path_prefix: Option<String>,
}

/// Outcome of one pass over the cluster
#[derive(Debug, Clone, Default, Serialize)]
pub struct OpenFilesReport {
    pub changed: bool,
    /// Matching open files; when closing, only those that were closed
    pub files: Vec<Snapshot>,
    /// Files that stayed open because their close request failed
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub close_failed: Vec<Snapshot>,
    pub failed_nodes: Vec<String>,
    pub mutations: Vec<Mutation>,
}

#[derive(Debug)]
pub struct OpenFiles {
    params: OpenFilesParams,
}

/// Open file path in `/ifs/...` form; the appliance reports `C:\ifs\...`
fn unix_path(file: &str) -> String {
    let path = file.strip_prefix("C:").unwrap_or(file);
    path.replace('\\', "/")
}

impl OpenFiles {
    pub fn new(params: Map<String, Value>) -> Result<Self> {
        Ok(Self {
            params: parse_params(ResourceKind::SmbOpenFiles, &params)?,
        })
    }

    fn matches(&self, file: &Snapshot) -> bool {
        let Some(prefix) = &self.params.path_prefix else {
            return true;
        };
        file.get("file")
            .and_then(Value::as_str)
            .is_some_and(|path| unix_path(path).starts_with(prefix.as_str()))
    }

    /// Matching open files on one node, tagged with the node number
    async fn node_files(&self, session: &Session, lnn: &str) -> Result<Vec<Snapshot>> {
        let files = session
            .list(&Endpoint::collection(ResourceType::SmbOpenFile).with("lnn", lnn))
            .await?;
        Ok(files
            .into_iter()
            .filter(|file| self.matches(file))
            .map(|mut file| {
                file.insert("lnn".into(), Value::from(lnn));
                file
            })
            .collect())
    }

    pub async fn run(&self, session: &Session) -> Result<OpenFilesReport> {
        let nodes = session.list(&Endpoint::collection(ResourceType::Node)).await?;
        let mut report = OpenFilesReport::default();

        for node in &nodes {
            let Some(lnn) = node.get("lnn").and_then(object_id) else {
                continue;
            };

            let files = match self.node_files(session, &lnn).await {
                Ok(files) => files,
                Err(e) => {
                    warn!("Skipping node {}: {}", lnn, e);
                    report.failed_nodes.push(lnn);
                    continue;
                }
            };
            debug!("Node {} has {} matching open files", lnn, files.len());

            if self.params.state != State::Absent {
                report.files.extend(files);
                continue;
            }

            for file in files {
                let Some(id) = file.get("id").and_then(object_id) else {
                    continue;
                };
                let endpoint =
                    Endpoint::item(ResourceType::SmbOpenFile, id).with("lnn", lnn.as_str());
                match session.delete(&endpoint).await {
                    Ok(()) => {
                        report.changed = true;
                        report.files.push(file);
                    }
                    Err(e) => {
                        warn!("Failed to close {} on node {}: {}", endpoint, lnn, e);
                        if !report.failed_nodes.contains(&lnn) {
                            report.failed_nodes.push(lnn.clone());
                        }
                        report.close_failed.push(file);
                    }
                }
            }
        }

        if self.params.state == State::Absent {
            info!(
                "Closed {} open files, {} could not be closed",
                report.files.len(),
                report.close_failed.len()
            );
        }
        report.mutations = session.mutations();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryAppliance;
    use crate::resources::testing::{appliance, params, session};
    use serde_json::json;
    use std::sync::Arc;

    fn cluster() -> Arc<InMemoryAppliance> {
        let appliance = appliance();
        for lnn in [1, 2, 3] {
            appliance.seed(ResourceType::Node, None, &lnn.to_string(), json!({"lnn": lnn}));
        }
        appliance.seed(
            ResourceType::SmbOpenFile,
            Some("1"),
            "11",
            json!({"file": "C:\\ifs\\data\\report.docx", "user": "alice"}),
        );
        appliance.seed(
            ResourceType::SmbOpenFile,
            Some("1"),
            "12",
            json!({"file": "C:\\ifs\\home\\notes.txt", "user": "bob"}),
        );
        appliance.seed(
            ResourceType::SmbOpenFile,
            Some("3"),
            "31",
            json!({"file": "C:\\ifs\\data\\budget.xlsx", "user": "carol"}),
        );
        appliance.fail_node("2");
        appliance
    }

    fn open_files(value: Value) -> OpenFiles {
        OpenFiles::new(params(value)).unwrap()
    }

    #[test]
    fn test_unix_path() {
        assert_eq!(unix_path("C:\\ifs\\data\\a.txt"), "/ifs/data/a.txt");
        assert_eq!(unix_path("/ifs/data/a.txt"), "/ifs/data/a.txt");
    }

    #[tokio::test]
    async fn test_report_skips_failed_node() {
        let appliance = cluster();
        let report = open_files(json!({"path_prefix": "/ifs/data"}))
            .run(&session(&appliance, "System", false))
            .await
            .unwrap();

        assert!(!report.changed);
        assert_eq!(report.failed_nodes, vec!["2".to_string()]);
        let lnns: Vec<&Value> = report.files.iter().map(|f| &f["lnn"]).collect();
        assert_eq!(lnns, vec![&json!("1"), &json!("3")]);
        assert!(report.mutations.is_empty());
    }

    #[tokio::test]
    async fn test_close_matching_files() {
        let appliance = cluster();
        let close = open_files(json!({"state": "absent", "path_prefix": "/ifs/data"}));

        let planned = close.run(&session(&appliance, "System", true)).await.unwrap();
        assert!(planned.changed);
        assert_eq!(planned.mutations.len(), 2);
        assert!(planned.mutations.iter().all(|m| !m.applied));
        assert_eq!(appliance.calls("delete"), 0);

        let report = close.run(&session(&appliance, "System", false)).await.unwrap();
        assert!(report.changed);
        assert_eq!(report.mutations[0].endpoint, "smb_open_file/11?lnn=1");
        assert!(appliance.peek(ResourceType::SmbOpenFile, Some("1"), "11").is_none());
        assert!(appliance.peek(ResourceType::SmbOpenFile, Some("1"), "12").is_some());

        let again = close.run(&session(&appliance, "System", false)).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_failed_close_reported_separately() {
        let appliance = cluster();
        // Listed under an id the node no longer knows, so closing it fails
        appliance.seed(
            ResourceType::SmbOpenFile,
            Some("3"),
            "32",
            json!({"id": "99", "file": "C:\\ifs\\data\\stale.tmp", "user": "dave"}),
        );
        let close = open_files(json!({"state": "absent", "path_prefix": "/ifs/data"}));

        let report = close.run(&session(&appliance, "System", false)).await.unwrap();
        assert!(report.changed);
        let closed: Vec<&Value> = report.files.iter().map(|f| &f["id"]).collect();
        assert_eq!(closed, vec![&json!("11"), &json!("31")]);
        assert_eq!(report.close_failed.len(), 1);
        assert_eq!(report.close_failed[0]["id"], json!("99"));
        assert_eq!(report.failed_nodes, vec!["2".to_string(), "3".to_string()]);
    }

    #[test]
    fn test_rejects_unknown_parameter() {
        assert!(OpenFiles::new(params(json!({"path": "/ifs"}))).is_err());
    }
}
