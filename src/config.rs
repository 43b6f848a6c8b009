//! Configuration
//!
//! Connection settings for the management API and the task file format.
//! A task file names one resource type, its requested state and parameters,
//! and optionally carries its own connection block.

use crate::error::{Error, Result};
use crate::resources::ResourceKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

// =============================================================================
// Connection
// =============================================================================

/// Management API connection settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Appliance host name or address
    pub host: String,
    /// Management API port
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Verify the appliance's TLS certificate
    pub verify_ssl: bool,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8080,
            username: String::new(),
            password: String::new(),
            verify_ssl: true,
            timeout_secs: 60,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("verify_ssl", &self.verify_ssl)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Values given on the command line or in the environment
#[derive(Debug, Clone, Default)]
pub struct ConnectionOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure: bool,
}

impl ConnectionConfig {
    /// Base URL of the management API
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }

    /// Apply command-line and environment overrides
    pub fn with_overrides(mut self, overrides: &ConnectionOverrides) -> Self {
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(username) = &overrides.username {
            self.username = username.clone();
        }
        if let Some(password) = &overrides.password {
            self.password = password.clone();
        }
        if overrides.insecure {
            self.verify_ssl = false;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Configuration("appliance host is not set".into()));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(Error::Configuration(
                "appliance username and password are required".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Configuration("timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Task File
// =============================================================================

/// One converge task as read from YAML
#[derive(Debug, Clone, Deserialize)]
pub struct TaskFile {
    /// Resource type to converge
    pub resource: ResourceKind,
    /// Connection block, overridable from the command line
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
    /// Resource parameters, including `state` and `access_zone`
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl TaskFile {
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    /// Connection settings with overrides applied
    pub fn connection(&self, overrides: &ConnectionOverrides) -> ConnectionConfig {
        self.connection
            .clone()
            .unwrap_or_default()
            .with_overrides(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.port, 8080);
        assert!(config.verify_ssl);
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_load_task_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "resource: smb_share\nshare_name: finance\npath: /ifs/finance\ndescription: null\n\
             connection:\n  host: cluster.example.com\n  username: admin\n  password: secret\n"
        )
        .unwrap();

        let task = TaskFile::load(file.path()).unwrap();
        assert_eq!(task.resource, ResourceKind::SmbShare);
        assert_eq!(task.params["share_name"], json!("finance"));
        assert_eq!(task.params["description"], Value::Null);
        assert!(!task.params.contains_key("connection"));

        let connection = task.connection(&ConnectionOverrides {
            password: Some("override".into()),
            insecure: true,
            ..Default::default()
        });
        assert_eq!(connection.host, "cluster.example.com");
        assert_eq!(connection.password, "override");
        assert!(!connection.verify_ssl);
        assert!(connection.validate().is_ok());
        assert_eq!(connection.base_url(), "https://cluster.example.com:8080");
        assert!(!format!("{:?}", connection).contains("override"));
    }

    #[test]
    fn test_unknown_resource_is_rejected() {
        assert_matches!(
            TaskFile::from_yaml("resource: tape_library\nname: x\n"),
            Err(Error::YamlParse(_))
        );
    }
}
