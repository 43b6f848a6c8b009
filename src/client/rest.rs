//! REST Management API Client
//!
//! Talks to the appliance's platform API over HTTPS with basic auth.
//! Collection responses are keyed by resource name, e.g. `{"shares": [...]}`;
//! single objects come back as a one-element list under the same key.

use crate::config::ConnectionConfig;
use crate::domain::{
    Endpoint, Lookup, ManagementApi, Principal, PrincipalQuery, PrincipalType, ResourceType,
    Snapshot, StableId,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Namespace header selecting the object type on create
const TARGET_TYPE_HEADER: &str = "x-isi-ifs-target-type";

/// Namespace header carrying the initial mode on create
const ACCESS_CONTROL_HEADER: &str = "x-isi-ifs-access-control";

// =============================================================================
// Routing
// =============================================================================

/// Collection path and response key for each resource type
fn route(resource: ResourceType) -> (&'static str, &'static str) {
    match resource {
        ResourceType::AdsProvider => ("/platform/1/auth/providers/ads", "ads"),
        ResourceType::ProvidersSummary => {
            ("/platform/1/auth/providers/summary", "provider_instances")
        }
        ResourceType::AccessZone => ("/platform/1/zones", "zones"),
        ResourceType::SmbZoneSettings => ("/platform/1/protocols/smb/settings/share", "settings"),
        ResourceType::NfsZoneSettings => ("/platform/2/protocols/nfs/settings/zone", "settings"),
        ResourceType::SmbShare => ("/platform/1/protocols/smb/shares", "shares"),
        ResourceType::SmbOpenFile => ("/platform/1/protocols/smb/openfiles", "openfiles"),
        ResourceType::NfsExport => ("/platform/2/protocols/nfs/exports", "exports"),
        ResourceType::FilePoolPolicy => ("/platform/1/filepool/policies", "policies"),
        ResourceType::Namespace => ("/namespace", ""),
        ResourceType::Quota => ("/platform/1/quota/quotas", "quotas"),
        ResourceType::SyncIqPolicy => ("/platform/1/sync/policies", "policies"),
        ResourceType::SyncIqJob => ("/platform/1/sync/jobs", "jobs"),
        ResourceType::Certificate => ("/platform/7/sync/certificates/peer", "certificates"),
        ResourceType::Node => ("/platform/3/cluster/nodes", "nodes"),
    }
}

/// Pull the object or list out of a keyed response body
///
/// Namespace responses are not keyed and are returned whole.
fn unwrap_items(resource: ResourceType, body: Value) -> Vec<Snapshot> {
    let (_, key) = route(resource);
    let inner = match body {
        Value::Object(mut obj) if !key.is_empty() => obj.remove(key).unwrap_or(Value::Object(obj)),
        other => other,
    };
    match inner {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(obj) => Some(obj),
                _ => None,
            })
            .collect(),
        Value::Object(obj) => vec![obj],
        _ => Vec::new(),
    }
}

/// Remote error text from an `{"errors": [{"message": ...}]}` body
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            let messages: Vec<String> = v
                .get("errors")?
                .as_array()?
                .iter()
                .filter_map(|e| e.get("message")?.as_str().map(str::to_string))
                .collect();
            (!messages.is_empty()).then(|| messages.join("; "))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

// =============================================================================
// Client
// =============================================================================

/// HTTPS client for the management API
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl RestClient {
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_ssl)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        if !config.verify_ssl {
            warn!("TLS certificate verification is disabled for {}", config.host);
        }

        Ok(Self {
            http,
            base_url: config.base_url(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, endpoint: &Endpoint) -> String {
        let (path, _) = route(endpoint.resource);
        let mut url = format!("{}{}", self.base_url, path);

        if let Some(id) = &endpoint.id {
            if endpoint.resource == ResourceType::Namespace {
                // Namespace ids are absolute paths; keep the separators
                for segment in id.split('/').filter(|s| !s.is_empty()) {
                    url.push('/');
                    url.push_str(&urlencoding::encode(segment));
                }
            } else {
                url.push('/');
                url.push_str(&urlencoding::encode(id));
            }
        }

        let query: Vec<String> = endpoint
            .query
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    urlencoding::encode(k).into_owned()
                } else {
                    format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))
                }
            })
            .collect();
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }
        url
    }

    /// Send one request, returning the status and body text
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Snapshot>,
        headers: &[(&str, String)],
    ) -> Result<(StatusCode, String)> {
        debug!("{} {}", method, url);
        let mut request = self
            .http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password));
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        Ok((status, text))
    }

    fn check(operation: String, status: StatusCode, text: &str) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::transport(operation, Some(status.as_u16()), error_message(text)))
        }
    }

    fn parse(text: &str) -> Result<Value> {
        if text.trim().is_empty() {
            Ok(Value::Object(Map::new()))
        } else {
            Ok(serde_json::from_str(text)?)
        }
    }

    async fn lookup(&self, path: &str, query: &PrincipalQuery, key: &str) -> Result<Option<Value>> {
        let mut endpoint_query = vec![format!("zone={}", urlencoding::encode(&query.zone))];
        if let Some(provider) = &query.provider {
            endpoint_query.push(format!("provider={}", urlencoding::encode(provider)));
        }
        let url = format!(
            "{}{}/{}?{}",
            self.base_url,
            path,
            urlencoding::encode(&query.name),
            endpoint_query.join("&")
        );

        let (status, text) = self.send(Method::GET, &url, None, &[]).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check(format!("lookup {} {}", query.kind, query.name), status, &text)?;
        let mut body = Self::parse(&text)?;
        Ok(body
            .get_mut(key)
            .and_then(Value::as_array_mut)
            .and_then(|items| (!items.is_empty()).then(|| items.remove(0))))
    }
}

/// `{"id": "UID:2000"}` under `key`
fn persona_id(item: &Value, key: &str) -> Option<StableId> {
    let raw = match item.get(key)? {
        Value::Object(obj) => obj.get("id")?.as_str()?,
        Value::String(s) => s.as_str(),
        _ => return None,
    };
    raw.parse().ok()
}

#[async_trait]
impl ManagementApi for RestClient {
    async fn get(&self, endpoint: &Endpoint) -> Result<Lookup<Snapshot>> {
        let mut endpoint = endpoint.clone();
        if endpoint.resource == ResourceType::Namespace {
            endpoint.query.insert("acl".into(), String::new());
        }
        let url = self.url(&endpoint);
        let (status, text) = self.send(Method::GET, &url, None, &[]).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Lookup::NotFound);
        }
        Self::check(format!("get {}", endpoint), status, &text)?;

        let body = Self::parse(&text)?;
        Ok(match unwrap_items(endpoint.resource, body).into_iter().next() {
            Some(item) => Lookup::Found(item),
            None => Lookup::NotFound,
        })
    }

    async fn list(&self, endpoint: &Endpoint) -> Result<Vec<Snapshot>> {
        let url = self.url(endpoint);
        let (status, text) = self.send(Method::GET, &url, None, &[]).await?;
        Self::check(format!("list {}", endpoint), status, &text)?;
        Ok(unwrap_items(endpoint.resource, Self::parse(&text)?))
    }

    async fn create(&self, endpoint: &Endpoint, payload: &Snapshot) -> Result<String> {
        if endpoint.resource == ResourceType::Namespace {
            let path = endpoint
                .id
                .clone()
                .ok_or_else(|| Error::Internal("namespace create without a path".into()))?;
            let mut headers = vec![(TARGET_TYPE_HEADER, "container".to_string())];
            if let Some(mode) = payload.get("mode").and_then(Value::as_u64) {
                headers.push((ACCESS_CONTROL_HEADER, format!("{:o}", mode)));
            }
            let url = self.url(endpoint);
            let (status, text) = self.send(Method::PUT, &url, None, &headers).await?;
            Self::check(format!("create {}", endpoint), status, &text)?;

            // Ownership and ACL are set on the new directory separately
            if payload.keys().any(|k| k != "mode" && k != "authoritative") {
                self.update(&Endpoint::item(ResourceType::Namespace, path.clone()), payload)
                    .await?;
            }
            return Ok(path);
        }

        let url = self.url(endpoint);
        let (status, text) = self.send(Method::POST, &url, Some(payload), &[]).await?;
        Self::check(format!("create {}", endpoint), status, &text)?;
        let body = Self::parse(&text)?;
        Ok(body
            .get("id")
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default())
    }

    async fn update(&self, endpoint: &Endpoint, payload: &Snapshot) -> Result<()> {
        let mut endpoint = endpoint.clone();
        let mut payload = payload.clone();
        if endpoint.resource == ResourceType::Namespace {
            endpoint.query.insert("acl".into(), String::new());
            // The ACL endpoint takes the mode as a four-digit octal string
            if let Some(mode) = payload.get("mode").and_then(Value::as_u64) {
                payload.insert("mode".into(), Value::from(format!("{:04o}", mode)));
            }
        }
        let url = self.url(&endpoint);
        let (status, text) = self.send(Method::PUT, &url, Some(&payload), &[]).await?;
        Self::check(format!("update {}", endpoint), status, &text)
    }

    async fn delete(&self, endpoint: &Endpoint) -> Result<()> {
        let url = self.url(endpoint);
        let (status, text) = self.send(Method::DELETE, &url, None, &[]).await?;
        Self::check(format!("delete {}", endpoint), status, &text)
    }

    async fn lookup_principal(&self, query: &PrincipalQuery) -> Result<Option<Principal>> {
        let (path, key, id_key, on_disk_key) = match query.kind {
            PrincipalType::User => (
                "/platform/1/auth/users",
                "users",
                "uid",
                "on_disk_user_identity",
            ),
            PrincipalType::Group => (
                "/platform/1/auth/groups",
                "groups",
                "gid",
                "on_disk_group_identity",
            ),
            PrincipalType::Wellknown => (
                "/platform/1/auth/wellknowns",
                "wellknowns",
                "id",
                "on_disk_identity",
            ),
        };

        let Some(item) = self.lookup(path, query, key).await? else {
            return Ok(None);
        };

        let id = persona_id(&item, id_key)
            .or_else(|| persona_id(&item, "sid"))
            .ok_or_else(|| {
                Error::transport(
                    format!("lookup {} {}", query.kind, query.name),
                    None,
                    "response carries no usable id",
                )
            })?;

        Ok(Some(Principal {
            name: item
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(&query.name)
                .to_string(),
            kind: query.kind,
            provider: item
                .get("provider")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| query.provider.clone()),
            id,
            on_disk_id: persona_id(&item, on_disk_key),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> RestClient {
        RestClient::new(&ConnectionConfig {
            host: "cluster.example.com".into(),
            username: "admin".into(),
            password: "secret".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_urls() {
        let client = client();
        let endpoint = Endpoint::item(ResourceType::SmbShare, "my share").in_zone("sales");
        assert_eq!(
            client.url(&endpoint),
            "https://cluster.example.com:8080/platform/1/protocols/smb/shares/my%20share?zone=sales"
        );

        let endpoint = Endpoint::item(ResourceType::Namespace, "/ifs/data/proj a").with("acl", "");
        assert_eq!(
            client.url(&endpoint),
            "https://cluster.example.com:8080/namespace/ifs/data/proj%20a?acl"
        );
    }

    #[test]
    fn test_unwrap_items() {
        let body = json!({"shares": [{"id": "a"}, {"id": "b"}], "total": 2});
        assert_eq!(unwrap_items(ResourceType::SmbShare, body).len(), 2);

        let body = json!({"settings": {"nfsv4_domain": "example.com"}});
        let items = unwrap_items(ResourceType::NfsZoneSettings, body);
        assert_eq!(items[0]["nfsv4_domain"], json!("example.com"));

        let body = json!({"owner": {"id": "UID:0"}, "mode": "0755"});
        let items = unwrap_items(ResourceType::Namespace, body);
        assert_eq!(items[0]["owner"], json!({"id": "UID:0"}));
    }

    #[test]
    fn test_error_message() {
        let body = r#"{"errors": [{"code": "AEC_NOT_FOUND", "message": "Share not found"}]}"#;
        assert_eq!(error_message(body), "Share not found");
        assert_eq!(error_message("gateway timeout\n"), "gateway timeout");
    }

    #[test]
    fn test_persona_id() {
        let user = json!({"uid": {"id": "UID:2000"}, "on_disk_user_identity": {"id": "SID:S-1-22-1-2000"}});
        assert_eq!(persona_id(&user, "uid"), Some(StableId::Uid(2000)));
        assert_eq!(
            persona_id(&user, "on_disk_user_identity"),
            Some(StableId::Sid("S-1-22-1-2000".into()))
        );
        assert_eq!(persona_id(&user, "gid"), None);
    }
}
