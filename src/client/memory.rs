//! In-Memory Appliance
//!
//! A management API backed by process memory. Used by the test suite and by
//! `--simulate`, where it is seeded from a YAML file. Objects are keyed by
//! resource type, scope (access zone, or node for open files) and id.

use crate::domain::{
    Endpoint, Lookup, ManagementApi, Principal, PrincipalQuery, ResourceType, Snapshot,
    DEFAULT_ZONE,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Query keys that select a scope rather than filter objects
const SCOPE_KEYS: [&str; 2] = ["zone", "lnn"];

type ObjectKey = (ResourceType, String, String);

// =============================================================================
// Seed File
// =============================================================================

/// One pre-existing object
#[derive(Debug, Clone, Deserialize)]
pub struct SeedObject {
    pub resource: ResourceType,
    #[serde(default)]
    pub scope: Option<String>,
    pub id: String,
    #[serde(default)]
    pub body: Snapshot,
}

/// Initial appliance contents for `--simulate`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SeedFile {
    pub principals: Vec<Principal>,
    pub objects: Vec<SeedObject>,
    pub failing_nodes: Vec<String>,
}

impl SeedFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

// =============================================================================
// Appliance
// =============================================================================

/// Management API over an in-memory object store
pub struct InMemoryAppliance {
    objects: RwLock<BTreeMap<ObjectKey, Snapshot>>,
    principals: RwLock<Vec<Principal>>,
    failing_nodes: RwLock<BTreeSet<String>>,
    calls: Mutex<BTreeMap<&'static str, usize>>,
    next_id: AtomicU64,
}

impl Default for InMemoryAppliance {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAppliance {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            principals: RwLock::new(Vec::new()),
            failing_nodes: RwLock::new(BTreeSet::new()),
            calls: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build an appliance from a seed file
    pub fn from_seed(seed: SeedFile) -> Self {
        let appliance = Self::new();
        for principal in seed.principals {
            appliance.add_principal(principal);
        }
        for object in seed.objects {
            appliance.seed(
                object.resource,
                object.scope.as_deref(),
                &object.id,
                Value::Object(object.body),
            );
        }
        for lnn in seed.failing_nodes {
            appliance.fail_node(&lnn);
        }
        appliance
    }

    /// Insert an object directly, bypassing call counters
    pub fn seed(&self, resource: ResourceType, scope: Option<&str>, id: &str, body: Value) {
        let mut body = match body {
            Value::Object(obj) => obj,
            _ => Snapshot::new(),
        };
        body.entry("id").or_insert_with(|| Value::from(id));
        let key = (resource, default_scope(resource, scope), id.to_string());
        self.objects.write().insert(key, body);
    }

    pub fn add_principal(&self, principal: Principal) {
        self.principals.write().push(principal);
    }

    /// Make every request scoped to this node fail
    pub fn fail_node(&self, lnn: &str) {
        self.failing_nodes.write().insert(lnn.to_string());
    }

    /// Read an object without counting a call
    pub fn peek(&self, resource: ResourceType, scope: Option<&str>, id: &str) -> Option<Snapshot> {
        let key = (resource, default_scope(resource, scope), id.to_string());
        self.objects.read().get(&key).cloned()
    }

    /// Every object of a type, across scopes
    pub fn all(&self, resource: ResourceType) -> Vec<Snapshot> {
        self.objects
            .read()
            .iter()
            .filter(|((r, _, _), _)| *r == resource)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Number of calls made to an operation
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    fn count(&self, operation: &'static str, endpoint: &Endpoint) -> Result<()> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;
        debug!("{} {}", operation, endpoint);
        if let Some(lnn) = endpoint.query.get("lnn") {
            if self.failing_nodes.read().contains(lnn) {
                return Err(Error::transport(
                    format!("{} {}", operation, endpoint),
                    Some(503),
                    format!("node {} is unreachable", lnn),
                ));
            }
        }
        Ok(())
    }

    fn key(endpoint: &Endpoint, id: &str) -> ObjectKey {
        (endpoint.resource, scope_of(endpoint), id.to_string())
    }
}

fn default_scope(resource: ResourceType, scope: Option<&str>) -> String {
    match scope {
        Some(scope) => scope.to_string(),
        None if resource.is_zoned() => DEFAULT_ZONE.to_string(),
        None => String::new(),
    }
}

fn scope_of(endpoint: &Endpoint) -> String {
    if endpoint.resource == ResourceType::SmbOpenFile {
        return endpoint.query.get("lnn").cloned().unwrap_or_default();
    }
    if endpoint.resource.is_zoned() {
        endpoint.zone().to_string()
    } else {
        String::new()
    }
}

/// Whether an object satisfies the non-scope query filters
fn matches_query(body: &Snapshot, endpoint: &Endpoint) -> bool {
    endpoint
        .query
        .iter()
        .filter(|(k, _)| !SCOPE_KEYS.contains(&k.as_str()))
        .all(|(k, want)| match body.get(k) {
            Some(Value::String(s)) => s == want,
            Some(Value::Array(items)) => items.iter().any(|i| i.as_str() == Some(want.as_str())),
            Some(Value::Bool(b)) => b.to_string() == *want,
            Some(Value::Number(n)) => n.to_string() == *want,
            _ => false,
        })
}

#[async_trait]
impl ManagementApi for InMemoryAppliance {
    async fn get(&self, endpoint: &Endpoint) -> Result<Lookup<Snapshot>> {
        self.count("get", endpoint)?;
        let id = endpoint.id.clone().unwrap_or_default();
        Ok(match self.objects.read().get(&Self::key(endpoint, &id)) {
            Some(body) => Lookup::Found(body.clone()),
            None => Lookup::NotFound,
        })
    }

    async fn list(&self, endpoint: &Endpoint) -> Result<Vec<Snapshot>> {
        self.count("list", endpoint)?;
        let scope = scope_of(endpoint);
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|((resource, s, _), body)| {
                *resource == endpoint.resource && *s == scope && matches_query(body, endpoint)
            })
            .map(|(_, body)| body.clone())
            .collect())
    }

    async fn create(&self, endpoint: &Endpoint, payload: &Snapshot) -> Result<String> {
        self.count("create", endpoint)?;
        let named = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);
        let instance = named("instance");
        let id = endpoint
            .id
            .clone()
            .or_else(|| instance.clone())
            .or_else(|| named("name"))
            .unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::SeqCst).to_string());

        let key = Self::key(endpoint, &id);
        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(Error::transport(
                format!("create {}", endpoint),
                Some(409),
                format!("{} already exists", id),
            ));
        }
        let mut body = payload.clone();
        // A provider joined under an instance name is known by that name
        if let Some(instance) = instance {
            if let Some(domain) = body.insert("name".into(), Value::from(instance)) {
                body.insert("domain".into(), domain);
            }
        }
        body.insert("id".into(), Value::from(id.clone()));
        objects.insert(key, body);
        Ok(id)
    }

    async fn update(&self, endpoint: &Endpoint, payload: &Snapshot) -> Result<()> {
        self.count("update", endpoint)?;
        let id = endpoint.id.clone().unwrap_or_default();
        let key = Self::key(endpoint, &id);
        let mut objects = self.objects.write();

        if !objects.contains_key(&key) {
            // Zone settings have no id and always exist
            if endpoint.id.is_some() {
                return Err(Error::NotFound {
                    kind: endpoint.resource.to_string(),
                    name: id,
                });
            }
            objects.insert(key.clone(), Snapshot::new());
        }
        if let Some(body) = objects.get_mut(&key) {
            for (name, value) in payload {
                body.insert(name.clone(), value.clone());
            }
        }
        // A rename moves the object
        if let Some(new_name) = payload.get("name").and_then(Value::as_str) {
            if endpoint.id.as_deref().is_some_and(|old| old != new_name) {
                if let Some(mut moved) = objects.remove(&key) {
                    moved.insert("id".into(), Value::from(new_name));
                    objects.insert(Self::key(endpoint, new_name), moved);
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, endpoint: &Endpoint) -> Result<()> {
        self.count("delete", endpoint)?;
        let id = endpoint.id.clone().unwrap_or_default();
        match self.objects.write().remove(&Self::key(endpoint, &id)) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound {
                kind: endpoint.resource.to_string(),
                name: id,
            }),
        }
    }

    async fn lookup_principal(&self, query: &PrincipalQuery) -> Result<Option<Principal>> {
        *self.calls.lock().entry("lookup_principal").or_insert(0) += 1;
        Ok(self
            .principals
            .read()
            .iter()
            .find(|p| {
                p.kind == query.kind
                    && p.name.eq_ignore_ascii_case(&query.name)
                    && query.provider.as_ref().map_or(true, |want| p.provider.as_ref() == Some(want))
            })
            .cloned())
    }
}
