//! Namespace policies
//!
//! Policies are read-mostly snapshots built from configuration; a reload
//! swaps the whole table.

use crate::common::{Config, Error, NamespaceId, Result, DEFAULT_STORAGE_POOL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Per-namespace behaviour of the blob service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacePolicy {
    /// Storage pool whose store stack holds the namespace
    #[serde(default = "default_storage_pool")]
    pub storage_pool: String,

    /// Verify that every put's id equals the hash of its content
    #[serde(default = "default_true")]
    pub use_content_addressed_storage: bool,

    /// Allow stores to answer reads with a redirect URI
    #[serde(default)]
    pub allow_redirect_uris: bool,

    /// Namespace consulted when a blob is missing here
    #[serde(default)]
    pub fallback_namespace: Option<NamespaceId>,

    /// Also write uploads into the fallback namespace
    #[serde(default)]
    pub populate_fallback_namespace_on_upload: bool,

    /// Fetch missing blobs from peer regions on read
    #[serde(default)]
    pub on_demand_replication: bool,

    /// Answer exists checks from the blob index instead of the stores
    #[serde(default)]
    pub use_blob_index_for_exists: bool,
}

fn default_storage_pool() -> String {
    DEFAULT_STORAGE_POOL.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for NamespacePolicy {
    fn default() -> Self {
        Self {
            storage_pool: default_storage_pool(),
            use_content_addressed_storage: true,
            allow_redirect_uris: false,
            fallback_namespace: None,
            populate_fallback_namespace_on_upload: false,
            on_demand_replication: false,
            use_blob_index_for_exists: false,
        }
    }
}

/// Resolves the policy of a namespace
pub trait NamespacePolicyResolver: Send + Sync {
    /// Policy for `ns`, or `NamespaceNotFound` if the namespace is unknown
    fn get_policy(&self, ns: &NamespaceId) -> Result<NamespacePolicy>;

    /// Namespaces with an explicit policy
    fn namespaces(&self) -> Vec<NamespaceId>;

    /// Is the namespace known (explicitly or through a default policy)?
    fn is_known(&self, ns: &NamespaceId) -> bool {
        self.get_policy(ns).is_ok()
    }
}

#[derive(Debug, Clone, Default)]
struct PolicyTable {
    policies: HashMap<NamespaceId, NamespacePolicy>,
    default_policy: Option<NamespacePolicy>,
}

/// Policy resolver backed by the `namespaces` section of the config
#[derive(Debug, Default)]
pub struct ConfigPolicyResolver {
    table: RwLock<Arc<PolicyTable>>,
}

impl ConfigPolicyResolver {
    pub fn new(
        policies: HashMap<NamespaceId, NamespacePolicy>,
        default_policy: Option<NamespacePolicy>,
    ) -> Self {
        Self {
            table: RwLock::new(Arc::new(PolicyTable {
                policies,
                default_policy,
            })),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let resolver = Self::default();
        resolver.reload(config)?;
        Ok(resolver)
    }

    /// Replace the policy table with the one described by `config`
    pub fn reload(&self, config: &Config) -> Result<()> {
        let mut policies = HashMap::new();
        for (name, policy) in &config.namespaces {
            policies.insert(NamespaceId::new(name.as_str())?, policy.clone());
        }
        let table = Arc::new(PolicyTable {
            policies,
            default_policy: config.default_policy.clone(),
        });
        *self
            .table
            .write()
            .map_err(|_| Error::Internal("policy table lock poisoned".into()))? = table;
        Ok(())
    }

    /// Insert or replace a single policy
    pub fn set_policy(&self, ns: NamespaceId, policy: NamespacePolicy) {
        if let Ok(mut guard) = self.table.write() {
            let mut table = PolicyTable::clone(&guard);
            table.policies.insert(ns, policy);
            *guard = Arc::new(table);
        }
    }

    fn snapshot(&self) -> Result<Arc<PolicyTable>> {
        self.table
            .read()
            .map(|t| t.clone())
            .map_err(|_| Error::Internal("policy table lock poisoned".into()))
    }
}

impl NamespacePolicyResolver for ConfigPolicyResolver {
    fn get_policy(&self, ns: &NamespaceId) -> Result<NamespacePolicy> {
        let table = self.snapshot()?;
        table
            .policies
            .get(ns)
            .or(table.default_policy.as_ref())
            .cloned()
            .ok_or_else(|| Error::NamespaceNotFound(ns.clone()))
    }

    fn namespaces(&self) -> Vec<NamespaceId> {
        self.snapshot()
            .map(|t| t.policies.keys().cloned().collect())
            .unwrap_or_default()
    }
}
