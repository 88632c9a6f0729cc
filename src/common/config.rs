//! Configuration for the blob service and its background jobs

use crate::common::utils::deserialize_duration;
use crate::policy::NamespacePolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the storage pool used when a namespace policy does not pick one
pub const DEFAULT_STORAGE_POOL: &str = "default";

/// Global configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Name of the local region (site)
    #[serde(default = "default_site")]
    pub site: String,

    /// Bind address for the HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Per-namespace policies
    #[serde(default)]
    pub namespaces: HashMap<String, NamespacePolicy>,

    /// Policy applied to namespaces missing from `namespaces`
    #[serde(default)]
    pub default_policy: Option<NamespacePolicy>,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub consistency: ConsistencyConfig,
}

fn default_site() -> String {
    "local".to_string()
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from `JUPITER_CONFIG` (or `./jupiter.toml`) plus
    /// `JUPITER__`-prefixed environment overrides.
    pub fn load() -> crate::Result<Self> {
        let path = std::env::var("JUPITER_CONFIG").unwrap_or_else(|_| "jupiter.toml".into());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("JUPITER").separator("__"))
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(toml: &str) -> crate::Result<Self> {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site: default_site(),
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
            storage: StorageConfig::default(),
            namespaces: HashMap::new(),
            default_policy: None,
            index: IndexConfig::default(),
            replication: ReplicationConfig::default(),
            consistency: ConsistencyConfig::default(),
        }
    }
}

/// Storage layout configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Ordered store layers per storage pool; the last layer is the root
    #[serde(default = "default_pools")]
    pub pools: HashMap<String, Vec<LayerConfig>>,

    /// Payloads larger than this are spooled to a temp file while buffered
    #[serde(default = "default_buffer_in_memory_limit")]
    pub buffer_in_memory_limit: u64,
}

fn default_pools() -> HashMap<String, Vec<LayerConfig>> {
    let mut pools = HashMap::new();
    pools.insert(
        DEFAULT_STORAGE_POOL.to_string(),
        vec![LayerConfig {
            name: None,
            store: StoreConfig::FileSystem {
                path: PathBuf::from("./jupiter-data/blobs"),
            },
        }],
    );
    pools
}

fn default_buffer_in_memory_limit() -> u64 {
    8 * 1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pools: default_pools(),
            buffer_in_memory_limit: default_buffer_in_memory_limit(),
        }
    }
}

/// One layer of a storage pool
#[derive(Debug, Clone, Deserialize)]
pub struct LayerConfig {
    /// Name used in logs, responses and `storage_layers` filters; defaults to the type
    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub store: StoreConfig,
}

/// Physical backend of a layer
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    #[serde(alias = "fs")]
    FileSystem { path: PathBuf },
    Object {
        /// `s3://bucket/prefix`, `az://container`, `gs://bucket`, `file:///dir`, `memory://`
        url: String,
        #[serde(default)]
        allow_redirects: bool,
    },
    Relay { url: String },
}

/// Blob index backend
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndexConfig {
    #[default]
    Memory,
    RocksDb { path: PathBuf },
}

/// Peer regions used for on-demand replication
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Timeout for a single peer request
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,

    /// How often peer latency is measured
    #[serde(
        default = "default_probe_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub probe_interval: Duration,

    /// Bearer token presented to peers
    #[serde(default)]
    pub token: Option<String>,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            request_timeout: default_request_timeout(),
            probe_interval: default_probe_interval(),
            token: None,
        }
    }
}

/// A peer region and its endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub region: String,
    pub endpoints: Vec<String>,
    /// Static latency used until the first probe completes
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

/// Background consistency jobs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsistencyConfig {
    #[serde(default)]
    pub blob_index: BlobIndexCheckConfig,

    #[serde(default)]
    pub ref_store: RefStoreCheckConfig,

    /// Whether this instance is the elected leader for background jobs
    #[serde(default)]
    pub leader: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlobIndexCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_check_interval", deserialize_with = "deserialize_duration")]
    pub interval: Duration,

    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Remove stale region entries when repair fails
    #[serde(default)]
    pub allow_deletes_in_blob_index: bool,
}

impl Default for BlobIndexCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_check_interval(),
            parallelism: default_parallelism(),
            allow_deletes_in_blob_index: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefStoreCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_check_interval", deserialize_with = "deserialize_duration")]
    pub interval: Duration,

    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Namespaces whose referenced blobs are checked in every peer region
    #[serde(default)]
    pub regional_consistency_namespaces: Vec<String>,
}

impl Default for RefStoreCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_check_interval(),
            parallelism: default_parallelism(),
            regional_consistency_namespaces: Vec::new(),
        }
    }
}

fn default_check_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_parallelism() -> usize {
    4
}
