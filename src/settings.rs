use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub semaphore: SemaphoreConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: String, // e.g. 127.0.0.1:50061
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_grpc_addr() -> String {
    "127.0.0.1:50061".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    /// Path to the FoundationDB cluster file. Uses the platform default
    /// cluster file when unset.
    #[serde(default)]
    pub cluster_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SemaphoreConfig {
    /// Cluster file for the semaphore's lease subspace. Defaults to the
    /// queue's cluster file, letting small deployments run on one cluster.
    #[serde(default)]
    pub cluster_file: Option<String>,
    /// Single-tenant deployments bypass the semaphore for limits of one.
    #[serde(default)]
    pub self_hosted: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JanitorConfig {
    /// Run the janitor loops inside this process. Disable when a dedicated
    /// replica owns maintenance.
    #[serde(default = "default_janitor_enabled")]
    pub enabled: bool,
    #[serde(default = "default_expired_jobs_interval_ms")]
    pub expired_jobs_interval_ms: u64,
    #[serde(default = "default_expired_active_interval_ms")]
    pub expired_active_interval_ms: u64,
    #[serde(default = "default_orphan_claims_interval_ms")]
    pub orphan_claims_interval_ms: u64,
    /// Claims older than this are orphans regardless of entry existence.
    /// Must sit well above the worst-case pop-to-complete latency.
    #[serde(default = "default_orphan_claim_age_ms")]
    pub orphan_claim_age_ms: i64,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    #[serde(default = "default_reconcile_page_size")]
    pub reconcile_page_size: usize,
    #[serde(default = "default_stale_counters_interval_ms")]
    pub stale_counters_interval_ms: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_janitor_enabled(),
            expired_jobs_interval_ms: default_expired_jobs_interval_ms(),
            expired_active_interval_ms: default_expired_active_interval_ms(),
            orphan_claims_interval_ms: default_orphan_claims_interval_ms(),
            orphan_claim_age_ms: default_orphan_claim_age_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            reconcile_page_size: default_reconcile_page_size(),
            stale_counters_interval_ms: default_stale_counters_interval_ms(),
        }
    }
}

fn default_janitor_enabled() -> bool {
    true
}

fn default_expired_jobs_interval_ms() -> u64 {
    30_000
}

fn default_expired_active_interval_ms() -> u64 {
    30_000
}

fn default_orphan_claims_interval_ms() -> u64 {
    60_000
}

fn default_orphan_claim_age_ms() -> i64 {
    300_000
}

fn default_reconcile_interval_ms() -> u64 {
    300_000
}

fn default_reconcile_page_size() -> usize {
    100
}

fn default_stale_counters_interval_ms() -> u64 {
    3_600_000
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self {
                server: ServerConfig::default(),
                database: DatabaseConfig::default(),
                semaphore: SemaphoreConfig::default(),
                janitor: JanitorConfig::default(),
            }),
        }
    }

    /// Cluster file for the semaphore store, falling back to the queue's.
    pub fn semaphore_cluster_file(&self) -> Option<&str> {
        self.semaphore
            .cluster_file
            .as_deref()
            .or(self.database.cluster_file.as_deref())
    }
}
