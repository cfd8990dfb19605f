use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

use crate::history::HistoryLimits;
use crate::jobs::{CadenceZone, Tier};
use crate::orchestrator::RetryPolicy;
use crate::retention::RetentionPolicy;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Defaults for jobs that do not set their own `retry`.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default = "default_retention_policies")]
    pub retention_policies: BTreeMap<String, RetentionPolicy>,
    /// Job chain; the default chain when omitted.
    #[serde(default)]
    pub jobs: Option<Vec<JobConfig>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryPolicy::default(),
            history: HistoryConfig::default(),
            alerting: AlertingConfig::default(),
            secrets: SecretsConfig::default(),
            snapshot: SnapshotConfig::default(),
            replication: ReplicationConfig::default(),
            cloud: CloudConfig::default(),
            retention_policies: default_retention_policies(),
            jobs: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_saphyr::from_str(&expanded)?)
    }

    /// Configured jobs, or the default chain.
    pub fn jobs(&self) -> Vec<JobConfig> {
        self.jobs.clone().unwrap_or_else(default_jobs)
    }

    /// Workspace directory resolved against the config file.
    pub fn workspace_dir(&self, config_path: &Path) -> PathBuf {
        let workspace = self
            .workspace
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE));
        resolve_path(config_path, &workspace)
    }

    /// Check that every enabled tier has what its executor needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let jobs = self.jobs();
        let uses = |tier: Tier| jobs.iter().any(|j| j.enabled && j.tier == tier);

        if self.scheduler.heartbeat_seconds == 0 {
            return Err(invalid("scheduler.heartbeat_seconds must be positive"));
        }
        if self.scheduler.heartbeat_seconds > self.scheduler.liveness_window_seconds {
            return Err(invalid(
                "scheduler.heartbeat_seconds must not exceed scheduler.liveness_window_seconds",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(invalid("retry.jitter_ratio must be between 0 and 1"));
        }
        if (uses(Tier::Snapshot) || uses(Tier::Replication)) && self.snapshot.dataset.is_none() {
            return Err(invalid("snapshot.dataset is required"));
        }
        if uses(Tier::Replication) {
            if self.replication.host.is_none() {
                return Err(invalid("replication.host is required for replication jobs"));
            }
            if self.replication.remote_dataset.is_none() {
                return Err(invalid(
                    "replication.remote_dataset is required for replication jobs",
                ));
            }
        }
        if uses(Tier::Cloud) {
            if self.cloud.local_path.is_none() {
                return Err(invalid("cloud.local_path is required for cloud jobs"));
            }
            if self.cloud.bucket.is_none() {
                return Err(invalid("cloud.bucket is required for cloud jobs"));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

/// Resolve a path relative to the config file directory.
///
/// If the path is absolute, it is returned as-is.
/// If the path is relative, it is joined with the config file's parent directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

// ============================================================================
// Default Paths
// ============================================================================

/// Default workspace directory (relative to config file).
pub const DEFAULT_WORKSPACE: &str = ".backtier";
/// Run history directory (relative to workspace).
pub const DEFAULT_RUNS_DIR: &str = "runs";
/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "backtier.yaml";

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    64
}

/// Serde default for bool fields that should be `true` (serde's default is `false`).
fn default_true() -> bool {
    true
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Concurrent `/api/v1` requests.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bearer token for `/api/v1`. Unset means loopback callers only.
    #[serde(default)]
    pub api_token: Option<String>,
    /// Optional admin API token. If set, admin endpoints require this token.
    /// If not set, admin endpoints only accept requests from localhost.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            max_connections: default_max_connections(),
            api_token: None,
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Longest the loop sleeps between ticks.
    #[serde(default = "SchedulerConfig::default_heartbeat")]
    pub heartbeat_seconds: u64,
    /// Health turns stale when the loop has not ticked for this long.
    #[serde(default = "SchedulerConfig::default_liveness_window")]
    pub liveness_window_seconds: u64,
    #[serde(default)]
    pub timezone: CadenceZone,
    #[serde(default = "SchedulerConfig::default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl SchedulerConfig {
    fn default_heartbeat() -> u64 {
        30
    }

    fn default_liveness_window() -> u64 {
        300
    }

    fn default_shutdown_grace() -> u64 {
        30
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }

    pub fn liveness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.liveness_window_seconds as i64)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_seconds: Self::default_heartbeat(),
            liveness_window_seconds: Self::default_liveness_window(),
            timezone: CadenceZone::default(),
            shutdown_grace_seconds: Self::default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "HistoryConfig::default_max_records")]
    pub max_records_per_job: usize,
    #[serde(default = "HistoryConfig::default_retention_days")]
    pub retention_days: u32,
    /// Persist run records under `{workspace}/runs`.
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl HistoryConfig {
    fn default_max_records() -> usize {
        500
    }

    fn default_retention_days() -> u32 {
        90
    }

    pub fn limits(&self) -> HistoryLimits {
        HistoryLimits {
            max_records_per_job: self.max_records_per_job.max(1),
            max_age: chrono::Duration::days(i64::from(self.retention_days)),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_records_per_job: Self::default_max_records(),
            retention_days: Self::default_retention_days(),
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub on_failure: bool,
    #[serde(default = "default_true")]
    pub on_recovery: bool,
    #[serde(default)]
    pub on_success: bool,
    /// Webhook URL. Takes precedence over `webhook_secret`.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Name of the secret holding the webhook URL.
    #[serde(default = "AlertingConfig::default_webhook_secret")]
    pub webhook_secret: String,
    #[serde(default = "AlertingConfig::default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "AlertingConfig::default_service_name")]
    pub service_name: String,
}

impl AlertingConfig {
    fn default_webhook_secret() -> String {
        "alert_webhook_url".to_string()
    }

    fn default_timeout() -> u64 {
        10
    }

    fn default_service_name() -> String {
        crate::build_info::SERVICE_NAME.to_string()
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_failure: true,
            on_recovery: true,
            on_success: false,
            webhook_url: None,
            webhook_secret: Self::default_webhook_secret(),
            timeout_seconds: Self::default_timeout(),
            service_name: Self::default_service_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    /// Directories searched in order for `{dir}/{name}`.
    #[serde(default = "SecretsConfig::default_dirs")]
    pub dirs: Vec<PathBuf>,
    #[serde(default = "SecretsConfig::default_env_prefix")]
    pub env_prefix: String,
}

impl SecretsConfig {
    fn default_dirs() -> Vec<PathBuf> {
        vec![PathBuf::from("/run/secrets"), PathBuf::from("./secrets")]
    }

    fn default_env_prefix() -> String {
        "BACKTIER_".to_string()
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            dirs: Self::default_dirs(),
            env_prefix: Self::default_env_prefix(),
        }
    }
}

fn default_zfs_binary() -> String {
    "zfs".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// Local dataset that snapshot jobs snapshot and replication sends from.
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default = "default_zfs_binary")]
    pub zfs_binary: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dataset: None,
            zfs_binary: default_zfs_binary(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "ReplicationConfig::default_user")]
    pub user: String,
    #[serde(default = "ReplicationConfig::default_port")]
    pub port: u16,
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    #[serde(default)]
    pub remote_dataset: Option<String>,
    /// Only replicate snapshots carrying this marker (e.g. `daily`).
    #[serde(default)]
    pub snapshot_filter: Option<String>,
    /// Extra `-o` options passed to ssh.
    #[serde(default)]
    pub ssh_options: Vec<String>,
    #[serde(default = "default_zfs_binary")]
    pub zfs_binary: String,
}

impl ReplicationConfig {
    fn default_user() -> String {
        "root".to_string()
    }

    fn default_port() -> u16 {
        22
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: Self::default_user(),
            port: Self::default_port(),
            ssh_key: None,
            remote_dataset: None,
            snapshot_filter: None,
            ssh_options: Vec::new(),
            zfs_binary: default_zfs_binary(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// rclone remote name.
    #[serde(default = "CloudConfig::default_remote")]
    pub remote: String,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "CloudConfig::default_transfers")]
    pub transfers: u32,
    #[serde(default = "CloudConfig::default_checkers")]
    pub checkers: u32,
    #[serde(default = "CloudConfig::default_rclone_binary")]
    pub rclone_binary: String,
    /// Environment variable name to secret name, passed to rclone.
    #[serde(default)]
    pub env_secrets: BTreeMap<String, String>,
}

impl CloudConfig {
    fn default_remote() -> String {
        "b2".to_string()
    }

    fn default_transfers() -> u32 {
        4
    }

    fn default_checkers() -> u32 {
        8
    }

    fn default_rclone_binary() -> String {
        "rclone".to_string()
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            local_path: None,
            remote: Self::default_remote(),
            bucket: None,
            transfers: Self::default_transfers(),
            checkers: Self::default_checkers(),
            rclone_binary: Self::default_rclone_binary(),
            env_secrets: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub tier: Tier,
    pub cadence: String,
    #[serde(default)]
    pub depends_on: Option<DependencyConfig>,
    #[serde(default)]
    pub retention: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependencyConfig {
    pub tier: Tier,
    #[serde(default = "DependencyConfig::default_freshness_hours")]
    pub freshness_hours: u64,
}

impl DependencyConfig {
    fn default_freshness_hours() -> u64 {
        26
    }
}

/// `local` and `remote`, both 7 daily / 4 weekly / 12 monthly, floor 1.
pub fn default_retention_policies() -> BTreeMap<String, RetentionPolicy> {
    BTreeMap::from([
        ("local".to_string(), RetentionPolicy::default()),
        ("remote".to_string(), RetentionPolicy::default()),
    ])
}

/// Daily, weekly and monthly snapshots, nightly replication, weekly cloud sync.
pub fn default_jobs() -> Vec<JobConfig> {
    fn job(id: &str, name: &str, tier: Tier, cadence: &str) -> JobConfig {
        JobConfig {
            id: id.to_string(),
            name: Some(name.to_string()),
            tier,
            cadence: cadence.to_string(),
            depends_on: None,
            retention: None,
            label: None,
            timeout_seconds: None,
            retry: None,
            enabled: true,
        }
    }

    let snapshot = |id: &str, name: &str, cadence: &str, label: &str| JobConfig {
        retention: Some("local".to_string()),
        label: Some(label.to_string()),
        ..job(id, name, Tier::Snapshot, cadence)
    };

    vec![
        snapshot("snapshot-daily", "Daily snapshot", "0 3 * * *", "daily"),
        snapshot("snapshot-weekly", "Weekly snapshot", "0 3 * * 0", "weekly"),
        snapshot("snapshot-monthly", "Monthly snapshot", "0 3 1 * *", "monthly"),
        JobConfig {
            depends_on: Some(DependencyConfig {
                tier: Tier::Snapshot,
                freshness_hours: DependencyConfig::default_freshness_hours(),
            }),
            retention: Some("remote".to_string()),
            ..job("replication", "Off-host replication", Tier::Replication, "0 4 * * *")
        },
        job("cloud-sync", "Cloud sync", Tier::Cloud, "0 5 * * 0"),
    ]
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports the following syntax (shell-compatible):
/// - `${VAR}` - Required variable, errors if not set
/// - `${VAR:-default}` - Optional variable with default value
/// - `${VAR:-}` - Optional variable, empty string if not set
/// - `$$` - Escaped `$` (only needed before `{` to prevent expansion)
///
/// No nested expansion: `${VAR:-${DEFAULT}}` is not supported.
///
/// ```yaml
/// alerting:
///   webhook_url: ${ALERT_WEBHOOK_URL:-}
/// server:
///   port: ${PORT:-8080}
/// ```
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next();
                result.push_str(&parse_var_reference(&mut chars)?);
            }
            _ => result.push('$'),
        }
    }

    Ok(result)
}

/// Parse a variable reference after seeing `${`.
fn parse_var_reference(
    chars: &mut std::iter::Peekable<std::str::Chars>,
) -> Result<String, ConfigError> {
    let mut var_name = String::new();
    let mut default_value: Option<String> = None;

    loop {
        let Some(c) = chars.next() else {
            return Err(ConfigError::UnclosedVarReference);
        };
        match c {
            '}' => break,
            ':' if default_value.is_none() && chars.peek() == Some(&'-') => {
                chars.next();
                default_value = Some(String::new());
            }
            c => match default_value.as_mut() {
                Some(default) => default.push(c),
                None => var_name.push(c),
            },
        }
    }

    match std::env::var(&var_name) {
        Ok(value) => Ok(value),
        Err(_) => default_value.ok_or(ConfigError::MissingEnvVar(var_name)),
    }
}
