//! Wiring from [`Config`] to a ready-to-run orchestrator.
//!
//! Shared by the `serve`, `run`, `check` and `retention` commands so every
//! entry point builds the same registry, executors, history and alerting.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::alert::{AlertChannel, AlertPolicy, LogAlertChannel, WebhookAlertChannel};
use crate::config::{self, Config, ConfigError};
use crate::executor::{CloudExecutor, Executors, ReplicationExecutor, SnapshotExecutor};
use crate::history::RunHistory;
use crate::jobs::{JobRegistry, RegistryError, Tier};
use crate::orchestrator::Orchestrator;
use crate::scheduler::{SchedulerHandle, SchedulerService};
use crate::secrets::{FileSecrets, SecretError, SecretsProvider};
use crate::status::StatusReporter;
use crate::store::StorageError;
use crate::store::file::FileRunLogStore;
use crate::transport::{
    LocalTransport, RcloneTransport, ReplicationTransport, SnapshotStore, SshTransport,
    ZfsSnapshotStore,
};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("failed to load run history: {0}")]
    History(#[from] StorageError),
}

/// Everything a command needs to run jobs.
pub struct Runtime {
    pub config: Config,
    pub workspace: PathBuf,
    pub registry: Arc<JobRegistry>,
    pub history: RunHistory,
    pub orchestrator: Arc<Orchestrator>,
}

impl Runtime {
    /// Validate `config`, build the registry and executors, and load the
    /// persisted run history.
    pub async fn build(config: Config, config_path: &Path) -> Result<Self, RuntimeError> {
        config.validate()?;
        let registry = Arc::new(build_registry(&config)?);
        let workspace = config.workspace_dir(config_path);

        let history = if config.history.persist {
            let runs_dir = workspace.join(config::DEFAULT_RUNS_DIR);
            let store = Arc::new(FileRunLogStore::new(&runs_dir));
            RunHistory::with_store(store, config.history.limits())
        } else {
            RunHistory::new(config.history.limits())
        };
        let loaded = history
            .load(
                registry.list_jobs().iter().map(|j| j.id.as_str()),
                chrono::Utc::now(),
            )
            .await?;
        info!(jobs = registry.len(), records = loaded, "Loaded run history");

        let secrets = FileSecrets::new(
            config
                .secrets
                .dirs
                .iter()
                .map(|d| config::resolve_path(config_path, d))
                .collect(),
            config.secrets.env_prefix.clone(),
        );
        let executors = build_executors(&config, config_path, &secrets)?;
        let alerts = build_alert_channel(&config, &secrets)?;

        let orchestrator = Orchestrator::new(registry.clone(), executors, history.clone())
            .with_policies(config.retention_policies.clone())
            .with_alerts(alerts, AlertPolicy::from(&config.alerting));

        Ok(Self {
            config,
            workspace,
            registry,
            history,
            orchestrator: Arc::new(orchestrator),
        })
    }

    /// Scheduler service configured from the `scheduler` section.
    pub fn scheduler(&self) -> SchedulerService {
        SchedulerService::new(self.orchestrator.clone())
            .with_heartbeat(self.config.scheduler.heartbeat())
            .with_shutdown_grace(self.config.scheduler.shutdown_grace())
    }

    pub fn status_reporter(&self, scheduler: Option<&SchedulerHandle>) -> StatusReporter {
        let reporter = StatusReporter::new(self.registry.clone(), self.history.clone())
            .with_liveness_window(self.config.scheduler.liveness_window());
        match scheduler {
            Some(handle) => reporter.with_scheduler(handle.state()),
            None => reporter,
        }
    }
}

/// Build and validate the job registry alone.
pub fn build_registry(config: &Config) -> Result<JobRegistry, RegistryError> {
    JobRegistry::load(
        &config.jobs(),
        &config.retention_policies,
        &config.retry,
        config.scheduler.timezone,
    )
}

fn build_executors(
    config: &Config,
    config_path: &Path,
    secrets: &dyn SecretsProvider,
) -> Result<Executors, RuntimeError> {
    let mut executors = Executors::new();

    let local: Option<Arc<dyn SnapshotStore>> = config.snapshot.dataset.as_ref().map(|_| {
        Arc::new(
            ZfsSnapshotStore::new(Arc::new(LocalTransport))
                .with_binary(&config.snapshot.zfs_binary),
        ) as Arc<dyn SnapshotStore>
    });

    if let (Some(local), Some(dataset)) = (&local, &config.snapshot.dataset) {
        executors = executors.with(Arc::new(SnapshotExecutor::new(local.clone(), dataset)));

        let replication = &config.replication;
        if let (Some(host), Some(remote_dataset)) = (&replication.host, &replication.remote_dataset)
        {
            let mut ssh = SshTransport::new(host, &replication.user).with_port(replication.port);
            if let Some(key) = &replication.ssh_key {
                ssh = ssh.with_identity(config::resolve_path(config_path, key));
            }
            for option in &replication.ssh_options {
                ssh = ssh.with_option(option);
            }
            let ssh: Arc<dyn ReplicationTransport> = Arc::new(ssh);
            let remote: Arc<dyn SnapshotStore> =
                Arc::new(ZfsSnapshotStore::new(ssh).with_binary(&replication.zfs_binary));

            let mut executor =
                ReplicationExecutor::new(local.clone(), remote, dataset, remote_dataset);
            if let Some(filter) = &replication.snapshot_filter {
                executor = executor.with_snapshot_filter(filter);
            }
            executors = executors.with(Arc::new(executor));
        }
    }

    let cloud = &config.cloud;
    if let (Some(local_path), Some(bucket)) = (&cloud.local_path, &cloud.bucket) {
        let mut rclone = RcloneTransport::new(&cloud.remote)
            .with_binary(&cloud.rclone_binary)
            .with_parallelism(cloud.transfers, cloud.checkers);
        for (var, secret) in &cloud.env_secrets {
            rclone = rclone.with_env(var, secrets.get(secret)?);
        }
        executors = executors.with(Arc::new(CloudExecutor::new(
            Arc::new(rclone),
            config::resolve_path(config_path, local_path),
            bucket,
        )));
    }

    for tier in Tier::ALL {
        if executors.get(tier).is_none() {
            info!(tier = %tier, "No executor configured for tier");
        }
    }
    Ok(executors)
}

/// Webhook from `alerting.webhook_url`, else from the `webhook_secret`
/// secret, else the log channel.
fn build_alert_channel(
    config: &Config,
    secrets: &dyn SecretsProvider,
) -> Result<Arc<dyn AlertChannel>, RuntimeError> {
    let alerting = &config.alerting;
    if !alerting.enabled {
        return Ok(Arc::new(LogAlertChannel));
    }

    let url = match &alerting.webhook_url {
        Some(url) if !url.is_empty() => Some(url.clone()),
        _ => secrets.get_optional(&alerting.webhook_secret)?,
    };

    match url {
        Some(url) => Ok(Arc::new(WebhookAlertChannel::new(
            url,
            &alerting.service_name,
            Duration::from_secs(alerting.timeout_seconds),
        ))),
        None => {
            warn!("No alert webhook configured, alerts will only be logged");
            Ok(Arc::new(LogAlertChannel))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir, yaml: &str) -> (Config, PathBuf) {
        let path = dir.path().join("backtier.yaml");
        (serde_saphyr::from_str(yaml).unwrap(), path)
    }

    #[tokio::test]
    async fn builds_executors_for_configured_tiers() {
        let dir = TempDir::new().unwrap();
        let (config, path) = config_in(
            &dir,
            r#"
snapshot:
  dataset: tank/data
replication:
  host: backup.example.net
  remote_dataset: backup/data
cloud:
  local_path: /srv/data
  bucket: offsite
alerting:
  enabled: false
"#,
        );

        let runtime = Runtime::build(config, &path).await.unwrap();
        assert_eq!(runtime.registry.len(), 5);
        assert_eq!(runtime.workspace, dir.path().join(".backtier"));
        let executors = build_executors(
            &runtime.config,
            &path,
            &FileSecrets::new(Vec::new(), "BACKTIER_TEST_"),
        )
        .unwrap();
        for tier in Tier::ALL {
            assert!(executors.get(tier).is_some(), "missing executor for {tier}");
        }
    }

    #[tokio::test]
    async fn missing_tier_settings_fail_validation() {
        let dir = TempDir::new().unwrap();
        let (config, path) = config_in(&dir, "snapshot:\n  dataset: tank/data\n");

        let result = Runtime::build(config, &path).await;
        assert!(matches!(
            result,
            Err(RuntimeError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[tokio::test]
    async fn missing_cloud_secret_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (config, path) = config_in(
            &dir,
            r#"
cloud:
  local_path: /srv/data
  bucket: offsite
  env_secrets:
    RCLONE_CONFIG_B2_KEY: b2_application_key
jobs:
  - id: cloud-sync
    tier: cloud
    cadence: "0 5 * * 0"
"#,
        );

        let secrets = FileSecrets::new(vec![dir.path().join("secrets")], "BACKTIER_TEST_MISSING_");
        let result = build_executors(&config, &path, &secrets);
        assert!(matches!(
            result,
            Err(RuntimeError::Secret(SecretError::NotFound(_)))
        ));
    }

    #[test]
    fn webhook_url_comes_from_secret_when_not_inline() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("alert_webhook_url"), "https://hooks.example/x\n").unwrap();
        let secrets = FileSecrets::new(vec![dir.path().to_path_buf()], "BACKTIER_TEST_");

        let config = Config::default();
        assert!(build_alert_channel(&config, &secrets).is_ok());
        assert_eq!(
            secrets.get(&config.alerting.webhook_secret).unwrap(),
            "https://hooks.example/x"
        );
    }
}
