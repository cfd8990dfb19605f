//! Cloud transport backed by `rclone`.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::command::run;
use super::{CloudTransport, ObjectMeta, SyncStats, TransportError, TransportErrorKind};

#[derive(Debug, Clone)]
pub struct RcloneTransport {
    binary: String,
    remote: String,
    transfers: u32,
    checkers: u32,
    env: Vec<(String, String)>,
}

impl RcloneTransport {
    /// `remote` is the rclone remote name, without the trailing `:`.
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            binary: "rclone".to_string(),
            remote: remote.into(),
            transfers: 4,
            checkers: 8,
            env: Vec::new(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_parallelism(mut self, transfers: u32, checkers: u32) -> Self {
        self.transfers = transfers;
        self.checkers = checkers;
        self
    }

    /// Environment for the rclone process, e.g. `RCLONE_CONFIG_B2_KEY`.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn target(&self, bucket: &str) -> String {
        format!("{}:{}", self.remote, bucket)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        cmd
    }

    pub fn sync_args(&self, local_path: &Path, bucket: &str) -> Vec<String> {
        vec![
            "sync".to_string(),
            local_path.display().to_string(),
            self.target(bucket),
            "--transfers".to_string(),
            self.transfers.to_string(),
            "--checkers".to_string(),
            self.checkers.to_string(),
            "--use-json-log".to_string(),
            "--stats".to_string(),
            "1m".to_string(),
            "--stats-log-level".to_string(),
            "NOTICE".to_string(),
            "-v".to_string(),
        ]
    }
}

#[async_trait]
impl CloudTransport for RcloneTransport {
    async fn sync(
        &self,
        local_path: &Path,
        remote_bucket: &str,
    ) -> Result<SyncStats, TransportError> {
        if !local_path.exists() {
            return Err(TransportError::new(
                TransportErrorKind::InvalidDestination,
                format!("local path {} does not exist", local_path.display()),
            ));
        }

        let mut cmd = self.command();
        cmd.args(self.sync_args(local_path, remote_bucket));
        let output = run(cmd, "rclone sync").await?;

        let stats = parse_final_stats(&output.stderr).unwrap_or_else(|| {
            warn!("rclone reported no transfer statistics");
            SyncStats::default()
        });
        debug!(
            objects = stats.objects_transferred,
            bytes = stats.bytes_transferred,
            "rclone sync finished"
        );
        Ok(stats)
    }

    async fn list(&self, remote_bucket: &str) -> Result<Vec<ObjectMeta>, TransportError> {
        let mut cmd = self.command();
        cmd.args(["lsjson", "-R", "--files-only"])
            .arg(self.target(remote_bucket));
        let output = run(cmd, "rclone lsjson").await?;
        parse_listing(&output.stdout)
    }
}

// ============================================================================
// Output parsing
// ============================================================================

#[derive(Deserialize)]
struct LogLine {
    stats: Option<Stats>,
}

#[derive(Deserialize)]
struct Stats {
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    transfers: u64,
}

/// Last stats block in rclone's JSON log.
fn parse_final_stats(log: &str) -> Option<SyncStats> {
    log.lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<LogLine>(line.trim()).ok())
        .find_map(|line| line.stats)
        .map(|s| SyncStats {
            objects_transferred: s.transfers,
            bytes_transferred: s.bytes,
        })
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    path: String,
    size: i64,
    mod_time: DateTime<Utc>,
}

fn parse_listing(json: &str) -> Result<Vec<ObjectMeta>, TransportError> {
    let entries: Vec<ListEntry> = serde_json::from_str(json).map_err(|e| {
        TransportError::new(
            TransportErrorKind::Other,
            format!("unexpected rclone lsjson output: {e}"),
        )
    })?;
    Ok(entries
        .into_iter()
        .map(|e| ObjectMeta {
            key: e.path,
            size: e.size.max(0) as u64,
            modified_at: e.mod_time,
        })
        .collect())
}
