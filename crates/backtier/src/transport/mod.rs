//! Abstractions over the systems that hold backup data.
//!
//! ```text
//! SnapshotStore        create / list / destroy / send / receive   (ZfsSnapshotStore)
//!   └── ReplicationTransport   run a command, stream bytes into one   (LocalTransport, SshTransport)
//! CloudTransport       sync a local tree to a bucket, list it     (RcloneTransport)
//! ```
//!
//! Every failure is a [`TransportError`] whose [`TransportErrorKind`] lets
//! executors decide between retrying and giving up. The [`memory`] module
//! has in-process implementations of both store traits.

mod command;
pub mod memory;
mod rclone;
mod zfs;

pub use command::{LocalTransport, SshTransport, shell_quote};
pub use rclone::RcloneTransport;
pub use zfs::ZfsSnapshotStore;

use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    Connectivity,
    Auth,
    StoreFull,
    StoreDegraded,
    Quota,
    Permission,
    RateLimited,
    InvalidDestination,
    NotFound,
    Other,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connectivity => "connectivity",
            Self::Auth => "auth",
            Self::StoreFull => "store_full",
            Self::StoreDegraded => "store_degraded",
            Self::Quota => "quota",
            Self::Permission => "permission",
            Self::RateLimited => "rate_limited",
            Self::InvalidDestination => "invalid_destination",
            Self::NotFound => "not_found",
            Self::Other => "other",
        }
    }

    /// Best-effort classification of a tool's diagnostic output.
    pub fn from_output(output: &str) -> Self {
        let lower = output.to_ascii_lowercase();
        ERROR_PATTERNS
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
            .map_or(Self::Other, |(kind, _)| *kind)
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checked in order; the first matching kind wins.
const ERROR_PATTERNS: &[(TransportErrorKind, &[&str])] = &[
    (
        TransportErrorKind::Auth,
        &[
            "permission denied (publickey",
            "host key verification failed",
            "authentication failed",
            "unauthorized",
            "bad_auth_token",
            "expired_auth_token",
            "invalid credentials",
            "invalidaccesskeyid",
            "signaturedoesnotmatch",
        ],
    ),
    (
        TransportErrorKind::StoreFull,
        &["out of space", "no space left", "disk quota exceeded"],
    ),
    (
        TransportErrorKind::Quota,
        &[
            "cap_exceeded",
            "storage_cap",
            "quota exceeded",
            "quotaexceeded",
            "insufficient storage",
        ],
    ),
    (
        TransportErrorKind::RateLimited,
        &[
            "too many requests",
            "(429)",
            "rate limit",
            "ratelimit",
            "slowdown",
            "slow down",
            "service unavailable",
        ],
    ),
    (
        TransportErrorKind::Permission,
        &[
            "accessdenied",
            "access denied",
            "forbidden",
            "permission denied",
            "operation not permitted",
        ],
    ),
    (
        TransportErrorKind::StoreDegraded,
        &[
            "pool i/o is currently suspended",
            "i/o error",
            "degraded",
            "faulted",
            "checksum mismatch",
        ],
    ),
    (
        TransportErrorKind::InvalidDestination,
        &[
            "dataset does not exist",
            "no such pool",
            "invalid dataset name",
            "nosuchbucket",
            "bucket not found",
            "directory not found",
            "didn't find section in config file",
        ],
    ),
    (TransportErrorKind::Timeout, &["timed out", "timeout"]),
    (
        TransportErrorKind::Connectivity,
        &[
            "could not resolve hostname",
            "temporary failure in name resolution",
            "connection refused",
            "connection reset",
            "connection closed",
            "no route to host",
            "network is unreachable",
            "broken pipe",
            "kex_exchange_identification",
        ],
    ),
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A failed command, classified from its stderr.
    pub fn from_output(what: &str, stderr: &str) -> Self {
        let stderr = stderr.trim();
        Self {
            kind: TransportErrorKind::from_output(stderr),
            message: if stderr.is_empty() {
                format!("{what} failed")
            } else {
                format!("{what} failed: {stderr}")
            },
        }
    }

    /// A command that could not be started or waited on.
    pub fn spawn(what: &str, error: std::io::Error) -> Self {
        let kind = match error.kind() {
            std::io::ErrorKind::NotFound => TransportErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => TransportErrorKind::Permission,
            _ => TransportErrorKind::Other,
        };
        Self::new(kind, format!("{what}: {error}"))
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// A snapshot of a dataset, ordered by creation time then name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub dataset: String,
    /// Short name after the `@`.
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl SnapshotRef {
    pub fn new(
        dataset: impl Into<String>,
        name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            name: name.into(),
            created_at,
        }
    }

    /// `dataset@name`
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.dataset, self.name)
    }
}

impl Ord for SnapshotRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.dataset.cmp(&other.dataset))
    }
}

impl PartialOrd for SnapshotRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

type Completion = BoxFuture<'static, Result<(), TransportError>>;

/// A snapshot's serialized bytes plus a future that resolves once the
/// producer has exited, reporting whether the stream was complete.
pub struct SnapshotStream {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    completion: Completion,
}

impl SnapshotStream {
    pub fn new<R, F>(reader: R, completion: F) -> Self
    where
        R: AsyncRead + Send + 'static,
        F: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        Self {
            reader: Box::pin(reader),
            completion: Box::pin(completion),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::new(std::io::Cursor::new(bytes), async { Ok(()) })
    }

    pub fn into_parts(self) -> (Pin<Box<dyn AsyncRead + Send>>, Completion) {
        (self.reader, self.completion)
    }

    /// Drain the stream into memory and check the producer's result.
    pub async fn read_to_end(self) -> Result<Vec<u8>, TransportError> {
        let (mut reader, completion) = self.into_parts();
        let mut bytes = Vec::new();
        let read = reader.read_to_end(&mut bytes).await;
        drop(reader);
        completion.await?;
        read.map_err(|e| {
            TransportError::new(
                TransportErrorKind::Connectivity,
                format!("stream interrupted: {e}"),
            )
        })?;
        Ok(bytes)
    }
}

impl fmt::Debug for SnapshotStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStream").finish_non_exhaustive()
    }
}

/// Snapshot primitives of a copy-on-write filesystem.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Where the store lives, for logs (`local`, `root@backup-host`).
    fn endpoint(&self) -> &str;

    async fn create(&self, dataset: &str, name: &str) -> Result<SnapshotRef, TransportError>;

    /// Snapshots of `dataset`, oldest first.
    async fn list(&self, dataset: &str) -> Result<Vec<SnapshotRef>, TransportError>;

    async fn destroy(&self, snapshot: &SnapshotRef) -> Result<(), TransportError>;

    /// Serialize `snapshot`, incrementally from `base` when given.
    async fn send(
        &self,
        snapshot: &SnapshotRef,
        base: Option<&SnapshotRef>,
    ) -> Result<SnapshotStream, TransportError>;

    /// Apply a stream to `dataset`, returning the number of bytes consumed.
    async fn receive(&self, stream: SnapshotStream, dataset: &str) -> Result<u64, TransportError>;
}

/// Command execution and byte-stream delivery on some endpoint.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Run a command to completion and return its stdout.
    async fn execute(&self, argv: &[&str]) -> Result<String, TransportError>;

    /// Start a command and expose its stdout as a stream.
    async fn open(&self, argv: &[&str]) -> Result<SnapshotStream, TransportError>;

    /// Run a command with `stream` on its stdin; returns bytes delivered.
    async fn deliver(&self, argv: &[&str], stream: SnapshotStream) -> Result<u64, TransportError>;
}

// ============================================================================
// Object storage
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub objects_transferred: u64,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

#[async_trait]
pub trait CloudTransport: Send + Sync {
    /// Make `remote_bucket` mirror `local_path`.
    async fn sync(&self, local_path: &Path, remote_bucket: &str)
    -> Result<SyncStats, TransportError>;

    async fn list(&self, remote_bucket: &str) -> Result<Vec<ObjectMeta>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn classifies_common_tool_errors() {
        use TransportErrorKind::*;
        let cases = [
            ("root@10.0.0.2: Permission denied (publickey).", Auth),
            ("ssh: Could not resolve hostname backup: Name or service not known", Connectivity),
            ("ssh: connect to host 10.0.0.2 port 22: Connection timed out", Timeout),
            ("cannot create snapshot 'tank/a@x': out of space", StoreFull),
            ("cannot create snapshot 'tank/a@x': disk quota exceeded", StoreFull),
            ("Quota exceeded for bucket offsite", Quota),
            ("cannot open 'tank': pool I/O is currently suspended", StoreDegraded),
            ("cannot open 'tank/missing': dataset does not exist", InvalidDestination),
            ("Failed to copy: storage_cap_exceeded (403)", Quota),
            ("HTTP error 429 Too Many Requests", RateLimited),
            ("AccessDenied: not entitled (403)", Permission),
            ("bad_auth_token (401)", Auth),
            ("something unexpected", Other),
        ];
        for (stderr, kind) in cases {
            assert_eq!(TransportErrorKind::from_output(stderr), kind, "{stderr}");
        }
    }

    #[test]
    fn error_message_includes_trimmed_stderr() {
        let err = TransportError::from_output("zfs snapshot", "  out of space\n");
        assert_eq!(err.kind, TransportErrorKind::StoreFull);
        assert_eq!(err.message, "zfs snapshot failed: out of space");
        assert_eq!(err.to_string(), "store_full: zfs snapshot failed: out of space");

        let silent = TransportError::from_output("zfs list", "");
        assert_eq!(silent.message, "zfs list failed");
    }

    #[test]
    fn snapshot_refs_order_by_creation_then_name() {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let a = SnapshotRef::new("tank/a", "daily-b", t);
        let b = SnapshotRef::new("tank/a", "daily-a", t + chrono::Duration::seconds(1));
        let c = SnapshotRef::new("tank/a", "daily-c", t);
        let mut all = vec![b.clone(), c.clone(), a.clone()];
        all.sort();
        assert_eq!(all, vec![a, c, b]);
        assert_eq!(all[0].full_name(), "tank/a@daily-b");
    }

    #[tokio::test]
    async fn stream_reports_producer_failure() {
        let failing = SnapshotStream::new(std::io::Cursor::new(b"partial".to_vec()), async {
            Err(TransportError::new(TransportErrorKind::Other, "send aborted"))
        });
        let err = failing.read_to_end().await.unwrap_err();
        assert_eq!(err.message, "send aborted");

        let ok = SnapshotStream::from_bytes(b"whole".to_vec());
        assert_eq!(ok.read_to_end().await.unwrap(), b"whole");
    }
}
