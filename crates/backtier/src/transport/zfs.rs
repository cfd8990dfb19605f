//! ZFS snapshot store over a command transport.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use super::{
    ReplicationTransport, SnapshotRef, SnapshotStore, SnapshotStream, TransportError,
    TransportErrorKind,
};

/// Snapshot store backed by the `zfs` CLI, locally or over SSH.
#[derive(Clone)]
pub struct ZfsSnapshotStore {
    transport: Arc<dyn ReplicationTransport>,
    binary: String,
}

impl ZfsSnapshotStore {
    pub fn new(transport: Arc<dyn ReplicationTransport>) -> Self {
        Self {
            transport,
            binary: "zfs".to_string(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

#[async_trait]
impl SnapshotStore for ZfsSnapshotStore {
    fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    async fn create(&self, dataset: &str, name: &str) -> Result<SnapshotRef, TransportError> {
        check_component(name)?;
        let snapshot = SnapshotRef::new(dataset, name, Utc::now());
        let full = snapshot.full_name();
        self.transport
            .execute(&[self.binary.as_str(), "snapshot", full.as_str()])
            .await?;
        Ok(snapshot)
    }

    async fn list(&self, dataset: &str) -> Result<Vec<SnapshotRef>, TransportError> {
        let output = self
            .transport
            .execute(&[
                self.binary.as_str(),
                "list",
                "-H",
                "-p",
                "-t",
                "snapshot",
                "-o",
                "name,creation",
                "-s",
                "creation",
                "-d",
                "1",
                dataset,
            ])
            .await?;
        Ok(parse_snapshot_list(&output, dataset))
    }

    async fn destroy(&self, snapshot: &SnapshotRef) -> Result<(), TransportError> {
        // A bare dataset name here would destroy the dataset itself.
        check_component(&snapshot.name)?;
        let full = snapshot.full_name();
        self.transport
            .execute(&[self.binary.as_str(), "destroy", full.as_str()])
            .await?;
        Ok(())
    }

    async fn send(
        &self,
        snapshot: &SnapshotRef,
        base: Option<&SnapshotRef>,
    ) -> Result<SnapshotStream, TransportError> {
        let full = snapshot.full_name();
        let base_arg = base.map(|b| format!("@{}", b.name));
        let mut argv: Vec<&str> = vec![self.binary.as_str(), "send", "-w"];
        if let Some(base) = &base_arg {
            argv.push("-i");
            argv.push(base);
        }
        argv.push(&full);
        self.transport.open(&argv).await
    }

    async fn receive(&self, stream: SnapshotStream, dataset: &str) -> Result<u64, TransportError> {
        self.transport
            .deliver(&[self.binary.as_str(), "recv", "-F", dataset], stream)
            .await
    }
}

fn check_component(name: &str) -> Result<(), TransportError> {
    if name.is_empty() || name.contains(['@', '/', ' ']) {
        return Err(TransportError::new(
            TransportErrorKind::InvalidDestination,
            format!("invalid snapshot name '{name}'"),
        ));
    }
    Ok(())
}

/// Parse `zfs list -H -p -o name,creation` output.
fn parse_snapshot_list(output: &str, dataset: &str) -> Vec<SnapshotRef> {
    let mut snapshots = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let mut cols = line.split('\t');
        let (Some(full), Some(creation)) = (cols.next(), cols.next()) else {
            warn!(line = %line, "Unexpected zfs list line");
            continue;
        };
        let Some((ds, name)) = full.split_once('@') else {
            continue;
        };
        if ds != dataset {
            continue;
        }
        let Some(created_at) = creation
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        else {
            warn!(line = %line, "Unparsable snapshot creation time");
            continue;
        };
        snapshots.push(SnapshotRef::new(ds, name, created_at));
    }
    snapshots.sort();
    snapshots
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records command lines and replays canned stdout.
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<Vec<String>>>,
        stdout: String,
    }

    #[async_trait]
    impl ReplicationTransport for RecordingTransport {
        fn endpoint(&self) -> &str {
            "recording"
        }

        async fn execute(&self, argv: &[&str]) -> Result<String, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push(argv.iter().map(|s| s.to_string()).collect());
            Ok(self.stdout.clone())
        }

        async fn open(&self, argv: &[&str]) -> Result<SnapshotStream, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push(argv.iter().map(|s| s.to_string()).collect());
            Ok(SnapshotStream::from_bytes(b"stream".to_vec()))
        }

        async fn deliver(
            &self,
            argv: &[&str],
            stream: SnapshotStream,
        ) -> Result<u64, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push(argv.iter().map(|s| s.to_string()).collect());
            Ok(stream.read_to_end().await?.len() as u64)
        }
    }

    fn store(stdout: &str) -> (Arc<RecordingTransport>, ZfsSnapshotStore) {
        let transport = Arc::new(RecordingTransport {
            stdout: stdout.to_string(),
            ..Default::default()
        });
        (transport.clone(), ZfsSnapshotStore::new(transport))
    }

    #[test]
    fn parses_and_sorts_list_output() {
        let output = "tank/a@weekly-2\t1767600000\n\
                      tank/a@daily-1\t1767500000\n\
                      tank/a/child@x\t1767000000\n\
                      garbage\n";
        let snaps = parse_snapshot_list(output, "tank/a");
        let names: Vec<&str> = snaps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["daily-1", "weekly-2"]);
        assert_eq!(snaps[0].created_at.timestamp(), 1_767_500_000);
    }

    #[tokio::test]
    async fn create_and_destroy_issue_zfs_commands() {
        let (transport, zfs) = store("");
        let snap = zfs.create("tank/a", "daily-20260101-030000").await.unwrap();
        zfs.destroy(&snap).await.unwrap();

        let calls = transport.calls.lock().unwrap().clone();
        assert_eq!(calls[0], ["zfs", "snapshot", "tank/a@daily-20260101-030000"]);
        assert_eq!(calls[1], ["zfs", "destroy", "tank/a@daily-20260101-030000"]);
    }

    #[tokio::test]
    async fn refuses_to_destroy_without_snapshot_name() {
        let (transport, zfs) = store("");
        let bogus = SnapshotRef::new("tank/a", "", Utc::now());
        let err = zfs.destroy(&bogus).await.unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::InvalidDestination);
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_is_raw_and_incremental_from_base() {
        let (transport, zfs) = store("");
        let now = Utc::now();
        let base = SnapshotRef::new("tank/a", "daily-1", now);
        let next = SnapshotRef::new("tank/a", "daily-2", now);

        let stream = zfs.send(&next, Some(&base)).await.unwrap();
        let bytes = zfs.receive(stream, "backup/a").await.unwrap();
        assert_eq!(bytes, 6);

        let calls = transport.calls.lock().unwrap().clone();
        assert_eq!(calls[0], ["zfs", "send", "-w", "-i", "@daily-1", "tank/a@daily-2"]);
        assert_eq!(calls[1], ["zfs", "recv", "-F", "backup/a"]);
    }
}
