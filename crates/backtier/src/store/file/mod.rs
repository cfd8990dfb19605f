//! File-based storage implementations.
//!
//! JSONL for append-only logs. Rewrites go through a temp file and a rename
//! so a crash never leaves a truncated log.

mod run_log;

pub use run_log::FileRunLogStore;

use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::error::{StorageError, StorageResult};

/// Write `contents` to `temp_path`, fsync, then rename over `path`.
pub(crate) async fn atomic_write_file(
    temp_path: &Path,
    path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let mut file = fs::File::create(temp_path)
        .await
        .map_err(|e| StorageError::file_io(temp_path, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| StorageError::file_io(temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StorageError::file_io(temp_path, e))?;
    drop(file);

    fs::rename(temp_path, path)
        .await
        .map_err(|e| StorageError::file_io(path, e))
}
