use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::domain::execution::{FileState, StateSnapshot};
use crate::domain::operation::OperationId;

/// Captures the state of touched paths before and after an operation runs.
#[derive(Clone, Debug)]
pub struct StateCapture {
    backup_dir: PathBuf,
}

impl StateCapture {
    /// Create a capture that writes backups under `backup_dir`
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self { backup_dir: backup_dir.into() }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Snapshot taken before execution.
    ///
    /// Every existing regular file is hashed and copied to
    /// `<backup_dir>/<operation_id>/<index>-<file name>` so it can be restored.
    /// Paths that do not exist yet are recorded with `exists = false`.
    pub async fn capture_before(
        &self,
        operation_id: &OperationId,
        paths: &[PathBuf],
    ) -> io::Result<StateSnapshot> {
        let mut snapshot = StateSnapshot::empty();
        let backup_root = self.backup_dir.join(operation_id.as_str());
        let mut total_bytes = 0u64;

        for (index, path) in paths.iter().enumerate() {
            let key = path.display().to_string();
            let Some(contents) = read_regular_file(path).await? else {
                snapshot.files.insert(key, FileState { exists: path.exists(), hash: None, backup_path: None });
                continue;
            };

            total_bytes += contents.len() as u64;
            tokio::fs::create_dir_all(&backup_root).await?;
            let file_name = path.file_name().map(|name| name.to_string_lossy().into_owned());
            let backup_path =
                backup_root.join(format!("{index}-{}", file_name.unwrap_or_else(|| "file".to_string())));
            tokio::fs::write(&backup_path, &contents).await?;

            snapshot.files.insert(
                key,
                FileState {
                    exists: true,
                    hash: Some(hash_bytes(&contents)),
                    backup_path: Some(backup_path.display().to_string()),
                },
            );
        }

        snapshot.metrics = coarse_metrics(&snapshot.files, total_bytes);
        Ok(snapshot)
    }

    /// Snapshot taken after a successful run. No backups are made.
    pub async fn capture_after(
        &self,
        paths: &[PathBuf],
        spawned_processes: &[u32],
    ) -> io::Result<StateSnapshot> {
        let mut files = BTreeMap::new();
        let mut total_bytes = 0u64;

        for path in paths {
            let state = match read_regular_file(path).await? {
                Some(contents) => {
                    total_bytes += contents.len() as u64;
                    FileState { exists: true, hash: Some(hash_bytes(&contents)), backup_path: None }
                }
                None => FileState { exists: path.exists(), hash: None, backup_path: None },
            };
            files.insert(path.display().to_string(), state);
        }

        Ok(StateSnapshot {
            timestamp: Utc::now(),
            metrics: coarse_metrics(&files, total_bytes),
            files,
            processes: spawned_processes.to_vec(),
        })
    }
}

async fn read_regular_file(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => tokio::fs::read(path).await.map(Some),
        Ok(_) => Ok(None),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

fn hash_bytes(contents: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents);
    format!("{:x}", hasher.finalize())
}

fn coarse_metrics(files: &BTreeMap<String, FileState>, total_bytes: u64) -> BTreeMap<String, f64> {
    let existing = files.values().filter(|state| state.exists).count();
    BTreeMap::from([
        ("tracked_files".to_string(), files.len() as f64),
        ("existing_files".to_string(), existing as f64),
        ("total_bytes".to_string(), total_bytes as f64),
    ])
}
