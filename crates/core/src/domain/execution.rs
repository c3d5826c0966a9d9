use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub files_affected: Vec<String>,
    #[serde(default)]
    pub processes_spawned: Vec<u32>,
}

impl ExecutionResult {
    pub fn failed(stderr: impl Into<String>, exit_code: Option<i32>, duration_ms: u64) -> Self {
        Self {
            success: false,
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms,
            files_affected: Vec::new(),
            processes_spawned: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub exists: bool,
    pub hash: Option<String>,
    pub backup_path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub timestamp: DateTime<Utc>,
    /// Touched path to its captured state.
    pub files: BTreeMap<String, FileState>,
    pub processes: Vec<u32>,
    pub metrics: BTreeMap<String, f64>,
}

impl StateSnapshot {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            files: BTreeMap::new(),
            processes: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReversalMethod {
    RestoreBackup,
    InverseCommand,
    None,
}

impl ReversalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RestoreBackup => "restore_backup",
            Self::InverseCommand => "inverse_command",
            Self::None => "none",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversibilityInfo {
    pub reversible: bool,
    pub method: ReversalMethod,
    #[serde(default)]
    pub undo_commands: Vec<String>,
    /// Original path to backup path.
    #[serde(default)]
    pub backup_files: BTreeMap<String, String>,
    #[serde(default)]
    pub reason: String,
}

impl ReversibilityInfo {
    pub fn irreversible(reason: impl Into<String>) -> Self {
        Self {
            reversible: false,
            method: ReversalMethod::None,
            undo_commands: Vec::new(),
            backup_files: BTreeMap::new(),
            reason: reason.into(),
        }
    }
}
