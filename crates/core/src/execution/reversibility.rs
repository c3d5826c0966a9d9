use std::collections::BTreeMap;

use crate::domain::execution::{ReversalMethod, ReversibilityInfo, StateSnapshot};

/// Derives undo metadata from the snapshots around an execution.
///
/// `after` is `None` when the runner failed; the result is then computed from
/// the before-snapshot alone, treating every tracked path as possibly touched.
pub fn derive_reversibility(
    before: Option<&StateSnapshot>,
    after: Option<&StateSnapshot>,
) -> ReversibilityInfo {
    let Some(before) = before else {
        return ReversibilityInfo::irreversible("no before-snapshot was captured");
    };

    let mut backup_files = BTreeMap::new();
    let mut undo_commands = Vec::new();
    let mut unrecoverable = Vec::new();

    for (path, state) in &before.files {
        let after_state = after.and_then(|snapshot| snapshot.files.get(path));
        let unchanged = after_state.is_some_and(|after_state| {
            after_state.exists == state.exists && after_state.hash == state.hash
        });
        if unchanged {
            continue;
        }

        match (state.exists, &state.backup_path) {
            (true, Some(backup)) => {
                backup_files.insert(path.clone(), backup.clone());
            }
            (true, None) => unrecoverable.push(path.clone()),
            (false, _) => {
                let created = after.is_none() || after_state.is_some_and(|state| state.exists);
                if created {
                    undo_commands.push(format!("rm -f {}", shell_quote(path)));
                }
            }
        }
    }

    if let Some(after) = after {
        for pid in after.processes.iter().filter(|pid| !before.processes.contains(pid)) {
            undo_commands.push(format!("kill {pid}"));
        }
    }

    if !unrecoverable.is_empty() {
        return ReversibilityInfo {
            reversible: false,
            method: ReversalMethod::None,
            undo_commands,
            backup_files,
            reason: format!("no backup exists for {}", unrecoverable.join(", ")),
        };
    }

    let (method, reason) = if !backup_files.is_empty() {
        (ReversalMethod::RestoreBackup, format!("{} file(s) can be restored from backup", backup_files.len()))
    } else if !undo_commands.is_empty() {
        (ReversalMethod::InverseCommand, "created state can be removed by inverse commands".to_string())
    } else {
        (ReversalMethod::None, "no tracked state was modified".to_string())
    };

    if method == ReversalMethod::RestoreBackup {
        for (original, backup) in &backup_files {
            undo_commands.push(format!("cp {} {}", shell_quote(backup), shell_quote(original)));
        }
    }

    ReversibilityInfo { reversible: true, method, undo_commands, backup_files, reason }
}

fn shell_quote(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-')) {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::derive_reversibility;
    use crate::domain::execution::{FileState, ReversalMethod, StateSnapshot};

    fn snapshot(files: &[(&str, bool, Option<&str>, Option<&str>)], processes: &[u32]) -> StateSnapshot {
        let mut snapshot = StateSnapshot::empty();
        for (path, exists, hash, backup) in files {
            snapshot.files.insert(
                path.to_string(),
                FileState {
                    exists: *exists,
                    hash: hash.map(str::to_string),
                    backup_path: backup.map(str::to_string),
                },
            );
        }
        snapshot.processes = processes.to_vec();
        snapshot
    }

    #[test]
    fn modified_file_restores_from_backup() {
        let before = snapshot(&[("/tmp/notes.txt", true, Some("h1"), Some("/b/0-notes.txt"))], &[]);
        let after = snapshot(&[("/tmp/notes.txt", true, Some("h2"), None)], &[]);

        let info = derive_reversibility(Some(&before), Some(&after));

        assert!(info.reversible);
        assert_eq!(info.method, ReversalMethod::RestoreBackup);
        assert_eq!(info.backup_files["/tmp/notes.txt"], "/b/0-notes.txt");
        assert_eq!(info.undo_commands, vec!["cp /b/0-notes.txt /tmp/notes.txt".to_string()]);
    }

    #[test]
    fn created_file_and_spawned_process_use_inverse_commands() {
        let before = snapshot(&[("/tmp/new.txt", false, None, None)], &[]);
        let after = snapshot(&[("/tmp/new.txt", true, Some("h"), None)], &[77]);

        let info = derive_reversibility(Some(&before), Some(&after));

        assert_eq!(info.method, ReversalMethod::InverseCommand);
        assert_eq!(info.undo_commands, vec!["rm -f /tmp/new.txt".to_string(), "kill 77".to_string()]);
    }

    #[test]
    fn failure_uses_before_snapshot_only() {
        let before = snapshot(
            &[
                ("/tmp/notes.txt", true, Some("h1"), Some("/b/0-notes.txt")),
                ("/tmp/new file.txt", false, None, None),
            ],
            &[],
        );

        let info = derive_reversibility(Some(&before), None);

        assert!(info.reversible);
        assert_eq!(info.method, ReversalMethod::RestoreBackup);
        assert!(info.undo_commands.contains(&"rm -f '/tmp/new file.txt'".to_string()));
    }

    #[test]
    fn missing_snapshot_or_backup_is_irreversible() {
        assert!(!derive_reversibility(None, None).reversible);

        let before = snapshot(&[("/tmp/big.bin", true, Some("h"), None)], &[]);
        let info = derive_reversibility(Some(&before), None);
        assert!(!info.reversible);
        assert!(info.reason.contains("/tmp/big.bin"));
    }

    #[test]
    fn untouched_state_needs_no_undo() {
        let before = snapshot(&[("/tmp/notes.txt", true, Some("h1"), Some("/b/0"))], &[]);
        let after = snapshot(&[("/tmp/notes.txt", true, Some("h1"), None)], &[]);

        let info = derive_reversibility(Some(&before), Some(&after));

        assert!(info.reversible);
        assert_eq!(info.method, ReversalMethod::None);
        assert!(info.undo_commands.is_empty());
    }
}
