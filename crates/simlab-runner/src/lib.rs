//! Turning resolved simulator configurations into runnable tasks and running them.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::Path;

pub mod batch;
pub mod local_config;
pub mod scheduler;
pub mod task;

pub use batch::{Checkpoint, CptBatchDescription, CptLayout};
pub use local_config::{LocalConfig, Machine, LOCAL_CONFIG_ENV};
pub use scheduler::{BatchSummary, LocalScheduler, Outcome, Scheduler, COMPLETED_MARKER};
pub use task::{Invocation, OutputMode, PathFormat, SimulatorTask};

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{name}.tmp.{pid}.{ts}"));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Joins a command for display so it can be pasted into a shell.
#[must_use]
pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

#[must_use]
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_join_quotes_only_when_needed() {
        let parts = vec![
            "/opt/gem5.opt".to_string(),
            "--debug-flags=Fetch,DQ".to_string(),
            "echo hi; exit 1".to_string(),
            String::new(),
            "it's".to_string(),
        ];
        assert_eq!(
            shell_join(&parts),
            "/opt/gem5.opt --debug-flags=Fetch,DQ 'echo hi; exit 1' '' 'it'\"'\"'s'"
        );
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = std::env::temp_dir().join(format!(
            "simlab_atomic_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = dir.join("nested/task.json");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_bytes(&path, b"second").expect("second write");
        assert_eq!(fs::read(&path).unwrap(), b"second");
        let leftovers = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
        let _ = fs::remove_dir_all(dir);
    }
}
