use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::io::ErrorKind;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use crate::task::{Invocation, OutputMode};
use crate::{atomic_write_bytes, atomic_write_json_pretty, shell_join};

/// Written into the output directory after a zero exit status.
pub const COMPLETED_MARKER: &str = "completed";
pub const TASK_RECORD: &str = "task.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    /// `exit_code` is `None` when the process was killed by a signal.
    Failed { exit_code: Option<i32> },
    Skipped,
}

/// Executes materialized invocations.
///
/// `slot` identifies the worker that runs the invocation, so an
/// implementation can pin concurrent runs to distinct cores.
pub trait Scheduler: Sync {
    fn execute(&self, invocation: &Invocation, slot: usize) -> Result<Outcome>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_tasks: Vec<String>,
}

impl BatchSummary {
    fn record(&mut self, name: &str, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed { .. } => {
                self.failed += 1;
                self.failed_tasks.push(name.to_string());
            }
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Runs simulator processes on this machine with a bounded worker pool.
#[derive(Debug, Clone)]
pub struct LocalScheduler {
    threads: usize,
    dry_run: bool,
}

impl Default for LocalScheduler {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

impl LocalScheduler {
    #[must_use]
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            dry_run: false,
        }
    }

    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs every invocation with at most `threads` processes alive at once.
    ///
    /// Launch failures are logged and counted as failed tasks; they never
    /// abort the rest of the batch.
    pub fn run_batch(&self, invocations: &[Invocation]) -> BatchSummary {
        let next = AtomicUsize::new(0);
        let summary = Mutex::new(BatchSummary::default());
        let workers = self.threads.min(invocations.len()).max(1);
        tracing::info!(tasks = invocations.len(), workers, dry_run = self.dry_run, "starting batch");

        thread::scope(|scope| {
            for slot in 0..workers {
                let next = &next;
                let summary = &summary;
                scope.spawn(move || loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(invocation) = invocations.get(index) else {
                        break;
                    };
                    let outcome = match self.execute(invocation, slot) {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            tracing::warn!(task = %invocation.name, error = %format!("{err:#}"), "task could not run");
                            Outcome::Failed { exit_code: None }
                        }
                    };
                    summary
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record(&invocation.name, outcome);
                });
            }
        });

        let summary = summary.into_inner().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "batch finished"
        );
        summary
    }

    /// Core that worker `slot` pins `invocation` to, if it has any cores.
    #[must_use]
    pub fn core_for(invocation: &Invocation, slot: usize) -> Option<usize> {
        if invocation.numactl_cores.is_empty() {
            None
        } else {
            Some(invocation.numactl_cores[slot % invocation.numactl_cores.len()])
        }
    }
}

impl Scheduler for LocalScheduler {
    fn execute(&self, invocation: &Invocation, slot: usize) -> Result<Outcome> {
        let marker = invocation.output_dir.join(COMPLETED_MARKER);
        if invocation.avoid_repeat && marker.exists() {
            tracing::info!(task = %invocation.name, "already completed, skipping");
            return Ok(Outcome::Skipped);
        }

        let command = invocation.command(Self::core_for(invocation, slot));
        if self.dry_run {
            tracing::info!(task = %invocation.name, command = %shell_join(&command), "dry run");
            return Ok(Outcome::Skipped);
        }

        fs::create_dir_all(&invocation.output_dir).with_context(|| {
            format!("failed to create {}", invocation.output_dir.display())
        })?;
        fs::create_dir_all(&invocation.workdir)
            .with_context(|| format!("failed to create {}", invocation.workdir.display()))?;

        // A stale marker from an earlier success must not outlive this run.
        match fs::remove_file(&marker) {
            Ok(()) => tracing::debug!(task = %invocation.name, "cleared previous completed marker"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove {}", marker.display()))
            }
        }

        let started_at = Utc::now();
        write_task_record(invocation, &command, started_at, RecordState::Running)?;

        let status = match launch(invocation, &command) {
            Ok(status) => status,
            Err(err) => {
                write_task_record(invocation, &command, started_at, RecordState::LaunchFailed)?;
                return Err(err);
            }
        };
        write_task_record(invocation, &command, started_at, RecordState::Exited(status))?;

        if status.success() {
            atomic_write_bytes(&marker, b"")?;
            tracing::info!(task = %invocation.name, "simulator completed");
            Ok(Outcome::Completed)
        } else {
            tracing::warn!(task = %invocation.name, exit_code = ?status.code(), "simulator failed");
            Ok(Outcome::Failed {
                exit_code: status.code(),
            })
        }
    }
}

fn launch(invocation: &Invocation, command: &[String]) -> Result<ExitStatus> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("task {} has an empty command", invocation.name))?;
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(&invocation.workdir);
    match invocation.output {
        OutputMode::File => {
            let stdout = invocation.stdout_path();
            let stderr = invocation.stderr_path();
            cmd.stdout(
                fs::File::create(&stdout)
                    .with_context(|| format!("failed to create {}", stdout.display()))?,
            );
            cmd.stderr(
                fs::File::create(&stderr)
                    .with_context(|| format!("failed to create {}", stderr.display()))?,
            );
        }
        OutputMode::Inherit => {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
    }

    tracing::info!(task = %invocation.name, command = %shell_join(command), "launching simulator");
    cmd.status()
        .with_context(|| format!("failed to launch {program}"))
}

#[derive(Debug, Clone, Copy)]
enum RecordState {
    Running,
    /// The process could not be started.
    LaunchFailed,
    Exited(ExitStatus),
}

fn write_task_record(
    invocation: &Invocation,
    command: &[String],
    started_at: DateTime<Utc>,
    state: RecordState,
) -> Result<()> {
    let (status, exit_code) = match state {
        RecordState::Running => ("running", None),
        RecordState::LaunchFailed => ("failed", None),
        RecordState::Exited(s) if s.success() => ("completed", s.code()),
        RecordState::Exited(s) => ("failed", s.code()),
    };
    let finished_at = match state {
        RecordState::Running => None,
        _ => Some(Utc::now().to_rfc3339()),
    };
    let payload = json!({
        "schema_version": "simlab_task_v1",
        "name": invocation.name,
        "workload": invocation.workload,
        "sub_phase": invocation.sub_phase,
        "command": command,
        "workdir": invocation.workdir,
        "status": status,
        "exit_code": exit_code,
        "started_at": started_at.to_rfc3339(),
        "finished_at": finished_at,
    });
    atomic_write_json_pretty(&invocation.output_dir.join(TASK_RECORD), &payload)
}
