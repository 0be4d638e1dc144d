use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use simlab_options::ResolvedConfig;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::task::{Invocation, SimulatorTask};

/// How checkpoints are laid out under the checkpoint root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CptLayout {
    /// Points listed in a simpoint summary JSON, `{workload: {point: weight}}`.
    Simpoint { summary: PathBuf },
    /// Every `<workload>/<point>/` directory that holds a file.
    Uniform,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub workload: String,
    pub point: String,
    pub weight: Option<f64>,
    pub file: PathBuf,
}

impl Checkpoint {
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.workload, self.point)
    }
}

/// A batch of checkpoint-restoring simulator runs.
#[derive(Debug, Clone)]
pub struct CptBatchDescription {
    data_dir: PathBuf,
    exe: PathBuf,
    top_output_dir: PathBuf,
    ver: String,
    layout: CptLayout,
    workload_filter: Vec<String>,
    tasks: Vec<SimulatorTask>,
}

impl CptBatchDescription {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        exe: impl Into<PathBuf>,
        top_output_dir: impl Into<PathBuf>,
        ver: impl Into<String>,
        layout: CptLayout,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            exe: exe.into(),
            top_output_dir: top_output_dir.into(),
            ver: ver.into(),
            layout,
            workload_filter: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Keeps only the named workloads; an empty filter keeps everything.
    pub fn set_task_filter<I, S>(&mut self, workloads: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.workload_filter = workloads.into_iter().map(Into::into).collect();
    }

    #[must_use]
    pub fn ver(&self) -> &str {
        &self.ver
    }

    #[must_use]
    pub fn top_output_dir(&self) -> &Path {
        &self.top_output_dir
    }

    fn keeps(&self, workload: &str) -> bool {
        self.workload_filter.is_empty() || self.workload_filter.iter().any(|w| w == workload)
    }

    /// Finds the checkpoint of every selected point, sorted by workload then point.
    pub fn discover(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = match &self.layout {
            CptLayout::Simpoint { summary } => self.discover_simpoints(summary)?,
            CptLayout::Uniform => self.discover_uniform()?,
        };
        checkpoints.sort_by(|a, b| (&a.workload, &a.point).cmp(&(&b.workload, &b.point)));
        tracing::info!(
            root = %self.data_dir.display(),
            checkpoints = checkpoints.len(),
            "discovered checkpoints"
        );
        Ok(checkpoints)
    }

    fn discover_simpoints(&self, summary: &Path) -> Result<Vec<Checkpoint>> {
        let text = fs::read_to_string(summary)
            .with_context(|| format!("failed to read simpoint summary {}", summary.display()))?;
        let points: BTreeMap<String, BTreeMap<String, Value>> = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse simpoint summary {}", summary.display()))?;

        let mut checkpoints = Vec::new();
        for (workload, weights) in points {
            if !self.keeps(&workload) {
                continue;
            }
            for (point, weight) in weights {
                let weight = parse_weight(&weight).ok_or_else(|| {
                    anyhow!(
                        "simpoint {workload}/{point} in {} has a non-numeric weight",
                        summary.display()
                    )
                })?;
                let dir = self.data_dir.join(&workload).join(&point);
                match first_file_in_dir(&dir) {
                    Some(file) => checkpoints.push(Checkpoint {
                        workload: workload.clone(),
                        point,
                        weight: Some(weight),
                        file,
                    }),
                    None => tracing::warn!(dir = %dir.display(), "no checkpoint file, skipping point"),
                }
            }
        }
        Ok(checkpoints)
    }

    fn discover_uniform(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        let walker = WalkDir::new(&self.data_dir)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry
                .with_context(|| format!("failed to scan {}", self.data_dir.display()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let rel = entry.path().strip_prefix(&self.data_dir)?;
            let mut parts = rel.iter().map(|p| p.to_string_lossy().to_string());
            let (Some(workload), Some(point)) = (parts.next(), parts.next()) else {
                continue;
            };
            if !self.keeps(&workload) {
                continue;
            }
            if let Some(file) = first_file_in_dir(entry.path()) {
                checkpoints.push(Checkpoint {
                    workload,
                    point,
                    weight: None,
                    file,
                });
            }
        }
        Ok(checkpoints)
    }

    /// Creates one task per checkpoint, each with its own copy of `config`'s options.
    pub fn set_conf(&mut self, config: &ResolvedConfig, task_name: &str) -> Result<()> {
        let checkpoints = self.discover()?;
        let mut tasks = Vec::with_capacity(checkpoints.len());
        for cpt in checkpoints {
            let mut task = SimulatorTask::new(
                &self.exe,
                &self.top_output_dir,
                task_name,
                &cpt.workload,
                &cpt.point,
            )
            .with_cpt_file(&cpt.file);
            task.apply_config(config)?;
            tasks.push(task);
        }
        tracing::debug!(variant = %config.name, tasks = tasks.len(), "configured batch");
        self.tasks = tasks;
        Ok(())
    }

    /// Keeps the share of tasks that belongs to `machine_index` of `n_machines`.
    ///
    /// Hashed mode assigns each task by the SHA-256 of `<workload>/<point>`,
    /// so the split is stable when the task list changes. Otherwise the
    /// ordered list is cut into contiguous chunks.
    pub fn filter_tasks(
        &mut self,
        hashed: bool,
        n_machines: usize,
        machine_index: usize,
    ) -> Result<()> {
        if n_machines == 0 || machine_index >= n_machines {
            return Err(anyhow!(
                "machine index {machine_index} is out of range for {n_machines} machines"
            ));
        }
        let before = self.tasks.len();
        if hashed {
            self.tasks.retain(|task| {
                let key = format!("{}/{}", task.workload(), task.sub_phase());
                machine_for(&key, n_machines) == machine_index
            });
        } else {
            let chunk = before.div_ceil(n_machines);
            let start = (chunk * machine_index).min(before);
            let end = (start + chunk).min(before);
            self.tasks.truncate(end);
            self.tasks.drain(..start);
        }
        tracing::info!(
            machine_index,
            n_machines,
            kept = self.tasks.len(),
            total = before,
            "partitioned batch"
        );
        Ok(())
    }

    /// Allows every task to be pinned to one of `cores`.
    pub fn set_numactl(&mut self, cores: &[usize]) {
        for task in &mut self.tasks {
            task.set_numactl(cores);
        }
    }

    #[must_use]
    pub fn tasks(&self) -> &[SimulatorTask] {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut [SimulatorTask] {
        &mut self.tasks
    }

    pub fn invocations(&self) -> Result<Vec<Invocation>> {
        self.tasks.iter().map(SimulatorTask::materialize).collect()
    }
}

/// Machine that owns `key` under hashed partitioning.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn machine_for(key: &str, n_machines: usize) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    tracing::trace!(key, digest = %hex::encode(digest), "hashed task key");
    (u64::from_be_bytes(prefix) % n_machines as u64) as usize
}

fn parse_weight(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// First regular file in `dir` by name.
fn first_file_in_dir(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
}
