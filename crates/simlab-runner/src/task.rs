use anyhow::{anyhow, Result};
use serde::Serialize;
use simlab_options::{OptionSet, OptionValue, ResolvedConfig};
use std::path::{Path, PathBuf};

use crate::scheduler::{Outcome, Scheduler};

pub const STDOUT_FILE: &str = "simulator_out.txt";
pub const STDERR_FILE: &str = "simulator_err.txt";

/// How the output directory is derived from the task identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathFormat {
    /// `<top>/<task_name>/<workload>`
    WorkloadLevel,
    /// `<top>/<task_name>/<workload>/<sub_phase>`
    #[default]
    SubWorkloadLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Capture stdout/stderr into files under the output directory.
    #[default]
    File,
    /// Share the controlling process's streams.
    Inherit,
}

/// One simulator run: an executable, its options and where its output goes.
#[derive(Debug, Clone)]
pub struct SimulatorTask {
    exe: PathBuf,
    top_output_dir: PathBuf,
    task_name: String,
    workload: String,
    sub_phase: String,
    cpt_file: Option<PathBuf>,
    options: OptionSet,
    space: Option<bool>,
    path_format: PathFormat,
    workdir: Option<PathBuf>,
    output: OutputMode,
    avoid_repeat: bool,
    numactl_cores: Vec<usize>,
}

impl SimulatorTask {
    pub fn new(
        exe: impl Into<PathBuf>,
        top_output_dir: impl Into<PathBuf>,
        task_name: impl Into<String>,
        workload: impl Into<String>,
        sub_phase: impl Into<String>,
    ) -> Self {
        Self {
            exe: exe.into(),
            top_output_dir: top_output_dir.into(),
            task_name: task_name.into(),
            workload: workload.into(),
            sub_phase: sub_phase.into(),
            cpt_file: None,
            options: OptionSet::new(),
            space: None,
            path_format: PathFormat::default(),
            workdir: None,
            output: OutputMode::default(),
            avoid_repeat: false,
            numactl_cores: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_cpt_file(mut self, cpt_file: impl Into<PathBuf>) -> Self {
        self.cpt_file = Some(cpt_file.into());
        self
    }

    pub fn workload_level_path_format(&mut self) {
        self.path_format = PathFormat::WorkloadLevel;
    }

    pub fn sub_workload_level_path_format(&mut self) {
        self.path_format = PathFormat::SubWorkloadLevel;
    }

    /// Runs the simulator inside its own output directory, the default.
    pub fn set_trivial_workdir(&mut self) {
        self.workdir = None;
    }

    pub fn set_workdir(&mut self, workdir: impl Into<PathBuf>) {
        self.workdir = Some(workdir.into());
    }

    pub fn set_output_to_file(&mut self, to_file: bool) {
        self.output = if to_file {
            OutputMode::File
        } else {
            OutputMode::Inherit
        };
    }

    pub fn set_avoid_repeat(&mut self, avoid_repeat: bool) {
        self.avoid_repeat = avoid_repeat;
    }

    /// Cores the scheduler may bind this task to with `numactl`.
    pub fn set_numactl(&mut self, cores: &[usize]) {
        self.numactl_cores = cores.to_vec();
    }

    fn options_mut(&mut self) -> Result<&mut OptionSet> {
        if self.space.is_some() {
            return Err(anyhow!(
                "options of task {} are already formatted and cannot change",
                self.id()
            ));
        }
        Ok(&mut self.options)
    }

    pub fn add_direct_options<I, S>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options_mut()?.add_direct(values);
        Ok(())
    }

    pub fn add_list_options<I, S>(&mut self, flags: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options_mut()?.add_list(flags);
        Ok(())
    }

    pub fn remove_list_options<I, S>(&mut self, flags: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.options_mut()?.remove_list(flags);
        Ok(())
    }

    pub fn add_dict_options<I, K, V>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<OptionValue>,
    {
        self.options_mut()?.add_dict(entries);
        Ok(())
    }

    /// Layers a materialized variant onto the task's own options.
    pub fn apply_config(&mut self, config: &ResolvedConfig) -> Result<()> {
        tracing::debug!(task = %self.id(), variant = %config.name, "applying config variant");
        self.options_mut()?.merge(&config.options);
        Ok(())
    }

    /// Freezes the options and fixes the dict rendering style.
    ///
    /// Repeating the call with the same style is a no-op; switching style
    /// after freezing is an error.
    pub fn format_options(&mut self, space: bool) -> Result<()> {
        match self.space {
            None => {
                self.space = Some(space);
                Ok(())
            }
            Some(current) if current == space => Ok(()),
            Some(current) => Err(anyhow!(
                "options of task {} are already formatted with space={current}",
                self.id()
            )),
        }
    }

    #[must_use]
    pub fn is_formatted(&self) -> bool {
        self.space.is_some()
    }

    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        let dir = self.top_output_dir.join(&self.task_name).join(&self.workload);
        match self.path_format {
            PathFormat::WorkloadLevel => dir,
            PathFormat::SubWorkloadLevel => dir.join(&self.sub_phase),
        }
    }

    /// `<task_name>/<workload>/<sub_phase>`, unique within a batch.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.task_name, self.workload, self.sub_phase)
    }

    #[must_use]
    pub fn workload(&self) -> &str {
        &self.workload
    }

    #[must_use]
    pub fn sub_phase(&self) -> &str {
        &self.sub_phase
    }

    #[must_use]
    pub fn cpt_file(&self) -> Option<&Path> {
        self.cpt_file.as_deref()
    }

    #[must_use]
    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    /// Produces the exact process invocation for this task.
    pub fn materialize(&self) -> Result<Invocation> {
        let space = self.space.ok_or_else(|| {
            anyhow!(
                "task {} must format its options before it is materialized",
                self.id()
            )
        })?;
        let output_dir = self.output_dir();
        let workdir = self.workdir.clone().unwrap_or_else(|| output_dir.clone());
        Ok(Invocation {
            name: self.id(),
            workload: self.workload.clone(),
            sub_phase: self.sub_phase.clone(),
            executable: self.exe.clone(),
            argv: self.options.to_args(space),
            workdir,
            output_dir,
            output: self.output,
            avoid_repeat: self.avoid_repeat,
            numactl_cores: self.numactl_cores.clone(),
        })
    }

    /// Materializes the task and hands it to `scheduler`.
    pub fn run(&self, scheduler: &dyn Scheduler) -> Result<Outcome> {
        let invocation = self.materialize()?;
        scheduler.execute(&invocation, 0)
    }
}

/// A fully rendered process invocation, ready for a scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub name: String,
    pub workload: String,
    pub sub_phase: String,
    pub executable: PathBuf,
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub output_dir: PathBuf,
    pub output: OutputMode,
    pub avoid_repeat: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub numactl_cores: Vec<usize>,
}

impl Invocation {
    #[must_use]
    pub fn parts(&self) -> (&Path, &[String], &Path) {
        (&self.executable, &self.argv, &self.workdir)
    }

    /// Full command, optionally behind a `numactl` core binding.
    #[must_use]
    pub fn command(&self, core: Option<usize>) -> Vec<String> {
        let mut command = Vec::with_capacity(self.argv.len() + 4);
        if let Some(core) = core {
            command.extend([
                "numactl".to_string(),
                "-C".to_string(),
                core.to_string(),
                "--".to_string(),
            ]);
        }
        command.push(self.executable.to_string_lossy().to_string());
        command.extend(self.argv.iter().cloned());
        command
    }

    #[must_use]
    pub fn stdout_path(&self) -> PathBuf {
        self.output_dir.join(STDOUT_FILE)
    }

    #[must_use]
    pub fn stderr_path(&self) -> PathBuf {
        self.output_dir.join(STDERR_FILE)
    }
}
