use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const LOCAL_CONFIG_ENV: &str = "SIMLAB_LOCAL_CONFIG";

/// Site-specific filesystem roots and machine inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalConfig {
    pub cpt_top: PathBuf,
    pub results_root: PathBuf,
    pub gem5_root: PathBuf,
    pub emu: PathBuf,
    pub gcpt_restorer: PathBuf,
    pub dramsim3_ini: PathBuf,
    /// Workload of a single run when none is named.
    pub default_workload: PathBuf,
    /// Per SPEC version simpoint summaries, overriding the default location.
    pub simpoint_summaries: BTreeMap<String, PathBuf>,
    pub machines: Vec<Machine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Machine {
    pub name: String,
    pub threads: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            cpt_top: PathBuf::from("checkpoints"),
            results_root: PathBuf::from("results"),
            gem5_root: PathBuf::from("gem5"),
            emu: PathBuf::from("emu"),
            gcpt_restorer: PathBuf::from("NEMU/resource/gcpt_restore/build/gcpt.bin"),
            dramsim3_ini: PathBuf::from("xiangshan_DDR4_8Gb_x8_2400.ini"),
            default_workload: PathBuf::from("xs-workloads/linux-4.18-hello/bbl.bin"),
            simpoint_summaries: BTreeMap::new(),
            machines: Vec::new(),
        }
    }
}

impl LocalConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read local config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse local config {}", path.display()))?;
        if let Some(machine) = config.machines.iter().find(|m| m.threads == 0) {
            return Err(anyhow!(
                "machine '{}' in {} has zero threads",
                machine.name,
                path.display()
            ));
        }
        Ok(config)
    }

    /// Loads `explicit`, else the file named by `SIMLAB_LOCAL_CONFIG`, else
    /// falls back to defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match std::env::var_os(LOCAL_CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::load(Path::new(&path)),
            _ => {
                tracing::debug!("no local config given, using defaults");
                Ok(Self::default())
            }
        }
    }

    #[must_use]
    pub fn gem5_exe(&self) -> PathBuf {
        self.gem5_root.join("build/RISCV/gem5.opt")
    }

    #[must_use]
    pub fn fs_script(&self) -> PathBuf {
        self.gem5_root.join("configs/example/fs.py")
    }

    fn spec_root(&self, ver: &str) -> PathBuf {
        self.cpt_top.join(format!("spec{ver}_rv64gcb_o2_20m"))
    }

    #[must_use]
    pub fn checkpoint_dir(&self, ver: &str) -> PathBuf {
        self.spec_root(ver).join("take_cpt")
    }

    #[must_use]
    pub fn simpoint_summary(&self, ver: &str) -> PathBuf {
        self.simpoint_summaries
            .get(ver)
            .cloned()
            .unwrap_or_else(|| self.spec_root(ver).join("json/simpoint_summary.json"))
    }

    /// Worker count for `host`, or the local core count when it is not listed.
    #[must_use]
    pub fn machine_threads(&self, host: Option<&str>) -> usize {
        host.and_then(|h| self.machines.iter().find(|m| m.name == h))
            .map_or_else(num_cpus::get, |m| m.threads)
    }

    #[must_use]
    pub fn machine_index(&self, host: &str) -> Option<usize> {
        self.machines.iter().position(|m| m.name == host)
    }

    #[must_use]
    pub fn n_machines(&self) -> usize {
        self.machines.len().max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "simlab_local_config_{}_{}_{}",
            name.replace('.', "_"),
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join(name);
        fs::write(&path, contents).expect("write config");
        path
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let path = temp_file(
            "local.yaml",
            "cpt_top: /nfs/cpt\nmachines:\n  - name: node0\n    threads: 80\n  - name: node1\n    threads: 64\n",
        );
        let config = LocalConfig::load(&path).unwrap();
        assert_eq!(
            config.checkpoint_dir("06"),
            PathBuf::from("/nfs/cpt/spec06_rv64gcb_o2_20m/take_cpt")
        );
        assert_eq!(
            config.simpoint_summary("06"),
            PathBuf::from("/nfs/cpt/spec06_rv64gcb_o2_20m/json/simpoint_summary.json")
        );
        assert_eq!(config.gem5_exe(), PathBuf::from("gem5/build/RISCV/gem5.opt"));
        assert_eq!(config.machine_threads(Some("node1")), 64);
        assert_eq!(config.machine_index("node1"), Some(1));
        assert_eq!(config.n_machines(), 2);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn zero_thread_machine_is_rejected() {
        let path = temp_file("bad.yaml", "machines:\n  - name: node0\n    threads: 0\n");
        let err = LocalConfig::load(&path).expect_err("zero threads");
        assert!(err.to_string().contains("node0"), "{}", err);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn unknown_host_falls_back_to_local_cores() {
        let config = LocalConfig::default();
        assert_eq!(config.machine_threads(Some("elsewhere")), num_cpus::get());
        assert_eq!(config.n_machines(), 1);
    }
}
