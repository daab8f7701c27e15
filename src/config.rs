/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{node_allocator::NodeId, process_control::split_command};
use anyhow::{anyhow, Context};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct ExperimentScheme {
    pub dram_nodes: Vec<NodeId>,
    pub pmem_nodes: Vec<NodeId>,
    pub ratios: Vec<usize>,
    pub workload_script: String,
    pub workload_params: Vec<WorkloadParams>,
    pub migrate_cmd: String,
    pub migrate_config: String,
    #[serde(default)]
    pub single_dram_node: bool,
    #[serde(default)]
    pub capture_rss: bool,
    #[serde(default)]
    pub startup: StartupWait,
    #[serde(default)]
    pub host: HostConfig,
    pub log_level: Option<String>,

    /// Directory of the scheme file, relative paths in the scheme are resolved against it.
    #[serde(skip)]
    pub project_dir: PathBuf,
}
impl ExperimentScheme {
    pub fn try_from_path(path: &Path) -> anyhow::Result<ExperimentScheme> {
        let conf_str = fs::read_to_string(path)
            .context(format!("Unable to read scheme {}", path.display()))?;
        let mut scheme = ExperimentScheme::try_from_str(&conf_str)?;

        scheme.project_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(scheme)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<ExperimentScheme> {
        let scheme = toml::from_str::<ExperimentScheme>(conf_str)
            .map_err(|e| anyhow!("TOML parsing error: {}", e))?;
        scheme.validate()?;
        Ok(scheme)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.ratios.is_empty() {
            return Err(anyhow!("Scheme has no ratios to run"));
        }
        if self.workload_params.is_empty() {
            return Err(anyhow!("Scheme has no workload_params to run"));
        }
        if self.workload_script.trim().is_empty() {
            return Err(anyhow!("workload_script must not be empty"));
        }

        // the allocator assumes fast-tier capacity never exceeds slow-tier capacity
        if self.dram_nodes.len() > self.pmem_nodes.len() {
            return Err(anyhow!(
                "dram_nodes ({}) must not outnumber pmem_nodes ({})",
                self.dram_nodes.len(),
                self.pmem_nodes.len()
            ));
        }

        split_command(&self.migrate_cmd).context("Invalid migrate_cmd")?;
        split_command(&self.host.vm_launcher).context("Invalid vm_launcher")?;
        split_command(&self.host.memory_consumer).context("Invalid memory_consumer")?;

        if let StartupWait::Milestone { text, .. } = &self.startup {
            if text.is_empty() {
                return Err(anyhow!("Startup milestone text must not be empty"));
            }
        }

        Ok(())
    }

    /// Resolves a host path from the scheme against the project directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    /// Resolves the program of a command line when it is given as a path. Bare program names are
    /// left for `PATH` lookup.
    fn resolve_command(&self, command: &str) -> anyhow::Result<Vec<String>> {
        let mut words = split_command(command)?;
        if words[0].contains('/') {
            words[0] = self.resolve(&words[0]).to_string_lossy().to_string();
        }
        Ok(words)
    }

    /// The migration tool's command line, `<migrate_cmd> -c <migrate_config>`.
    pub fn migrate_command(&self) -> anyhow::Result<Vec<String>> {
        let mut words = self.resolve_command(&self.migrate_cmd)?;
        words.push("-c".to_string());
        words.push(
            self.resolve(&self.migrate_config)
                .to_string_lossy()
                .to_string(),
        );
        Ok(words)
    }

    /// Base name of the migration binary, used to tell migrating trials apart in log paths.
    pub fn migrate_name(&self) -> String {
        let program = self
            .migrate_cmd
            .split_whitespace()
            .next()
            .unwrap_or_default();

        Path::new(program)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| program.to_string())
    }

    pub fn vm_launcher_command(&self) -> anyhow::Result<Vec<String>> {
        self.resolve_command(&self.host.vm_launcher)
    }

    /// Local copy of the workload script that is pushed into the guest.
    pub fn workload_script_path(&self) -> PathBuf {
        self.resolve(&self.workload_script)
    }

    /// Where the workload script lives once it has been pushed into the guest.
    pub fn guest_script_path(&self) -> String {
        let file_name = Path::new(&self.workload_script)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.workload_script.clone());

        format!(
            "{}/{}",
            self.host.guest_workspace.trim_end_matches('/'),
            file_name
        )
    }

    pub fn host_workspace(&self) -> PathBuf {
        self.resolve(&self.host.host_workspace)
    }
}

/// One set of environment variables handed to the workload script.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
#[serde(transparent)]
pub struct WorkloadParams(toml::Table);
impl WorkloadParams {
    /// Variables in the order they appear in the scheme.
    pub fn env(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|(name, value)| (name.clone(), render_value(value)))
            .collect()
    }

    /// `name=value` pairs joined with `#`, e.g. `threads=8#time=60`.
    pub fn path_key(&self) -> String {
        self.env()
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .join("#")
    }
}
impl FromIterator<(String, toml::Value)> for WorkloadParams {
    fn from_iter<T: IntoIterator<Item = (String, toml::Value)>>(iter: T) -> Self {
        WorkloadParams(iter.into_iter().collect())
    }
}

fn render_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// How long to let the workload settle before memory pressure is applied.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(tag = "wait", rename_all = "lowercase")]
pub enum StartupWait {
    /// Poll the workload log once a second until it contains `text`.
    Milestone {
        text: String,
        #[serde(default = "default_milestone_timeout")]
        timeout_secs: u64,
    },
    Delay {
        #[serde(default = "default_settle_secs")]
        seconds: u64,
    },
}
impl Default for StartupWait {
    fn default() -> Self {
        StartupWait::Delay {
            seconds: default_settle_secs(),
        }
    }
}

fn default_milestone_timeout() -> u64 {
    300
}

fn default_settle_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct HostConfig {
    pub vm_launcher: String,
    pub qemu_smp: u32,
    pub qemu_mem: String,
    pub ssh_port: u16,
    pub guest_login: String,
    pub guest_workspace: String,
    pub host_workspace: String,
    /// Command for one memory consumer, `{node}` and `{size}` (megabytes) are filled in.
    pub memory_consumer: String,
    pub node_sysfs_root: PathBuf,
    pub tuning: Option<HostTuning>,
}
impl Default for HostConfig {
    fn default() -> Self {
        Self {
            vm_launcher: "tests/kvm.sh".to_string(),
            qemu_smp: 2,
            qemu_mem: "8G".to_string(),
            ssh_port: 2222,
            guest_login: "root@localhost".to_string(),
            guest_workspace: "~/test".to_string(),
            host_workspace: "tests/log".to_string(),
            memory_consumer:
                "numactl --membind {node} usemem --sleep -1 --step 2m --mlock --prefault {size}m"
                    .to_string(),
            node_sysfs_root: PathBuf::from("/sys/devices/system/node"),
            tuning: None,
        }
    }
}

/// Kernel knobs applied to the host before the first trial.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Default)]
#[serde(default)]
pub struct HostTuning {
    pub transparent_hugepage: Option<String>,
    pub numa_balancing: Option<u32>,
    pub modules: Vec<String>,
}
