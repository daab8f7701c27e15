/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{config::HostTuning, process_control::run_command};
use anyhow::Context;
use colored::Colorize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// Kernel files written by [`prepare_host`].
#[derive(Debug, Clone)]
pub struct HostPaths {
    pub transparent_hugepage: PathBuf,
    pub numa_balancing: PathBuf,
}
impl Default for HostPaths {
    fn default() -> Self {
        Self {
            transparent_hugepage: PathBuf::from("/sys/kernel/mm/transparent_hugepage/enabled"),
            numa_balancing: PathBuf::from("/proc/sys/kernel/numa_balancing"),
        }
    }
}

fn write_knob(path: &Path, value: &str) -> anyhow::Result<()> {
    fs::write(path, value).context(format!("Unable to write {} to {}", value, path.display()))
}

/// Applies host tuning before the first trial. Nothing here is fatal, each failed step is
/// logged and counted.
///
/// # Arguments
///
/// * `tuning` - knobs from the scheme's `[host.tuning]` table
/// * `paths` - kernel files to write
///
/// # Returns
///
/// The number of steps that failed.
pub async fn prepare_host(tuning: &HostTuning, paths: &HostPaths) -> usize {
    let mut failures = 0;

    if let Some(thp) = &tuning.transparent_hugepage {
        match write_knob(&paths.transparent_hugepage, thp) {
            Ok(()) => info!("transparent_hugepage set to {}", thp),
            Err(err) => {
                warn!("{:#}", err);
                failures += 1;
            }
        }
    }

    if let Some(balancing) = tuning.numa_balancing {
        match write_knob(&paths.numa_balancing, &balancing.to_string()) {
            Ok(()) => info!("numa_balancing set to {}", balancing),
            Err(err) => {
                warn!("{:#}", err);
                failures += 1;
            }
        }
    }

    for module in &tuning.modules {
        let command = vec!["modprobe".to_string(), module.clone()];
        match run_command(&command).await {
            Ok(true) => info!("Loaded kernel module {}", module),
            Ok(false) => {
                warn!("modprobe {} failed", module);
                failures += 1;
            }
            Err(err) => {
                warn!("{:#}", err);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        println!(
            "{}",
            format!("WARNING: {} host setup step(s) failed", failures).yellow()
        );
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_paths() -> anyhow::Result<(PathBuf, HostPaths)> {
        let dir = std::env::temp_dir().join(format!("vmtest-{}", nanoid::nanoid!(8)));
        fs::create_dir_all(&dir)?;
        let paths = HostPaths {
            transparent_hugepage: dir.join("enabled"),
            numa_balancing: dir.join("numa_balancing"),
        };
        Ok((dir, paths))
    }

    #[tokio::test]
    async fn writes_requested_knobs() -> anyhow::Result<()> {
        let (dir, paths) = scratch_paths()?;
        let tuning = HostTuning {
            transparent_hugepage: Some("never".to_string()),
            numa_balancing: Some(0),
            modules: vec![],
        };

        assert_eq!(prepare_host(&tuning, &paths).await, 0);
        assert_eq!(fs::read_to_string(&paths.transparent_hugepage)?, "never");
        assert_eq!(fs::read_to_string(&paths.numa_balancing)?, "0");

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() -> anyhow::Result<()> {
        let (dir, mut paths) = scratch_paths()?;
        paths.numa_balancing = dir.join("missing").join("numa_balancing");
        let tuning = HostTuning {
            transparent_hugepage: Some("madvise".to_string()),
            numa_balancing: Some(1),
            modules: vec![],
        };

        assert_eq!(prepare_host(&tuning, &paths).await, 1);
        assert_eq!(fs::read_to_string(&paths.transparent_hugepage)?, "madvise");

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[tokio::test]
    async fn empty_tuning_touches_nothing() -> anyhow::Result<()> {
        let (dir, paths) = scratch_paths()?;

        assert_eq!(prepare_host(&HostTuning::default(), &paths).await, 0);
        assert!(!paths.transparent_hugepage.exists());
        assert!(!paths.numa_balancing.exists());

        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
