/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{StartupWait, WorkloadParams},
    guest::GuestChannel,
    process_control::ProcessHandle,
};
use anyhow::Context;
use colored::Colorize;
use std::{fs, path::Path, time::Duration};
use subprocess::ExitStatus;
use tracing::{info, warn};

/// How the startup wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    MilestoneSeen,
    MilestoneTimedOut,
    Settled,
}

/// Deploys and runs the workload script inside the guest.
pub struct WorkloadRunner<'a> {
    guest: &'a dyn GuestChannel,
}
impl<'a> WorkloadRunner<'a> {
    pub fn new(guest: &'a dyn GuestChannel) -> Self {
        Self { guest }
    }

    /// Pushes the script into the guest workspace. Not retried.
    pub async fn deploy(&self, script: &Path) -> anyhow::Result<()> {
        self.guest
            .push(script)
            .await
            .context(format!("Failed to deploy workload {}", script.display()))
    }

    /// Starts the script in the guest with `params` as its environment and returns at once.
    pub fn launch(
        &self,
        guest_script: &str,
        params: &WorkloadParams,
        log: &Path,
    ) -> anyhow::Result<ProcessHandle> {
        self.guest
            .spawn(&params.env(), guest_script, log)
            .context(format!("Failed to launch workload {}", guest_script))
    }

    /// Gives the workload time to reach steady memory usage before pressure is applied.
    pub async fn await_startup(&self, strategy: &StartupWait, log: &Path) -> Startup {
        match strategy {
            StartupWait::Milestone { text, timeout_secs } => {
                if wait_log_message(log, text, *timeout_secs).await {
                    Startup::MilestoneSeen
                } else {
                    Startup::MilestoneTimedOut
                }
            }
            StartupWait::Delay { seconds } => {
                tokio::time::sleep(Duration::from_secs(*seconds)).await;
                Startup::Settled
            }
        }
    }

    /// Blocks until the workload exits. This is unbounded: a workload that never finishes
    /// holds up the whole session.
    pub async fn await_completion(&self, workload: ProcessHandle) -> anyhow::Result<ExitStatus> {
        let status = workload.wait().await?;
        if status.success() {
            info!("Workload finished");
        } else {
            warn!("Workload exited with {:?}", status);
        }
        Ok(status)
    }
}

/// Checks `log` for `msg` once a second for up to `seconds` seconds.
///
/// # Returns
///
/// `true` as soon as the message shows up, `false` after a timeout. A timeout is only logged.
pub async fn wait_log_message(log: &Path, msg: &str, seconds: u64) -> bool {
    for _ in 0..seconds {
        tokio::time::sleep(Duration::from_secs(1)).await;

        // the log may not exist until the remote side writes its first line
        if let Ok(contents) = fs::read_to_string(log) {
            if contents.contains(msg) {
                return true;
            }
        }
    }

    println!(
        "{}",
        format!("WARNING: timeout waiting for '{}' in {}", msg, log.display()).yellow()
    );
    warn!("Timeout waiting for '{}' in {}", msg, log.display());
    false
}
