/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::HostConfig,
    guest::GuestChannel,
    node_allocator::NodeSelection,
    process_control::{self, Output, ProcessHandle},
};
use anyhow::{anyhow, Context};
use colored::Colorize;
use std::{fmt, path::Path, time::Duration};
use sysinfo::{Pid, System};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    NotStarted,
    Starting,
    Ready,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

/// The guest never answered the readiness probe. This is the one error that ends a whole
/// session rather than a single trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestUnreachable {
    pub attempts: u32,
}
impl fmt::Display for GuestUnreachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to ssh VM after {} attempts", self.attempts)
    }
}
impl std::error::Error for GuestUnreachable {}

/// Readiness polling schedule: `max_attempts` probes, sleeping `max_attempts` seconds before the
/// first one and one second less before each following one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub max_attempts: u32,
}
impl Default for Backoff {
    fn default() -> Self {
        Self { max_attempts: 9 }
    }
}
impl Backoff {
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        (1..=self.max_attempts)
            .rev()
            .map(|secs| Duration::from_secs(secs as u64))
    }
}

/// Environment the VM launcher reads its layout from.
pub fn launcher_env(
    selection: &NodeSelection,
    host: &HostConfig,
    log: &Path,
) -> Vec<(String, String)> {
    vec![
        ("interleave".to_string(), selection.interleave_arg()),
        ("qemu_smp".to_string(), host.qemu_smp.to_string()),
        ("qemu_mem".to_string(), host.qemu_mem.clone()),
        ("qemu_ssh".to_string(), host.ssh_port.to_string()),
        ("qemu_log".to_string(), log.to_string_lossy().to_string()),
    ]
}

pub struct GuestVm {
    state: VmState,
    process: Option<ProcessHandle>,
}
impl Default for GuestVm {
    fn default() -> Self {
        Self::new()
    }
}
impl GuestVm {
    pub fn new() -> Self {
        Self {
            state: VmState::NotStarted,
            process: None,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|proc| proc.pid())
    }

    /// Launches the VM process. `log` is only handed to the launcher as `qemu_log`, the
    /// launcher's own stdout and stderr stay on the terminal.
    pub fn start(
        &mut self,
        launcher: &[String],
        env: &[(String, String)],
        log: &Path,
    ) -> anyhow::Result<()> {
        if self.state != VmState::NotStarted {
            return Err(anyhow!("VM already started ({:?})", self.state));
        }

        let proc = process_control::spawn("vm", launcher, env, &Output::Inherit)
            .context("Failed to launch VM")?;
        info!("Started VM (pid {}), console log {}", proc.pid(), log.display());

        self.process = Some(proc);
        self.state = VmState::Starting;
        Ok(())
    }

    /// Probes the guest until it answers, following `backoff`. When every attempt fails the VM
    /// process is killed and [`GuestUnreachable`] is returned.
    pub async fn wait_ready(
        &mut self,
        guest: &dyn GuestChannel,
        backoff: &Backoff,
    ) -> anyhow::Result<()> {
        if self.state != VmState::Starting {
            return Err(anyhow!("VM is not starting ({:?})", self.state));
        }

        let probe = format!("mkdir -p {}", guest.workspace());
        for (attempt, delay) in backoff.delays().enumerate() {
            tokio::time::sleep(delay).await;

            match guest.exec(&probe).await {
                Ok(true) => {
                    debug!("VM ready after {} attempt(s)", attempt + 1);
                    self.state = VmState::Ready;
                    return Ok(());
                }
                Ok(false) => debug!("VM not reachable yet (attempt {})", attempt + 1),
                Err(err) => debug!("VM probe failed (attempt {}): {:#}", attempt + 1, err),
            }
        }

        error!("{}", "failed to ssh VM".red());
        if let Some(proc) = self.process.take() {
            let pid = proc.pid();
            if let Err(err) = proc.kill() {
                error!("Failed to kill unreachable VM (pid {}): {:#}", pid, err);
            }
        }
        self.state = VmState::Failed;

        Err(GuestUnreachable {
            attempts: backoff.max_attempts,
        }
        .into())
    }

    pub fn mark_running(&mut self) {
        if self.state == VmState::Ready {
            self.state = VmState::Running;
        }
    }

    /// Reads the resident set size of the VM process in bytes. Disabled runs skip the read.
    pub fn capture_rss(&self, enabled: bool) -> Option<u64> {
        if !enabled {
            debug!("VM RSS capture disabled");
            return None;
        }

        let pid = self.pid()?;
        let mut system = System::new();
        system.refresh_all();

        match system.process(Pid::from_u32(pid)) {
            Some(proc) => {
                let rss = proc.memory();
                info!("VM RSS: {}M", rss >> 20);
                Some(rss)
            }
            None => {
                warn!("Unable to read RSS of VM process {}", pid);
                None
            }
        }
    }

    /// Asks the guest to shut down and then waits for the VM process to exit. The VM is
    /// considered stopped once the process is reaped, whether or not the guest accepted the
    /// shutdown command.
    pub async fn stop(&mut self, guest: &dyn GuestChannel) -> anyhow::Result<()> {
        let proc = match self.process.take() {
            Some(proc) => proc,
            None => return Ok(()),
        };
        self.state = VmState::ShuttingDown;

        // QEMU may not exit on halt
        match guest.exec("/sbin/reboot").await {
            Ok(true) => {}
            Ok(false) => warn!("Graceful shutdown command failed in VM (pid {})", proc.pid()),
            Err(err) => warn!("Unable to send shutdown to VM (pid {}): {:#}", proc.pid(), err),
        }

        let res = proc.wait().await;
        self.state = VmState::Stopped;
        res.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_control::split_command;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Answers the readiness probe from the n-th attempt on (never when `None`).
    struct FakeGuest {
        ready_from: Option<usize>,
        calls: Mutex<Vec<(String, Instant)>>,
    }
    impl FakeGuest {
        fn new(ready_from: Option<usize>) -> Self {
            Self {
                ready_from,
                calls: Mutex::new(vec![]),
            }
        }

        fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GuestChannel for FakeGuest {
        fn workspace(&self) -> &str {
            "~/test"
        }

        async fn exec(&self, command: &str) -> anyhow::Result<bool> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((command.to_string(), Instant::now()));
            Ok(matches!(self.ready_from, Some(n) if calls.len() >= n))
        }

        async fn push(&self, _local: &Path) -> anyhow::Result<()> {
            Ok(())
        }

        fn spawn(
            &self,
            _env: &[(String, String)],
            _program: &str,
            _log: &Path,
        ) -> anyhow::Result<ProcessHandle> {
            Err(anyhow!("not supported"))
        }
    }

    fn scratch_log() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("vmtest-{}", nanoid::nanoid!(8)));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("vm.log")
    }

    fn is_alive(pid: u32) -> bool {
        let mut system = System::new();
        system.refresh_all();
        system.process(Pid::from_u32(pid)).is_some()
    }

    #[test]
    fn backoff_shrinks_from_nine_to_one_second() {
        let delays = Backoff::default()
            .delays()
            .map(|d| d.as_secs())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![9, 8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn launcher_env_describes_the_layout() {
        let selection = NodeSelection {
            fast: vec![0],
            slow: vec![2, 3],
        };
        let env = launcher_env(&selection, &HostConfig::default(), Path::new("/tmp/vm.log"));

        assert_eq!(env[0], ("interleave".to_string(), "0,2,3".to_string()));
        assert!(env.contains(&("qemu_ssh".to_string(), "2222".to_string())));
        assert!(env.contains(&("qemu_log".to_string(), "/tmp/vm.log".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_guest_fails_after_every_attempt() -> anyhow::Result<()> {
        let guest = FakeGuest::new(None);
        let mut vm = GuestVm::new();
        vm.start(&split_command("sleep 60")?, &[], &scratch_log())?;
        let pid = vm.pid().unwrap();

        let start = Instant::now();
        let err = vm
            .wait_ready(&guest, &Backoff::default())
            .await
            .unwrap_err();

        assert_eq!(
            err.downcast_ref::<GuestUnreachable>(),
            Some(&GuestUnreachable { attempts: 9 })
        );
        assert_eq!(vm.state(), VmState::Failed);
        assert!(!is_alive(pid));

        let calls = guest.calls();
        assert_eq!(calls.len(), 9);
        assert!(calls.iter().all(|(cmd, _)| cmd == "mkdir -p ~/test"));

        // each probe waits one second less than the one before
        let mut previous = start;
        let mut gaps = vec![];
        for (_, at) in &calls {
            gaps.push(at.duration_since(previous).as_secs());
            previous = *at;
        }
        assert_eq!(gaps, vec![9, 8, 7, 6, 5, 4, 3, 2, 1]);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn vm_that_already_exited_still_ends_the_session() -> anyhow::Result<()> {
        let guest = FakeGuest::new(None);
        let mut vm = GuestVm::new();
        vm.start(&split_command("true")?, &[], &scratch_log())?;

        let err = vm
            .wait_ready(&guest, &Backoff { max_attempts: 2 })
            .await
            .unwrap_err();

        assert!(err.is::<GuestUnreachable>());
        assert_eq!(vm.state(), VmState::Failed);
        assert_eq!(vm.pid(), None);
        Ok(())
    }

    #[tokio::test]
    async fn launcher_output_leaves_console_log_alone() -> anyhow::Result<()> {
        let log = scratch_log();
        let selection = NodeSelection {
            fast: vec![0],
            slow: vec![],
        };
        let env = launcher_env(&selection, &HostConfig::default(), &log);

        let mut vm = GuestVm::new();
        vm.start(
            &split_command("sh -c 'echo guest-console-line >> \"$qemu_log\"; echo launcher'")?,
            &env,
            &log,
        )?;
        vm.stop(&FakeGuest::new(None)).await?;

        assert_eq!(std::fs::read_to_string(&log)?, "guest-console-line\n");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn guest_becomes_ready_mid_backoff() -> anyhow::Result<()> {
        let guest = FakeGuest::new(Some(3));
        let mut vm = GuestVm::new();
        vm.start(&split_command("sleep 60")?, &[], &scratch_log())?;

        let start = Instant::now();
        vm.wait_ready(&guest, &Backoff::default()).await?;

        assert_eq!(vm.state(), VmState::Ready);
        assert_eq!(guest.calls().len(), 3);
        assert_eq!(start.elapsed().as_secs(), 9 + 8 + 7);

        vm.mark_running();
        assert_eq!(vm.state(), VmState::Running);
        Ok(())
    }

    #[tokio::test]
    async fn stop_reaps_the_vm_even_when_shutdown_is_refused() -> anyhow::Result<()> {
        let guest = FakeGuest::new(None);
        let mut vm = GuestVm::new();
        vm.start(&split_command("sleep 1")?, &[], &scratch_log())?;
        let pid = vm.pid().unwrap();

        vm.stop(&guest).await?;

        assert_eq!(vm.state(), VmState::Stopped);
        assert_eq!(guest.calls()[0].0, "/sbin/reboot");
        assert!(!is_alive(pid));
        Ok(())
    }

    #[tokio::test]
    async fn rss_capture_is_a_toggle() -> anyhow::Result<()> {
        let mut vm = GuestVm::new();
        vm.start(&split_command("sleep 30")?, &[], &scratch_log())?;

        assert_eq!(vm.capture_rss(false), None);
        assert!(vm.capture_rss(true).is_some());

        let guest = FakeGuest::new(Some(1));
        vm.wait_ready(&guest, &Backoff { max_attempts: 1 }).await?;
        assert_eq!(vm.state(), VmState::Ready);
        Ok(())
    }
}
