/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::{anyhow, Context};
use colored::Colorize;
use std::{
    fs::File,
    path::{Path, PathBuf},
};
use subprocess::{Exec, ExitStatus, NullFile, Popen, Redirection};
use tracing::{debug, warn};

/// Where the stdout and stderr of a background process end up.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Both streams are written to the given file, which is truncated first.
    Log(PathBuf),
    Discard,
    Inherit,
}

/// A background process started by vmtest.
///
/// The handle owns the child. Callers are expected to either [`wait`](ProcessHandle::wait) for
/// it or [`kill`](ProcessHandle::kill) it; a handle that is dropped while the child is still
/// alive kills and reaps the child so that nothing outlives the trial that started it.
#[must_use = "a background process must be waited for or killed"]
pub struct ProcessHandle {
    name: String,
    pid: u32,
    log: Option<PathBuf>,
    popen: Option<Popen>,
}
impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log(&self) -> Option<&Path> {
        self.log.as_deref()
    }

    /// Non-blocking check for the exit status of the process.
    pub fn try_status(&mut self) -> Option<ExitStatus> {
        self.popen.as_mut().and_then(|popen| popen.poll())
    }

    /// Blocks (on a blocking thread) until the process exits and reaps it. There is no timeout.
    pub async fn wait(mut self) -> anyhow::Result<ExitStatus> {
        let mut popen = self
            .popen
            .take()
            .context(format!("Process {} has already been reaped", self.name))?;

        debug!("Waiting for {} (pid {})", self.name, self.pid);
        let status = tokio::task::spawn_blocking(move || popen.wait())
            .await
            .context("Wait task panicked")?
            .context(format!("Failed to wait for process {}", self.name))?;

        debug!("{} (pid {}) exited with {:?}", self.name, self.pid, status);
        Ok(status)
    }

    /// Sends SIGKILL and reaps the process. Never waits for a natural exit.
    pub fn kill(mut self) -> anyhow::Result<()> {
        if let Some(mut popen) = self.popen.take() {
            popen
                .kill()
                .context(format!("Failed to kill process {}", self.name))?;
            popen
                .wait()
                .context(format!("Failed to reap process {}", self.name))?;
            debug!("Killed {} (pid {})", self.name, self.pid);
        }

        Ok(())
    }
}
impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(mut popen) = self.popen.take() {
            if popen.poll().is_none() {
                warn!(
                    "Process {} (pid {}) was still running when its handle was dropped, killing it",
                    self.name, self.pid
                );
                let _ = popen.kill();
            }
            let _ = popen.wait();
        }
    }
}

/// Breaks a command string into POSIX words.
pub fn split_command(command: &str) -> anyhow::Result<Vec<String>> {
    let words = shlex::split(command)
        .ok_or_else(|| anyhow!("Command string is not POSIX compliant: {}", command))?;

    if words.is_empty() {
        return Err(anyhow!("Empty command"));
    }

    Ok(words)
}

/// Runs the given command as a background process. This function does not block, the process
/// keeps running separately from this thread until it is waited for or killed through the
/// returned handle.
///
/// # Arguments
///
/// * `name` - A name for the process used in logs.
/// * `command` - The program followed by its arguments.
/// * `env` - Variables added to the inherited environment of the child.
/// * `output` - Where stdout and stderr go.
///
/// # Returns
///
/// A handle owning the new process.
pub fn spawn(
    name: &str,
    command: &[String],
    env: &[(String, String)],
    output: &Output,
) -> anyhow::Result<ProcessHandle> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("Empty command for process {}", name))?;

    let mut exec = Exec::cmd(program).args(args);
    for (key, value) in env {
        exec = exec.env(key, value);
    }

    let exec = match output {
        Output::Log(path) => {
            let log_file = File::create(path)
                .context(format!("Failed to create log file {}", path.display()))?;
            exec.stdout(Redirection::File(log_file))
                .stderr(Redirection::Merge)
        }
        Output::Discard => exec.stdout(NullFile).stderr(NullFile),
        Output::Inherit => exec,
    };

    let env_prefix = env
        .iter()
        .map(|(key, value)| format!("{key}={value} "))
        .collect::<String>();
    let redirect = match output {
        Output::Log(path) => format!(" > {}", path.display()),
        _ => String::new(),
    };
    println!(
        "{}",
        format!("{}{}{}", env_prefix, command.join(" "), redirect).bright_black()
    );

    let popen = exec
        .detached()
        .popen()
        .context(format!("Failed to spawn process {}, command: {}", name, program))?;
    let pid = popen.pid().context("Process should have a PID")?;

    Ok(ProcessHandle {
        name: name.to_string(),
        pid,
        log: match output {
            Output::Log(path) => Some(path.clone()),
            _ => None,
        },
        popen: Some(popen),
    })
}

/// Runs a short command to completion, discarding its output.
///
/// # Returns
///
/// Whether the command exited successfully. Failing to start the command at all is an error.
pub async fn run_command(command: &[String]) -> anyhow::Result<bool> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("Empty command"))?;

    let output = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .context(format!("Tokio command failed to run {program}"))?;

    if !output.status.success() {
        debug!(
            "{} exited with {}: {}",
            command.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(output.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use sysinfo::{Pid, System};

    fn words(command: &str) -> Vec<String> {
        split_command(command).unwrap()
    }

    fn is_alive(pid: u32) -> bool {
        let mut system = System::new();
        system.refresh_all();
        system.process(Pid::from_u32(pid)).is_some()
    }

    #[test]
    fn split_command_rejects_bad_input() {
        assert!(split_command("").is_err());
        assert!(split_command("echo 'unterminated").is_err());
        assert_eq!(
            words("numactl --membind 0 'usemem x'"),
            ["numactl", "--membind", "0", "usemem x"]
        );
    }

    #[test]
    fn can_spawn_and_kill_a_background_process() -> anyhow::Result<()> {
        let proc = spawn("sleep", &words("sleep 30"), &[], &Output::Discard)?;
        let pid = proc.pid();
        assert!(is_alive(pid));

        proc.kill()?;
        assert!(!is_alive(pid));

        Ok(())
    }

    #[test]
    fn dropping_a_live_handle_kills_the_process() -> anyhow::Result<()> {
        let proc = spawn("sleep", &words("sleep 30"), &[], &Output::Discard)?;
        let pid = proc.pid();
        drop(proc);

        assert!(!is_alive(pid));
        Ok(())
    }

    #[tokio::test]
    async fn output_and_environment_reach_the_log() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("vmtest-{}", nanoid::nanoid!(8)));
        std::fs::create_dir_all(&dir)?;
        let log = dir.join("env.log");

        let proc = spawn(
            "env",
            &words("sh -c 'echo interleave=$interleave; echo oops >&2'"),
            &[("interleave".to_string(), "0,2".to_string())],
            &Output::Log(log.clone()),
        )?;
        assert_eq!(proc.log(), Some(log.as_path()));

        let status = proc.wait().await?;
        assert!(status.success());

        let contents = std::fs::read_to_string(&log)?;
        assert!(contents.contains("interleave=0,2"));
        assert!(contents.contains("oops"));

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[tokio::test]
    async fn wait_has_no_timeout_of_its_own() -> anyhow::Result<()> {
        // a hung child hangs the waiter, only an outside deadline gets control back
        let proc = spawn("sleep", &words("sleep 2"), &[], &Output::Discard)?;
        let waited = tokio::time::timeout(Duration::from_millis(300), proc.wait()).await;
        assert!(waited.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn run_command_reports_exit_status() -> anyhow::Result<()> {
        assert!(run_command(&words("true")).await?);
        assert!(!run_command(&words("false")).await?);
        assert!(run_command(&words("/nonexistent/binary")).await.is_err());

        Ok(())
    }
}
