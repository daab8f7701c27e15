/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::HostConfig,
    process_control::{self, Output, ProcessHandle},
};
use anyhow::anyhow;
use async_trait::async_trait;
use std::path::Path;

/// The ways vmtest talks to a running guest.
#[async_trait]
pub trait GuestChannel: Send + Sync {
    /// Guest directory that workloads are pushed into.
    fn workspace(&self) -> &str;

    /// Runs a single command inside the guest and reports whether it succeeded.
    async fn exec(&self, command: &str) -> anyhow::Result<bool>;

    /// Copies a local file into the guest workspace.
    async fn push(&self, local: &Path) -> anyhow::Result<()>;

    /// Starts `env VAR=val... program` inside the guest without waiting for it. The combined
    /// output is written to `log` on the host.
    fn spawn(
        &self,
        env: &[(String, String)],
        program: &str,
        log: &Path,
    ) -> anyhow::Result<ProcessHandle>;
}

/// Reaches the guest through the ssh port forwarded by the VM launcher.
#[derive(Debug, Clone)]
pub struct SshGuest {
    port: u16,
    login: String,
    workspace: String,
}
impl SshGuest {
    pub fn new(host: &HostConfig) -> Self {
        Self {
            port: host.ssh_port,
            login: host.guest_login.clone(),
            workspace: host.guest_workspace.clone(),
        }
    }

    fn ssh(&self) -> Vec<String> {
        vec![
            "ssh".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            self.login.clone(),
        ]
    }
}

#[async_trait]
impl GuestChannel for SshGuest {
    fn workspace(&self) -> &str {
        &self.workspace
    }

    async fn exec(&self, command: &str) -> anyhow::Result<bool> {
        let mut cmd = self.ssh();
        cmd.push(command.to_string());
        process_control::run_command(&cmd).await
    }

    async fn push(&self, local: &Path) -> anyhow::Result<()> {
        let cmd = vec![
            "rsync".to_string(),
            "-a".to_string(),
            "-e".to_string(),
            format!("ssh -p {}", self.port),
            local.to_string_lossy().to_string(),
            format!("{}:{}/", self.login, self.workspace),
        ];
        println!("{}", cmd.join(" "));

        if process_control::run_command(&cmd).await? {
            Ok(())
        } else {
            Err(anyhow!(
                "rsync of {} into the guest failed",
                local.display()
            ))
        }
    }

    fn spawn(
        &self,
        env: &[(String, String)],
        program: &str,
        log: &Path,
    ) -> anyhow::Result<ProcessHandle> {
        let mut cmd = self.ssh();
        cmd.push("env".to_string());
        cmd.extend(env.iter().map(|(name, value)| format!("{name}={value}")));
        cmd.push(program.to_string());

        process_control::spawn("workload", &cmd, &[], &Output::Log(log.to_path_buf()))
    }
}
