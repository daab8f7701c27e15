/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::process_control::{self, Output, ProcessHandle};
use anyhow::Context;
use std::path::Path;
use tracing::info;

/// The page-migration tool under test. It is expected to run until it is killed.
#[must_use = "the migration tool must be terminated before the trial ends"]
pub struct MigrationTrigger {
    proc: ProcessHandle,
}
impl MigrationTrigger {
    /// Starts `command` (already including its `-c <config>` argument) logging to `log`.
    pub fn start(command: &[String], log: &Path) -> anyhow::Result<Self> {
        let proc = process_control::spawn("migrate", command, &[], &Output::Log(log.to_path_buf()))
            .context("Failed to start migration tool")?;
        info!("Started migration tool (pid {})", proc.pid());

        Ok(Self { proc })
    }

    pub fn pid(&self) -> u32 {
        self.proc.pid()
    }

    pub fn terminate(self) -> anyhow::Result<()> {
        self.proc.kill()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_control::split_command;
    use sysinfo::{Pid, System};

    #[test]
    fn terminate_kills_a_tool_that_never_exits() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("vmtest-{}", nanoid::nanoid!(8)));
        std::fs::create_dir_all(&dir)?;

        let migration = MigrationTrigger::start(
            &split_command("sh -c 'echo scanning; exec sleep 60'")?,
            &dir.join("migrate.log"),
        )?;
        let pid = migration.pid();
        migration.terminate()?;

        let mut system = System::new();
        system.refresh_all();
        assert!(system.process(Pid::from_u32(pid)).is_none());

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
