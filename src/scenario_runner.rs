/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::ExperimentScheme,
    execution_plan::{ExecutionPlan, RunContext},
    guest::GuestChannel,
    guest_vm::{self, Backoff, GuestUnreachable, GuestVm},
    memory_stats::MemoryStatsSource,
    migration::MigrationTrigger,
    node_allocator::NodeSelection,
    pressure::PressureInjector,
    workload::WorkloadRunner,
};
use chrono::Local;
use colored::*;
use std::time::{Duration, Instant};
use subprocess::ExitStatus;
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    /// The workload ran to completion, successfully or not.
    Completed(ExitStatus),
    /// The trial was abandoned, the session carried on with the next one.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TrialReport {
    pub ctx: RunContext,
    pub outcome: TrialOutcome,
    pub elapsed: Duration,
}

/// Drives every trial of an execution plan, one at a time.
pub struct Session<'a> {
    scheme: &'a ExperimentScheme,
    guest: &'a dyn GuestChannel,
    stats: &'a dyn MemoryStatsSource,
    backoff: Backoff,
    last_vm_rss: Option<u64>,
}
impl<'a> Session<'a> {
    pub fn new(
        scheme: &'a ExperimentScheme,
        guest: &'a dyn GuestChannel,
        stats: &'a dyn MemoryStatsSource,
    ) -> Self {
        Self {
            scheme,
            guest,
            stats,
            backoff: Backoff::default(),
            last_vm_rss: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs the plan. An unreachable guest or a log directory that cannot be created ends the
    /// session with an error; any other trial failure is reported and the session moves on.
    pub async fn run(&mut self, plan: &ExecutionPlan) -> anyhow::Result<Vec<TrialReport>> {
        let mut reports = vec![];

        for (selection, ctx) in plan.trials() {
            println!("{}", "-".repeat(80));
            println!(
                "{}  Running test ratio={} params={} should_migrate={}",
                Local::now().format("%F %T"),
                ctx.ratio.to_string().green(),
                ctx.params.path_key().green(),
                ctx.should_migrate
            );

            ctx.create_log_dir()?;

            let start = Instant::now();
            let outcome = match self.run_trial(selection, ctx).await {
                Ok(status) => TrialOutcome::Completed(status),
                Err(err) if err.is::<GuestUnreachable>() => return Err(err),
                Err(err) => {
                    warn!(
                        "Trial {} ({}) failed: {:#}",
                        ctx.log_dir.display(),
                        ctx.variant(),
                        err
                    );
                    TrialOutcome::Failed(format!("{:#}", err))
                }
            };

            reports.push(TrialReport {
                ctx: ctx.clone(),
                outcome,
                elapsed: start.elapsed(),
            });
        }

        Ok(reports)
    }

    /// Runs one trial: boot the VM, run the workload (under memory pressure and migration when
    /// `ctx.should_migrate`), then tear everything down. The VM is always stopped once it has
    /// become reachable, whatever happened to the workload.
    pub async fn run_trial(
        &mut self,
        selection: &NodeSelection,
        ctx: &RunContext,
    ) -> anyhow::Result<ExitStatus> {
        let vm_log = ctx.vm_log();
        let launcher = self.scheme.vm_launcher_command()?;
        let env = guest_vm::launcher_env(selection, &self.scheme.host, &vm_log);

        let mut vm = GuestVm::new();
        vm.start(&launcher, &env, &vm_log)?;
        vm.wait_ready(self.guest, &self.backoff).await?;

        let res = self.drive_workload(&mut vm, selection, ctx).await;

        // record rss to size memory pressure in a later trial
        if let Some(rss) = vm.capture_rss(self.scheme.capture_rss) {
            self.last_vm_rss = Some(rss);
        }

        if let Err(err) = vm.stop(self.guest).await {
            warn!("Failed to stop VM for {}: {:#}", ctx.log_dir.display(), err);
        }

        res
    }

    async fn drive_workload(
        &mut self,
        vm: &mut GuestVm,
        selection: &NodeSelection,
        ctx: &RunContext,
    ) -> anyhow::Result<ExitStatus> {
        let runner = WorkloadRunner::new(self.guest);
        let workload_log = ctx.workload_log();

        runner.deploy(&self.scheme.workload_script_path()).await?;
        let workload = runner.launch(&self.scheme.guest_script_path(), &ctx.params, &workload_log)?;
        vm.mark_running();

        if !ctx.should_migrate {
            return runner.await_completion(workload).await;
        }

        runner
            .await_startup(&self.scheme.startup, &workload_log)
            .await;
        if let Some(rss) = vm.capture_rss(self.scheme.capture_rss) {
            self.last_vm_rss = Some(rss);
        }

        let reserve_per_node = match self.last_vm_rss {
            Some(rss) if !selection.fast.is_empty() => rss / selection.fast.len() as u64,
            _ => 0,
        };
        let injectors = PressureInjector::new(&self.scheme.host).inject(
            &selection.fast,
            self.stats,
            reserve_per_node,
        );

        let migration = match self
            .scheme
            .migrate_command()
            .and_then(|command| MigrationTrigger::start(&command, &ctx.migrate_log()))
        {
            Ok(migration) => migration,
            Err(err) => {
                if let Err(kill_err) = injectors.terminate_all() {
                    warn!("{:#}", kill_err);
                }
                return Err(err);
            }
        };

        let status = runner.await_completion(workload).await;

        // migration tool and memory consumers go before the VM
        if let Err(err) = migration.terminate() {
            warn!("Failed to terminate migration tool: {:#}", err);
        }
        if let Err(err) = injectors.terminate_all() {
            warn!("{:#}", err);
        }
        info!("Trial teardown complete for {}", ctx.log_dir.display());

        status
    }
}

/// Prints a table of every trial of the session.
pub fn print_summary(reports: &[TrialReport]) {
    println!("\n{}", " Summary ".reversed().green());

    let mut table_rows = rows![row![
        TableCell::builder("Ratio".bold()).build(),
        TableCell::builder("Params".bold()).build(),
        TableCell::builder("Variant".bold()).build(),
        TableCell::builder("Outcome".bold()).build(),
        TableCell::builder("Duration (s)".bold()).build()
    ]];

    for report in reports {
        let outcome = match &report.outcome {
            TrialOutcome::Completed(status) if status.success() => "ok".green(),
            TrialOutcome::Completed(status) => format!("{:?}", status).yellow(),
            TrialOutcome::Failed(err) => err.red(),
        };

        table_rows.push(row![
            TableCell::new(report.ctx.ratio),
            TableCell::new(report.ctx.params.path_key()),
            TableCell::new(report.ctx.variant()),
            TableCell::new(outcome),
            TableCell::new(format!("{:.1}s", report.elapsed.as_secs_f64()))
        ]);
    }

    let table = Table::builder()
        .rows(table_rows)
        .style(TableStyle::rounded())
        .build();

    println!("{}", table.render())
}
