/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{ExperimentScheme, WorkloadParams},
    node_allocator::{self, NodeSelection},
};
use anyhow::Context;
use colored::Colorize;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Everything a single trial needs to know about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub ratio: usize,
    pub params: WorkloadParams,
    pub should_migrate: bool,
    pub log_dir: PathBuf,
}
impl RunContext {
    /// Composes `<session_dir>/ratio=<ratio>/<params>[.<migrate_name>]`.
    pub fn new(
        session_dir: &Path,
        ratio: usize,
        params: &WorkloadParams,
        migrate_name: Option<&str>,
    ) -> Self {
        let mut key = params.path_key();
        if let Some(name) = migrate_name {
            key.push('.');
            key.push_str(name);
        }

        RunContext {
            ratio,
            params: params.clone(),
            should_migrate: migrate_name.is_some(),
            log_dir: session_dir.join(format!("ratio={ratio}")).join(key),
        }
    }

    pub fn workload_log(&self) -> PathBuf {
        self.log_dir.join("workload.log")
    }

    pub fn migrate_log(&self) -> PathBuf {
        self.log_dir.join("migrate.log")
    }

    pub fn vm_log(&self) -> PathBuf {
        self.log_dir.join("vm.log")
    }

    pub fn variant(&self) -> &'static str {
        if self.should_migrate {
            "migrate"
        } else {
            "baseline"
        }
    }

    pub fn create_log_dir(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.log_dir).context(format!(
            "Unable to create log directory {}",
            self.log_dir.display()
        ))
    }
}

/// The node selection for one ratio and the trials run with it.
#[derive(Debug, Clone)]
pub struct RatioPlan {
    pub ratio: usize,
    pub selection: NodeSelection,
    pub trials: Vec<RunContext>,
}

#[derive(Debug)]
pub struct ExecutionPlan {
    pub session_dir: PathBuf,
    pub ratios: Vec<RatioPlan>,
}
impl ExecutionPlan {
    /// Every trial in execution order along with the node selection it runs on.
    pub fn trials(&self) -> impl Iterator<Item = (&NodeSelection, &RunContext)> {
        self.ratios
            .iter()
            .flat_map(|plan| plan.trials.iter().map(move |ctx| (&plan.selection, ctx)))
    }

    pub fn trial_count(&self) -> usize {
        self.ratios.iter().map(|plan| plan.trials.len()).sum()
    }

    pub fn print(&self) {
        println!("{}", self.session_dir.display().to_string().bold());
        for plan in &self.ratios {
            println!(
                "> ratio {} - dram {:?} pmem {:?} interleave {}",
                plan.ratio.to_string().green(),
                plan.selection.fast,
                plan.selection.slow,
                plan.selection.interleave_arg()
            );
            for ctx in &plan.trials {
                println!("    {:<8} {}", ctx.variant(), ctx.log_dir.display());
            }
        }
    }
}

/// Lays out the whole session: for each ratio a baseline trial per workload parameter set,
/// followed by a migrating trial whenever the ratio leaves any fast node to pressure.
pub fn create_execution_plan(scheme: &ExperimentScheme, timestamp: &str) -> ExecutionPlan {
    let session_dir = scheme.host_workspace().join(timestamp);
    let migrate_name = scheme.migrate_name();

    let ratios = scheme
        .ratios
        .iter()
        .map(|&ratio| {
            let selection = node_allocator::allocate(
                &scheme.dram_nodes,
                &scheme.pmem_nodes,
                ratio,
                scheme.single_dram_node,
            );

            let mut trials = vec![];
            for params in &scheme.workload_params {
                trials.push(RunContext::new(&session_dir, ratio, params, None));
                if selection.has_fast_nodes() {
                    trials.push(RunContext::new(
                        &session_dir,
                        ratio,
                        params,
                        Some(&migrate_name),
                    ));
                }
            }

            RatioPlan {
                ratio,
                selection,
                trials,
            }
        })
        .collect();

    ExecutionPlan {
        session_dir,
        ratios,
    }
}
