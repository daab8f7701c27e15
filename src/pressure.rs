/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::HostConfig,
    memory_stats::MemoryStatsSource,
    node_allocator::NodeId,
    process_control::{self, split_command, Output, ProcessHandle},
};
use anyhow::anyhow;
use colored::Colorize;
use tracing::{info, warn};

/// Consumes free memory on the fast nodes so that the kernel has to demote cold pages.
pub struct PressureInjector<'a> {
    consumer: &'a str,
}
impl<'a> PressureInjector<'a> {
    pub fn new(host: &'a HostConfig) -> Self {
        Self {
            consumer: &host.memory_consumer,
        }
    }

    /// The consumer command for `megabytes` on `node`, by default a memory-locked `usemem`
    /// bound to the node that sleeps until killed.
    pub fn consumer_command(&self, node: NodeId, megabytes: u64) -> anyhow::Result<Vec<String>> {
        let words = split_command(self.consumer)?;
        Ok(words
            .into_iter()
            .map(|word| {
                word.replace("{node}", &node.to_string())
                    .replace("{size}", &megabytes.to_string())
            })
            .collect())
    }

    /// Starts one consumer per fast node, sized to the node's free plus inactive-file memory
    /// minus `reserve_per_node` bytes. Nodes that cannot be sized or started are skipped with
    /// a warning.
    pub fn inject(
        &self,
        fast_nodes: &[NodeId],
        stats: &dyn MemoryStatsSource,
        reserve_per_node: u64,
    ) -> InjectorSet {
        let mut injectors = InjectorSet::default();

        for &node in fast_nodes {
            let snapshot = match stats.snapshot(node) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!("Skipping memory pressure on node {}: {:#}", node, err);
                    continue;
                }
            };

            let available = snapshot.available_bytes() as i64;
            println!("Node {}: free {}M", node, available >> 20);

            let target = available - reserve_per_node as i64;
            if target < 0 {
                println!(
                    "{}",
                    format!("WARNING: negative target on node {} = {}", node, target).yellow()
                );
                warn!("Skipping memory pressure on node {}: target {} bytes", node, target);
                continue;
            }

            let megabytes = (target >> 20) as u64;
            if megabytes == 0 {
                warn!("Skipping memory pressure on node {}: less than 1M to take", node);
                continue;
            }

            let spawned = self.consumer_command(node, megabytes).and_then(|command| {
                process_control::spawn(
                    &format!("usemem-node{node}"),
                    &command,
                    &[],
                    &Output::Discard,
                )
            });
            match spawned {
                Ok(proc) => injectors.handles.push(proc),
                Err(err) => warn!("Unable to start memory consumer on node {}: {:#}", node, err),
            }
        }

        info!("Started {} memory consumer(s)", injectors.len());
        injectors
    }
}

/// Consumers started for the current trial. They run until [`InjectorSet::terminate_all`]
/// kills them.
#[derive(Default)]
#[must_use = "memory consumers must be terminated before the trial ends"]
pub struct InjectorSet {
    handles: Vec<ProcessHandle>,
}
impl InjectorSet {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.handles.iter().map(|proc| proc.pid()).collect()
    }

    /// Force-kills every consumer. All of them are attempted even if one fails.
    pub fn terminate_all(self) -> anyhow::Result<()> {
        let mut failed = 0;
        for proc in self.handles {
            let name = proc.name().to_string();
            if let Err(err) = proc.kill() {
                warn!("Failed to kill {}: {:#}", name, err);
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(anyhow!("{} memory consumer(s) could not be killed", failed));
        }
        Ok(())
    }
}
