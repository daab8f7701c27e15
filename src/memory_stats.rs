/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::node_allocator::NodeId;
use anyhow::Context;
use std::{fs, path::PathBuf};

/// Size in bytes of one page as counted by the kernel's vmstat counters.
pub const PAGE_SIZE: u64 = 4096;

/// Free and inactive-file page counts of a single memory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemorySnapshot {
    pub free_pages: u64,
    pub inactive_file_pages: u64,
}
impl MemorySnapshot {
    /// Bytes that a consumer could take on this node without evicting anything hot.
    pub fn available_bytes(&self) -> u64 {
        (self.free_pages + self.inactive_file_pages) * PAGE_SIZE
    }
}

pub trait MemoryStatsSource {
    fn snapshot(&self, node: NodeId) -> anyhow::Result<MemorySnapshot>;
}

/// Reads `<root>/node<N>/vmstat`, usually under `/sys/devices/system/node`.
#[derive(Debug, Clone)]
pub struct SysfsVmstat {
    root: PathBuf,
}
impl SysfsVmstat {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}
impl MemoryStatsSource for SysfsVmstat {
    fn snapshot(&self, node: NodeId) -> anyhow::Result<MemorySnapshot> {
        let path = self.root.join(format!("node{node}")).join("vmstat");
        let vmstat = fs::read_to_string(&path)
            .context(format!("Unable to read vmstat of node {}", node))?;

        parse_vmstat(&vmstat).context(format!("Malformed vmstat in {}", path.display()))
    }
}

fn parse_vmstat(vmstat: &str) -> anyhow::Result<MemorySnapshot> {
    let mut free_pages = None;
    let mut inactive_file_pages = None;

    for line in vmstat.lines() {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        match &fields[..] {
            ["nr_free_pages", value] => free_pages = Some(parse_counter(value)?),
            ["nr_inactive_file", value] => inactive_file_pages = Some(parse_counter(value)?),
            _ => {}
        }
    }

    Ok(MemorySnapshot {
        free_pages: free_pages.context("nr_free_pages missing")?,
        inactive_file_pages: inactive_file_pages.context("nr_inactive_file missing")?,
    })
}

fn parse_counter(value: &str) -> anyhow::Result<u64> {
    value
        .parse::<u64>()
        .context(format!("Invalid counter value '{}'", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_VMSTAT: &str = "nr_free_pages 1024\n\
                               nr_zone_inactive_anon 12\n\
                               nr_inactive_anon 12\n\
                               nr_inactive_file 512\n\
                               nr_active_file 9\n";

    #[test]
    fn extracts_free_and_inactive_file_pages() -> anyhow::Result<()> {
        let snapshot = parse_vmstat(NODE_VMSTAT)?;
        assert_eq!(
            snapshot,
            MemorySnapshot {
                free_pages: 1024,
                inactive_file_pages: 512
            }
        );
        assert_eq!(snapshot.available_bytes(), 1536 * PAGE_SIZE);
        Ok(())
    }

    #[test]
    fn missing_counters_are_an_error() {
        assert!(parse_vmstat("nr_free_pages 10\n").is_err());
        assert!(parse_vmstat("nr_free_pages ten\nnr_inactive_file 1\n").is_err());
    }

    #[test]
    fn reads_per_node_vmstat_files() -> anyhow::Result<()> {
        let root = std::env::temp_dir().join(format!("vmtest-{}", nanoid::nanoid!(8)));
        fs::create_dir_all(root.join("node1"))?;
        fs::write(root.join("node1/vmstat"), NODE_VMSTAT)?;

        let source = SysfsVmstat::new(&root);
        assert_eq!(source.snapshot(1)?.free_pages, 1024);
        assert!(source.snapshot(0).is_err());

        fs::remove_dir_all(&root)?;
        Ok(())
    }
}
