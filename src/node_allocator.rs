/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use itertools::Itertools;

pub type NodeId = u32;

/// The fast (DRAM) and slow (PMEM) nodes used by the trials of a single ratio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSelection {
    pub fast: Vec<NodeId>,
    pub slow: Vec<NodeId>,
}
impl NodeSelection {
    /// Fast nodes followed by slow nodes, the order guest memory is striped across.
    pub fn interleave(&self) -> Vec<NodeId> {
        self.fast.iter().chain(self.slow.iter()).copied().collect()
    }

    /// The interleave set as handed to the VM launcher, e.g. `0,2,3`.
    pub fn interleave_arg(&self) -> String {
        self.interleave().iter().join(",")
    }

    pub fn has_fast_nodes(&self) -> bool {
        !self.fast.is_empty()
    }
}

/// Computes how many fast and slow nodes to use for `ratio` slow nodes per fast node.
///
/// # Arguments
///
/// * `d0` - number of available fast nodes
/// * `p0` - number of available slow nodes, callers guarantee `d0 <= p0`
/// * `ratio` - slow nodes per fast node, `0` selects a pure fast-tier configuration
/// * `single_fast` - collapse multi fast-node configurations onto a single fast node
///
/// # Returns
///
/// `(d, p)` with `d <= d0`, `p <= p0` and `p == d * ratio` whenever `d > 0`.
pub fn node_counts(d0: usize, p0: usize, ratio: usize, single_fast: bool) -> (usize, usize) {
    let mut d = d0;
    let mut p = p0;

    // 2, 4, 4 => 1, 4. pure slow tier once ratio exceeds p0
    if ratio > 0 && d0.saturating_mul(ratio) > p0 {
        d = p0 / ratio;
    }

    // 2, 4, 1 => 2, 2. pure fast tier when ratio == 0
    if d > 0 {
        p = d * ratio;
    }

    // keeps 1:1, 1:2, 1:4 comparable instead of 2:2, 2:4, 1:4
    if single_fast && d > 1 {
        p /= d;
        d = 1;
    }

    (d, p)
}

/// Selects the prefix of each node list that satisfies `ratio`.
pub fn allocate(
    fast_nodes: &[NodeId],
    slow_nodes: &[NodeId],
    ratio: usize,
    single_fast: bool,
) -> NodeSelection {
    let (d, p) = node_counts(fast_nodes.len(), slow_nodes.len(), ratio, single_fast);

    NodeSelection {
        fast: fast_nodes[..d].to_vec(),
        slow: slow_nodes[..p].to_vec(),
    }
}
