/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod clap_args;
pub mod config;
pub mod execution_plan;
pub mod guest;
pub mod guest_vm;
pub mod host_setup;
pub mod memory_stats;
pub mod migration;
pub mod node_allocator;
pub mod pressure;
pub mod process_control;
pub mod scenario_runner;
pub mod settings;
pub mod workload;
