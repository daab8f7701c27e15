/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Tiered-memory migration experiments in a VM", long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Run every trial of an experiment scheme
    Run {
        /// Path to the scheme file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the trials a scheme would run without running them
    Plan {
        /// Path to the scheme file
        #[arg(short, long)]
        config: PathBuf,
    },
}
impl Commands {
    pub fn config(&self) -> &PathBuf {
        match self {
            Commands::Run { config } | Commands::Plan { config } => config,
        }
    }
}

pub fn parse() -> Args {
    Args::parse()
}
