/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use chrono::Local;
use colored::Colorize;
use tracing::info;
use vmtest::{
    clap_args::{self, Commands},
    config::ExperimentScheme,
    execution_plan::create_execution_plan,
    guest::SshGuest,
    host_setup::{self, HostPaths},
    memory_stats::SysfsVmstat,
    scenario_runner::{self, Session},
    settings,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = clap_args::parse();

    let scheme = ExperimentScheme::try_from_path(args.command.config())?;
    settings::init_tracing(args.verbose, scheme.log_level.as_deref())?;

    let timestamp = Local::now().format("%F.%T").to_string();
    let plan = create_execution_plan(&scheme, &timestamp);

    match args.command {
        Commands::Plan { .. } => {
            plan.print();
        }

        Commands::Run { .. } => {
            println!(
                "{} {} trial(s), logs in {}",
                "Running".green(),
                plan.trial_count(),
                plan.session_dir.display()
            );

            if let Some(tuning) = &scheme.host.tuning {
                host_setup::prepare_host(tuning, &HostPaths::default()).await;
            }

            let guest = SshGuest::new(&scheme.host);
            let stats = SysfsVmstat::new(&scheme.host.node_sysfs_root);
            let reports = Session::new(&scheme, &guest, &stats).run(&plan).await?;

            scenario_runner::print_summary(&reports);
            info!("Session finished, {} trial(s) run", reports.len());
        }
    }

    Ok(())
}
