/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::anyhow;
use std::str::FromStr;
use tracing::{info, level_filters::LevelFilter, Level};
use tracing_subscriber::EnvFilter;

/// Picks the log level: `--verbose` wins, then the scheme's `log_level`, then INFO. An unknown
/// level name falls back to INFO.
pub fn log_level(verbose: bool, configured: Option<&str>) -> Level {
    if verbose {
        return Level::DEBUG;
    }

    match configured {
        Some(level) => Level::from_str(level).unwrap_or_else(|_| {
            eprintln!(
                "Error with config log level: {}, setting log level to \"info\"",
                level
            );
            Level::INFO
        }),
        None => Level::INFO,
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` directives, when set, refine the default
/// level.
pub fn init_tracing(verbose: bool, configured: Option<&str>) -> anyhow::Result<()> {
    let level = log_level(verbose, configured);
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("Failed to set global default subscriber: {}", err))?;

    info!("Log level set to {}", level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_flag_overrides_scheme_level() {
        assert_eq!(log_level(true, Some("error")), Level::DEBUG);
        assert_eq!(log_level(false, Some("warn")), Level::WARN);
        assert_eq!(log_level(false, Some("TRACE")), Level::TRACE);
        assert_eq!(log_level(false, None), Level::INFO);
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(log_level(false, Some("loud")), Level::INFO);
    }
}
