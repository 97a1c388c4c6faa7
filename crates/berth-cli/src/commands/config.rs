//! `berthd config`: print the effective configuration.

use std::io::Write;

use anyhow::Context;
use berth_common::config::DaemonConfig;

/// Executes the `config` command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be encoded or written.
pub fn execute(config: &DaemonConfig) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(config).context("encoding configuration")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{json}").context("writing configuration")?;
    Ok(())
}
