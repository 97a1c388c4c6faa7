//! CLI command definitions and dispatch.

pub mod config;
pub mod serve;

use std::path::PathBuf;

use anyhow::Context;
use berth_common::config::{DaemonConfig, ListenAddr};
use clap::{Parser, Subcommand};

/// berthd: container management daemon.
#[derive(Parser, Debug)]
#[command(name = "berthd", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute; defaults to `serve`.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// JSON configuration file; flags override its values.
    #[arg(long, short = 'c', global = true, env = "BERTH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address: a unix socket path, `unix:///path` or `tcp://host:port`.
    #[arg(long, short = 'H', global = true, env = "BERTH_HOST")]
    pub listen: Option<ListenAddr>,

    /// Directory holding images, container layers and logs.
    #[arg(long, global = true, env = "BERTH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Add CORS headers to every API response.
    #[arg(long = "api-enable-cors", global = true)]
    pub enable_cors: bool,

    /// Debug logging, also reported by `/info`.
    #[arg(long, short = 'D', global = true)]
    pub debug: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

impl Cli {
    /// Loads the configuration file, if any, and applies flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn daemon_config(&self) -> anyhow::Result<DaemonConfig> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::load(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => DaemonConfig::default(),
        };
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir.clone_from(data_dir);
        }
        config.enable_cors |= self.enable_cors;
        config.debug |= self.debug;
        Ok(config)
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the API server (the default).
    Serve(serve::ServeArgs),
    /// Print the effective configuration as JSON.
    Config,
}

/// Dispatches the parsed command line.
///
/// # Errors
///
/// Returns an error if the command fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = cli.daemon_config()?;
    match cli.command {
        Some(Command::Serve(args)) => serve::execute(config, &args),
        None => serve::execute(config, &serve::ServeArgs::default()),
        Some(Command::Config) => config::execute(&config),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[test]
    fn flags_override_file_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("daemon.json");
        std::fs::write(
            &path,
            r#"{"listen":"tcp://127.0.0.1:4243","stop_timeout_secs":3}"#,
        )
        .expect("write");

        let cli = Cli::try_parse_from([
            "berthd",
            "--config",
            path.to_str().unwrap(),
            "-H",
            "unix:///tmp/berth-test.sock",
            "--api-enable-cors",
        ])
        .expect("parse");
        let config = cli.daemon_config().expect("config");
        assert_eq!(config.listen.to_string(), "unix:///tmp/berth-test.sock");
        assert!(config.enable_cors);
        assert!(!config.debug);
        assert_eq!(config.stop_timeout_secs, 3);
    }

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["berthd", "-D"]).expect("parse");
        assert!(cli.command.is_none());
        assert!(cli.daemon_config().expect("config").debug);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = Cli::try_parse_from(["berthd", "--config", "/nonexistent/berth.json", "config"])
            .expect("parse");
        assert!(cli.daemon_config().is_err());
    }

    #[test]
    fn rejects_bad_listen_address() {
        assert!(Cli::try_parse_from(["berthd", "-H", "tcp://nowhere"]).is_err());
    }
}
