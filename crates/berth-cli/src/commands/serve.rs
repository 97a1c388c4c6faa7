//! `berthd serve`: run the API server until interrupted.

use std::sync::Arc;

use anyhow::Context;
use berth_api::ApiServer;
use berth_common::config::DaemonConfig;
use berth_common::constants::{API_VERSION, DAEMON_VERSION};
use berth_common::types::ContainerConfig;
use berth_runtime::engine::Engine;
use clap::Args;

/// Arguments for the `serve` command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Register an empty image under this name at startup so containers can
    /// be created from it; empty disables it.
    #[arg(long, default_value = "base")]
    pub base_image: String,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            base_image: "base".into(),
        }
    }
}

/// Executes the `serve` command.
///
/// # Errors
///
/// Returns an error if the runtime cannot start or the server fails.
pub fn execute(config: DaemonConfig, args: &ServeArgs) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building async runtime")?;
    runtime.block_on(run(config, args))
}

async fn run(config: DaemonConfig, args: &ServeArgs) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;
    tracing::info!(
        version = DAEMON_VERSION,
        api_version = %API_VERSION,
        data_dir = %config.data_dir.display(),
        "starting berthd"
    );

    let engine = Arc::new(Engine::new(&config));
    if !args.base_image.is_empty() {
        let defaults = ContainerConfig {
            cmd: vec!["/bin/sh".into()],
            ..ContainerConfig::default()
        };
        let id = engine
            .create_image(&args.base_image, "", Some(defaults))
            .await
            .with_context(|| format!("registering base image {}", args.base_image))?;
        tracing::info!(id = %id, name = %args.base_image, "base image registered");
    }

    let server = ApiServer::new(&config, engine);
    server.run(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                let _ = signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "cannot listen for interrupt");
            }
        }
        () = terminate => {}
    }
    tracing::info!("shutdown requested");
}
