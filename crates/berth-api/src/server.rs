//! API server: accept loop over a unix socket or TCP listener.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use berth_common::config::{DaemonConfig, ListenAddr};
use berth_common::error::BerthError;
use berth_runtime::engine::Engine;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tower::Service;

use crate::error::{ApiError, Result};
use crate::router::{RouterOptions, create_router};

/// A bound listener.
#[derive(Debug)]
pub enum Listener {
    /// Unix domain socket.
    Unix(UnixListener),
    /// TCP socket.
    Tcp(TcpListener),
}

impl Listener {
    /// Binds `addr`, replacing a stale unix socket and creating its parent
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: &ListenAddr) -> Result<Self> {
        match addr {
            ListenAddr::Unix(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| BerthError::io(parent, e))?;
                }
                let _ = std::fs::remove_file(path);
                UnixListener::bind(path)
                    .map(Self::Unix)
                    .map_err(|e| BerthError::io(path, e).into())
            }
            ListenAddr::Tcp(addr) => TcpListener::bind(addr)
                .await
                .map(Self::Tcp)
                .map_err(|e| ApiError::Internal(format!("failed to bind {addr}: {e}"))),
        }
    }
}

/// The daemon's HTTP API server.
#[derive(Debug)]
pub struct ApiServer {
    listen: ListenAddr,
    app: Router,
}

impl ApiServer {
    /// Creates a server for `engine` configured from `config`.
    #[must_use]
    pub fn new(config: &DaemonConfig, engine: Arc<Engine>) -> Self {
        let options = RouterOptions {
            enable_cors: config.enable_cors,
            debug: config.debug,
        };
        Self {
            listen: config.listen.clone(),
            app: create_router(engine, options),
        }
    }

    /// Address the server listens on.
    #[must_use]
    pub const fn listen_addr(&self) -> &ListenAddr {
        &self.listen
    }

    /// Binds the listen address and serves until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or accepting fails.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = Listener::bind(&self.listen).await?;
        tracing::info!(listen = %self.listen, "API server listening");
        serve(listener, self.app, shutdown).await?;
        if let ListenAddr::Unix(path) = &self.listen {
            let _ = std::fs::remove_file(path);
        }
        tracing::info!("API server stopped");
        Ok(())
    }
}

/// Serves `app` on `listener` until `shutdown` resolves. Connections already
/// accepted keep running on their own tasks.
///
/// # Errors
///
/// Returns an error if accepting a connection fails.
pub async fn serve<F>(listener: Listener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => return Ok(()),
            accepted = accept(&listener, app.clone()) => accepted?,
        }
    }
}

async fn accept(listener: &Listener, app: Router) -> Result<()> {
    match listener {
        Listener::Unix(listener) => {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| ApiError::Internal(format!("accept failed: {e}")))?;
            spawn_connection(stream, app);
        }
        Listener::Tcp(listener) => {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| ApiError::Internal(format!("accept failed: {e}")))?;
            tracing::debug!(%peer, "connection accepted");
            spawn_connection(stream, app);
        }
    }
    Ok(())
}

fn spawn_connection<IO>(stream: IO, app: Router)
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let _ = tokio::spawn(async move {
        let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
            app.clone().call(request)
        });
        if let Err(err) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            let message = err.to_string().to_lowercase();
            if !message.contains("connection reset") && !message.contains("broken pipe") {
                tracing::warn!(error = %err, "error serving connection");
            }
        }
    });
}
