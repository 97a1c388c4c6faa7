//! Attach sessions: a raw client connection bridged to a container's streams.
//!
//! The session runs two directions as plain futures and returns once both
//! have finished:
//!
//! - input copies client bytes into the container's stdin until the client
//!   half-closes, the connection fails, or stdin rejects a write;
//! - output copies stdout/stderr chunks to the client until the container
//!   closes both streams or a client write fails.
//!
//! When the client ends its input the container keeps running. For a
//! `StdinOnce` container the container's stdin is closed and output keeps
//! flowing until the process closes its streams; otherwise output stops with
//! the input.

use std::io;
use std::sync::Arc;

use berth_common::types::ContainerId;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::logs::{LogEntry, STDERR, STDOUT};
use crate::stdio::StdinPipe;

const READ_CHUNK: usize = 4096;

/// Stream selector of a multiplexed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    /// Standard input (never sent by the daemon).
    Stdin = 0,
    /// Standard output.
    Stdout = 1,
    /// Standard error.
    Stderr = 2,
}

/// Which streams a client wants and how output is framed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachOptions {
    /// Forward client input to the container's stdin.
    pub stdin: bool,
    /// Forward the container's stdout.
    pub stdout: bool,
    /// Forward the container's stderr.
    pub stderr: bool,
    /// Prefix every output chunk with an 8-byte stream header.
    pub multiplex: bool,
}

/// Encodes one output chunk, framed when `multiplex` is set.
///
/// A frame header is `[stream, 0, 0, 0, len_be32]`.
///
/// # Errors
///
/// Returns [`io::ErrorKind::InvalidData`] if a framed payload exceeds
/// `u32::MAX` bytes.
pub fn encode_output(kind: StreamKind, payload: &[u8], multiplex: bool) -> io::Result<Bytes> {
    if !multiplex {
        return Ok(Bytes::copy_from_slice(payload));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame payload too large"))?;
    let mut frame = BytesMut::with_capacity(8 + payload.len());
    frame.put_u8(kind as u8);
    frame.put_bytes(0, 3);
    frame.put_u32(len);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Renders logged output for a non-streaming attach.
#[must_use]
pub fn buffered_output(entries: &[LogEntry], options: AttachOptions) -> Bytes {
    let mut out = BytesMut::new();
    for entry in entries {
        let kind = match entry.stream.as_str() {
            STDOUT if options.stdout => StreamKind::Stdout,
            STDERR if options.stderr => StreamKind::Stderr,
            _ => continue,
        };
        match encode_output(kind, entry.log.as_bytes(), options.multiplex) {
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(e) => tracing::debug!(error = %e, "skipping oversized log entry"),
        }
    }
    out.freeze()
}

/// Why the input direction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputEnd {
    /// The client half-closed or dropped the connection.
    ClientClosed,
    /// The container's stdin refused a write.
    StdinRejected,
}

/// A prepared attach, holding subscriptions taken before the connection is
/// handed over so that no output produced in between is lost.
#[derive(Debug)]
pub struct AttachSession {
    container_id: ContainerId,
    stdin: Option<Arc<StdinPipe>>,
    stdin_once: bool,
    stdout: Option<broadcast::Receiver<Bytes>>,
    stderr: Option<broadcast::Receiver<Bytes>>,
    multiplex: bool,
}

impl AttachSession {
    /// Builds a session from the container's current stream handles.
    #[must_use]
    pub const fn new(
        container_id: ContainerId,
        stdin: Option<Arc<StdinPipe>>,
        stdin_once: bool,
        stdout: Option<broadcast::Receiver<Bytes>>,
        stderr: Option<broadcast::Receiver<Bytes>>,
        multiplex: bool,
    ) -> Self {
        Self {
            container_id,
            stdin,
            stdin_once,
            stdout,
            stderr,
            multiplex,
        }
    }

    /// Bridges `conn` to the container until both directions are done, then
    /// shuts down the connection's write side.
    pub async fn run<C>(self, conn: C)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let Self {
            container_id,
            stdin,
            stdin_once,
            mut stdout,
            mut stderr,
            multiplex,
        } = self;
        tracing::debug!(id = %container_id, stdin = stdin.is_some(), multiplex, "attach session started");

        // Output-only sessions outlive a client half-close; they end when the
        // streams close or a write to the client fails.
        let output_only = stdin.is_none() && (stdout.is_some() || stderr.is_some());
        let (mut reader, mut writer) = tokio::io::split(conn);
        {
            let input = copy_input(&mut reader, stdin.as_deref(), stdin_once);
            let output = copy_output(&mut writer, &mut stdout, &mut stderr, multiplex);
            tokio::pin!(input, output);

            tokio::select! {
                () = &mut output => {
                    tracing::debug!(id = %container_id, "container streams closed");
                }
                end = &mut input => {
                    let keep_output = output_only
                        || end == InputEnd::StdinRejected
                        || (stdin_once && stdin.is_some());
                    if keep_output {
                        output.await;
                    }
                    tracing::debug!(id = %container_id, ?end, keep_output, "client input ended");
                }
            }
        }

        if let Err(e) = writer.shutdown().await {
            tracing::debug!(id = %container_id, error = %e, "attach shutdown failed");
        }
        tracing::debug!(id = %container_id, "attach session finished");
    }
}

async fn copy_input<R>(reader: &mut R, stdin: Option<&StdinPipe>, stdin_once: bool) -> InputEnd
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let end = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break InputEnd::ClientClosed,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "attach input read failed");
                break InputEnd::ClientClosed;
            }
        };
        // Without stdin, keep reading only to notice the client leaving.
        if let Some(stdin) = stdin {
            if let Err(e) = stdin.write_all(&buf[..n]).await {
                tracing::debug!(error = %e, "container stdin rejected write");
                break InputEnd::StdinRejected;
            }
        }
    };
    if end == InputEnd::ClientClosed && stdin_once {
        if let Some(stdin) = stdin {
            stdin.close().await;
        }
    }
    end
}

async fn next_chunk(rx: &mut Option<broadcast::Receiver<Bytes>>) -> Option<Bytes> {
    loop {
        let receiver = rx.as_mut()?;
        match receiver.recv().await {
            Ok(chunk) => return Some(chunk),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "attach output lagged");
            }
            Err(RecvError::Closed) => {
                *rx = None;
                return None;
            }
        }
    }
}

async fn copy_output<W>(
    writer: &mut W,
    stdout: &mut Option<broadcast::Receiver<Bytes>>,
    stderr: &mut Option<broadcast::Receiver<Bytes>>,
    multiplex: bool,
) where
    W: AsyncWrite + Unpin,
{
    // Nothing requested: the session is governed by input alone.
    if stdout.is_none() && stderr.is_none() {
        return std::future::pending().await;
    }
    loop {
        let (kind, chunk) = tokio::select! {
            Some(chunk) = next_chunk(stdout), if stdout.is_some() => (StreamKind::Stdout, chunk),
            Some(chunk) = next_chunk(stderr), if stderr.is_some() => (StreamKind::Stderr, chunk),
            else => break,
        };
        let write = async {
            let frame = encode_output(kind, &chunk, multiplex)?;
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        if let Err(e) = write.await {
            tracing::debug!(error = %e, "attach output write failed");
            break;
        }
    }
}
