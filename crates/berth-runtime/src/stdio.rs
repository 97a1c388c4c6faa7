//! Standard stream plumbing between a container process and its clients.
//!
//! The supervisor hands over raw pipes; this module turns them into handles
//! that outlive any single attach session. Stdin is one shared writer that can
//! be closed once. Stdout and stderr are broadcast so several sessions can
//! follow the same run, and every chunk is also appended to the container log.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::logs::LogSink;

/// Chunks kept for a lagging subscriber before it starts skipping.
const OUTPUT_BACKLOG: usize = 256;
const READ_CHUNK: usize = 4096;

/// Boxed writer for a process stdin pipe.
pub type StdinWriter = Box<dyn AsyncWrite + Send + Unpin>;
/// Boxed reader for a process stdout or stderr pipe.
pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write side of a container's stdin, shared by every attach session.
pub struct StdinPipe {
    writer: tokio::sync::Mutex<Option<StdinWriter>>,
    closed: AtomicBool,
}

impl fmt::Debug for StdinPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdinPipe")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl StdinPipe {
    /// Wraps an open stdin pipe.
    #[must_use]
    pub fn new(writer: StdinWriter) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
        }
    }

    /// A stdin that was never opened.
    #[must_use]
    pub fn closed() -> Self {
        Self {
            writer: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(true),
        }
    }

    /// Writes all of `buf` to the process.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::BrokenPipe`] once stdin is closed, or the
    /// underlying write error when the process has gone away.
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed"))?;
        writer.write_all(buf).await?;
        writer.flush().await
    }

    /// Closes stdin, delivering EOF to the process. Idempotent.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let taken = self.writer.lock().await.take();
        if let Some(mut writer) = taken {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "stdin shutdown failed");
            }
        }
    }

    /// Whether stdin has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Broadcast of one output stream of a container run.
#[derive(Debug)]
pub struct OutputStream {
    sender: Mutex<Option<broadcast::Sender<Bytes>>>,
}

impl Default for OutputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStream {
    /// Creates an open stream.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(OUTPUT_BACKLOG);
        Self {
            sender: Mutex::new(Some(tx)),
        }
    }

    /// A stream that has already ended.
    #[must_use]
    pub fn ended() -> Self {
        Self {
            sender: Mutex::new(None),
        }
    }

    /// Subscribes to chunks published from now on.
    ///
    /// Returns `None` once the stream has ended.
    #[must_use]
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Bytes>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
    }

    /// Like [`OutputStream::subscribe`], but an ended stream yields a receiver
    /// that reports closure immediately.
    #[must_use]
    pub fn follow(&self) -> broadcast::Receiver<Bytes> {
        self.subscribe().unwrap_or_else(|| broadcast::channel(1).1)
    }

    /// Publishes a chunk to every current subscriber.
    pub fn publish(&self, chunk: Bytes) {
        if let Some(tx) = self.sender.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            // No subscribers is not an error.
            let _ = tx.send(chunk);
        }
    }

    /// Ends the stream; subscribers drain what is buffered, then see closure.
    pub fn close(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
    }

    /// Whether the stream has ended.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }
}

/// Stream handles of one container run.
#[derive(Debug, Clone)]
pub struct ContainerStdio {
    /// Shared stdin writer.
    pub stdin: Arc<StdinPipe>,
    /// Stdout broadcast.
    pub stdout: Arc<OutputStream>,
    /// Stderr broadcast.
    pub stderr: Arc<OutputStream>,
}

impl ContainerStdio {
    /// Handles of a container that has never run.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            stdin: Arc::new(StdinPipe::closed()),
            stdout: Arc::new(OutputStream::ended()),
            stderr: Arc::new(OutputStream::ended()),
        }
    }

    /// Wires raw process pipes into shareable handles.
    ///
    /// Spawns one pump task per output pipe; the returned handles complete when
    /// the process closes that pipe.
    pub fn wire(
        stdin: Option<StdinWriter>,
        stdout: Option<OutputReader>,
        stderr: Option<OutputReader>,
        log: Option<Arc<LogSink>>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let stdio = Self {
            stdin: Arc::new(stdin.map_or_else(StdinPipe::closed, StdinPipe::new)),
            stdout: Arc::new(OutputStream::new()),
            stderr: Arc::new(OutputStream::new()),
        };
        let mut pumps = Vec::with_capacity(2);
        for (reader, stream, name) in [
            (stdout, &stdio.stdout, crate::logs::STDOUT),
            (stderr, &stdio.stderr, crate::logs::STDERR),
        ] {
            match reader {
                Some(reader) => pumps.push(spawn_pump(reader, Arc::clone(stream), name, log.clone())),
                None => stream.close(),
            }
        }
        (stdio, pumps)
    }
}

/// Copies a process output pipe into its broadcast and the container log.
pub fn spawn_pump(
    mut reader: OutputReader,
    stream: Arc<OutputStream>,
    name: &'static str,
    log: Option<Arc<LogSink>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if let Some(log) = &log {
                        if let Err(e) = log.write(name, &chunk).await {
                            tracing::warn!(stream = name, error = %e, "failed to append container log");
                        }
                    }
                    stream.publish(chunk);
                }
                Err(e) => {
                    tracing::debug!(stream = name, error = %e, "output pipe read failed");
                    break;
                }
            }
        }
        stream.close();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stdin_pipe_writes_until_closed() {
        let (client, mut process) = tokio::io::duplex(64);
        let pipe = StdinPipe::new(Box::new(client));
        pipe.write_all(b"ping").await.expect("write");

        let mut buf = [0u8; 4];
        process.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");

        pipe.close().await;
        assert!(pipe.is_closed());
        let mut rest = Vec::new();
        let _ = process.read_to_end(&mut rest).await.expect("eof");
        assert!(rest.is_empty());

        let err = pipe.write_all(b"late").await.expect_err("closed");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        pipe.close().await;
    }

    #[tokio::test]
    async fn output_stream_fans_out_and_closes() {
        let stream = OutputStream::new();
        let mut a = stream.subscribe().expect("open");
        let mut b = stream.subscribe().expect("open");
        stream.publish(Bytes::from_static(b"x"));
        stream.close();

        assert_eq!(a.recv().await.expect("chunk"), Bytes::from_static(b"x"));
        assert_eq!(b.recv().await.expect("chunk"), Bytes::from_static(b"x"));
        assert!(a.recv().await.is_err());
        assert!(stream.subscribe().is_none());
        assert!(stream.is_ended());
    }

    #[tokio::test]
    async fn pump_publishes_logs_and_closes_on_eof() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Arc::new(LogSink::open(dir.path(), "c1").await.expect("log"));
        let (mut process, reader) = tokio::io::duplex(64);
        let stream = Arc::new(OutputStream::new());
        let mut rx = stream.subscribe().expect("open");

        let pump = spawn_pump(Box::new(reader), Arc::clone(&stream), crate::logs::STDOUT, Some(log));
        process.write_all(b"hello").await.expect("write");
        drop(process);
        pump.await.expect("pump");

        assert_eq!(rx.recv().await.expect("chunk"), Bytes::from_static(b"hello"));
        assert!(rx.recv().await.is_err());
        let entries = crate::logs::read_logs(dir.path(), "c1").expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].log, "hello");
    }

    #[tokio::test]
    async fn follow_on_ended_stream_reports_closure() {
        let mut rx = OutputStream::ended().follow();
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[test]
    fn detached_stdio_is_closed() {
        let stdio = ContainerStdio::detached();
        assert!(stdio.stdin.is_closed());
        assert!(stdio.stdout.is_ended());
        assert!(stdio.stderr.is_ended());
    }
}
