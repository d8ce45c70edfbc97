//! MCP server subprocess: lifecycle plus its JSON-lines pipes.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::framing::{decode_line, encode_line};
use super::{EventSender, RelayEvent};
use crate::error::RelayError;

/// How to start the MCP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Program to run (e.g. `node`).
    pub command: String,
    /// Arguments (e.g. the server script).
    pub args: Vec<String>,
    /// Working directory; inherited when `None`.
    pub working_directory: Option<PathBuf>,
}

/// Connection to the MCP server.
///
/// Outgoing messages go through a queue to a dedicated stdin writer task, so
/// `send` may be called from anywhere without interleaving lines. A reader
/// task turns stdout lines into [`RelayEvent::Server`] events and emits
/// [`RelayEvent::ServerClosed`] when stdout ends.
///
/// # Process Cleanup Safety
///
/// The child is spawned with `kill_on_drop`, so dropping the channel without
/// calling [`SubprocessChannel::shutdown`] still does not leave it running.
pub struct SubprocessChannel {
    stdin_tx: Option<mpsc::UnboundedSender<String>>,
    child: Option<Child>,
    alive: Arc<AtomicBool>,
    writer: JoinHandle<()>,
}

impl SubprocessChannel {
    /// Spawn the MCP server and start its I/O tasks.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Spawn`] if the process cannot be started or its
    /// pipes cannot be captured.
    pub fn spawn(config: &SpawnConfig, events: EventSender) -> Result<Self, RelayError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_directory {
            cmd.current_dir(dir);
        }

        info!(command = %config.command, args = ?config.args, "Spawning MCP server");
        let mut child = cmd.spawn().map_err(|source| RelayError::Spawn {
            command: config.command.clone(),
            source,
        })?;

        let missing = |pipe: &str| RelayError::Spawn {
            command: config.command.clone(),
            source: io::Error::new(io::ErrorKind::Other, format!("failed to capture {pipe}")),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("MCP stderr: {}", line);
                }
                debug!("MCP stderr reader finished");
            });
        }

        info!(pid = ?child.id(), "MCP server started");
        let mut channel = Self::from_pipes(stdin, stdout, events);
        channel.child = Some(child);
        Ok(channel)
    }

    /// Attach to an already-running server through arbitrary pipes.
    pub fn from_pipes<W, R>(stdin: W, stdout: R, events: EventSender) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(stdin_writer(stdin, stdin_rx, Arc::clone(&alive)));
        tokio::spawn(stdout_reader(stdout, events, Arc::clone(&alive)));

        Self {
            stdin_tx: Some(stdin_tx),
            child: None,
            alive,
            writer,
        }
    }

    /// Queue one JSON-RPC message for the server.
    ///
    /// Never waits: the stdin queue is unbounded, so the dispatch loop keeps
    /// draining server output even while the server is not reading its stdin.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Parse`] if the message cannot be serialized
    /// - [`RelayError::SubprocessUnavailable`] if the stdin writer has stopped
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), RelayError> {
        let line = encode_line(message)?;
        let tx = self
            .stdin_tx
            .as_ref()
            .ok_or_else(|| RelayError::SubprocessUnavailable("stdin is closed".to_string()))?;
        tx.send(line)
            .map_err(|_| RelayError::SubprocessUnavailable("stdin writer has stopped".to_string()))
    }

    /// False once stdout has closed or a stdin write has failed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// OS process id, when this channel owns a child that is still running.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Stop the server: close its stdin, give it `timeout` to exit on its
    /// own, then kill it. Returns the exit status when one was observed.
    pub async fn shutdown(mut self, timeout: Duration) -> Option<ExitStatus> {
        // Dropping the sender lets the writer flush what is queued and then
        // close stdin, which is the stdio transport's shutdown signal.
        drop(self.stdin_tx.take());
        if tokio::time::timeout(timeout, &mut self.writer).await.is_err() {
            warn!("MCP stdin writer stuck, abandoning queued messages");
            self.writer.abort();
        }

        let mut child = self.child.take()?;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, "MCP server exited");
                Some(status)
            }
            Ok(Err(e)) => {
                warn!("Error waiting for MCP server: {}", e);
                None
            }
            Err(_) => {
                warn!("MCP server didn't exit within {:?}, killing", timeout);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill MCP server: {}", e);
                }
                child.try_wait().ok().flatten()
            }
        }
    }
}

async fn stdin_writer<W>(
    stdin: W,
    mut rx: mpsc::UnboundedReceiver<String>,
    alive: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    let mut stdin = stdin;
    while let Some(line) = rx.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            error!("Failed to write to MCP server stdin: {}", e);
            alive.store(false, Ordering::SeqCst);
            return;
        }
        debug!("Sent to MCP: {}", line.trim_end());
    }
    let _ = stdin.shutdown().await;
    debug!("MCP stdin writer finished");
}

async fn stdout_reader<R>(stdout: R, events: EventSender, alive: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                info!("MCP server stdout closed");
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                debug!("MCP output: {}", line.trim_end());
                match decode_line(&line) {
                    Ok(Some(message)) => {
                        if events.send(RelayEvent::Server(message)).await.is_err() {
                            debug!("Event queue closed, stopping MCP reader");
                            alive.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Dropping MCP output: {}", e),
                }
            }
            Err(e) => {
                error!("Error reading MCP output: {}", e);
                break;
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    let _ = events.send(RelayEvent::ServerClosed).await;
}
