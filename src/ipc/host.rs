//! Host-facing channel: native messaging frames on stdin/stdout.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::framing::{
    read_envelope, write_envelope, FramingError, MAX_INBOUND_SIZE, MAX_OUTBOUND_SIZE,
};
use super::{EventSender, RelayEvent, CHANNEL_BOUND};
use crate::error::RelayError;
use crate::models::{HostMessage, HostReply};

/// Cloneable handle for writing to the host.
///
/// Every clone feeds the same writer task, which writes one frame at a time.
#[derive(Debug, Clone)]
pub struct HostSender {
    tx: mpsc::Sender<HostReply>,
}

impl HostSender {
    /// Queue a reply for the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer task has stopped (host output closed).
    pub async fn send(&self, reply: HostReply) -> Result<(), RelayError> {
        self.tx.send(reply).await.map_err(|_| {
            RelayError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "host writer has stopped",
            ))
        })
    }
}

/// Start the single writer task for host output.
///
/// The task exits once every [`HostSender`] is dropped and the queue is
/// drained, or on the first write failure.
pub fn spawn_host_writer<W>(writer: W) -> (HostSender, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<HostReply>(CHANNEL_BOUND);

    let handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(reply) = rx.recv().await {
            if let Err(e) = write_reply(&mut writer, &reply).await {
                error!("Failed to write to host: {}", e);
                break;
            }
        }
        debug!("Host writer finished");
    });

    (HostSender { tx }, handle)
}

async fn write_reply<W>(writer: &mut W, reply: &HostReply) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(reply)?;
    match write_envelope(writer, &body, MAX_OUTBOUND_SIZE).await {
        Ok(()) => {
            debug!(bytes = body.len(), "Sent to host");
            Ok(())
        }
        // The browser drops the whole connection on an oversized frame, so
        // the caller gets an error in its place.
        Err(FramingError::TooLarge { size, max }) => {
            warn!(size, max, "Reply exceeds host message limit");
            let Some(id) = reply.id() else {
                return Ok(());
            };
            let fallback = HostReply::error(
                id.clone(),
                format!("Response too large: {size} bytes (limit {max})"),
            );
            let body = serde_json::to_vec(&fallback)?;
            match write_envelope(writer, &body, MAX_OUTBOUND_SIZE).await {
                Err(FramingError::TooLarge { .. }) => {
                    warn!("Dropping oversized reply");
                    Ok(())
                }
                other => other.map_err(RelayError::from),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Start the host read loop.
///
/// Decodes envelopes until the stream ends, pushing each classified message
/// into the event queue. Undecodable payloads are logged and skipped. A clean
/// close, a truncated frame or a read error all end the loop with a single
/// [`RelayEvent::HostClosed`].
pub fn spawn_host_reader<R>(reader: R, events: EventSender) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        loop {
            match read_envelope(&mut reader, MAX_INBOUND_SIZE).await {
                Ok(Some(payload)) => match HostMessage::from_slice(&payload) {
                    Ok(message) => {
                        debug!(kind = message.kind(), "Received from host");
                        if events.send(RelayEvent::Host(message)).await.is_err() {
                            debug!("Event queue closed, stopping host reader");
                            return;
                        }
                    }
                    Err(e) => warn!("Dropping host message: {}", e),
                },
                Ok(None) => {
                    info!("Host input closed");
                    break;
                }
                Err(FramingError::Truncated { expected, received }) => {
                    warn!(expected, received, "Host input closed mid-frame");
                    break;
                }
                // Skipping an unread body would desynchronise the stream.
                Err(e) => {
                    error!("Host input failed: {}", e);
                    break;
                }
            }
        }
        let _ = events.send(RelayEvent::HostClosed).await;
    })
}
