//! Channel managers for both sides of the relay.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  u32 + JSON   ┌───────────────────────────────┐  JSON lines  ┌────────────┐
//! │ Browser  │ ◄───────────► │ host reader ─┐      ┌► stdin  │ ◄──────────► │ MCP server │
//! │ extension│   stdin/out   │ host writer ◄┴ bridge┴─ stdout │   pipes      │ (child)    │
//! └──────────┘               └───────────────────────────────┘              └────────────┘
//! ```
//!
//! Each read loop is sequential and only pushes [`RelayEvent`]s into one
//! bounded queue. A single bridge task consumes the queue, so routing state
//! has exactly one mutator. Each output stream has exactly one writer task,
//! fed by its own queue, so concurrent producers can never interleave frames.

mod framing;
mod host;
mod subprocess;

use tokio::sync::mpsc;

use crate::models::{HostMessage, ServerMessage};

pub use framing::{
    decode_line, encode_envelope, encode_line, read_envelope, write_envelope, FramingError,
    LENGTH_PREFIX_SIZE, MAX_INBOUND_SIZE, MAX_OUTBOUND_SIZE,
};
pub use host::{spawn_host_reader, spawn_host_writer, HostSender};
pub use subprocess::{SpawnConfig, SubprocessChannel};

/// Maximum number of queued events or outgoing messages before backpressure.
pub const CHANNEL_BOUND: usize = 64;

/// Something one of the read loops observed.
#[derive(Debug)]
pub enum RelayEvent {
    /// A decoded message from the host.
    Host(HostMessage),
    /// Host input reached EOF or a broken frame. No more host events follow.
    HostClosed,
    /// A decoded message from the MCP server.
    Server(ServerMessage),
    /// The MCP server's stdout closed. No more server events follow.
    ServerClosed,
}

/// Sending half of the event queue.
pub type EventSender = mpsc::Sender<RelayEvent>;

/// The queue both read loops feed and the bridge drains.
pub struct EventQueue {
    tx: EventSender,
    rx: mpsc::Receiver<RelayEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_BOUND);
        Self { tx, rx }
    }

    /// A producer handle for a read loop.
    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    pub(crate) fn into_parts(self) -> (EventSender, mpsc::Receiver<RelayEvent>) {
        (self.tx, self.rx)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
