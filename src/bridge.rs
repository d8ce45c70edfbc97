//! The relay loop.
//!
//! [`Bridge::run`] owns the dispatch side of the relay: it starts the host
//! read/write tasks, performs the MCP handshake, and then consumes the event
//! queue until the host goes away. All routing decisions come from
//! [`Dispatcher`]; this module only carries them out.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::correlation::{CorrelationTable, InternalId};
use crate::dispatch::{ActionCatalog, Dispatcher, HostDispatch, ServerDispatch, ToolCatalog};
use crate::error::RelayError;
use crate::ipc::{
    spawn_host_reader, spawn_host_writer, EventQueue, HostSender, RelayEvent, SubprocessChannel,
};
use crate::models::{HostMessage, HostReply, JsonRpcRequest, ServerMessage};

/// A configured relay, ready to run once.
pub struct Bridge<C> {
    config: BridgeConfig,
    catalog: C,
}

impl Bridge<ToolCatalog> {
    /// Relay forwarding the configured action names as tool calls.
    pub fn from_config(config: BridgeConfig) -> Self {
        let catalog = config.catalog();
        Self::new(config, catalog)
    }
}

impl<C: ActionCatalog + 'static> Bridge<C> {
    pub fn new(config: BridgeConfig, catalog: C) -> Self {
        Self { config, catalog }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Spawn the configured MCP server and relay between it and this
    /// process's stdin/stdout.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Spawn`] if the server cannot be started. Nothing
    /// else after startup is fatal.
    pub async fn run_stdio(self) -> Result<(), RelayError> {
        let events = EventQueue::new();
        let server = SubprocessChannel::spawn(&self.config.server, events.sender())?;
        self.run(tokio::io::stdin(), tokio::io::stdout(), server, events)
            .await
    }

    /// Relay between a host stream pair and an attached server until the host
    /// input closes, then shut the server down.
    ///
    /// `events` must be the queue `server` was attached to.
    pub async fn run<R, W>(
        self,
        host_in: R,
        host_out: W,
        server: SubprocessChannel,
        events: EventQueue,
    ) -> Result<(), RelayError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Bridge { config, catalog } = self;

        let table = Arc::new(CorrelationTable::new(config.pending_timeout));
        let (host, host_writer) = spawn_host_writer(host_out);
        let (tx, mut rx) = events.into_parts();
        let host_reader = spawn_host_reader(host_in, tx);

        let mut session = Session {
            dispatcher: Dispatcher::new(Arc::clone(&table), catalog),
            host,
            server,
            initialize_id: None,
        };
        session.initialize(&config);

        let ready = tokio::time::sleep(config.ready_delay);
        tokio::pin!(ready);
        let mut ready_sent = false;

        let sweeping = config.pending_timeout.is_some();
        let mut sweep = tokio::time::interval(config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Relay started");
        loop {
            let step = tokio::select! {
                event = rx.recv() => match event {
                    Some(RelayEvent::Host(message)) => session.on_host(message).await,
                    Some(RelayEvent::Server(message)) => session.on_server(message).await,
                    Some(RelayEvent::ServerClosed) => session.on_server_closed().await,
                    Some(RelayEvent::HostClosed) | None => break,
                },
                () = &mut ready, if !ready_sent => {
                    ready_sent = true;
                    session.host.send(HostReply::ready(&config.ready_message)).await
                }
                _ = sweep.tick(), if sweeping => session.sweep(Instant::now()).await,
            };
            if let Err(e) = step {
                error!("Host output closed, stopping relay: {}", e);
                break;
            }
        }

        info!("Shutting down relay");
        drop(rx);
        let Session { host, server, .. } = session;

        if let Some(status) = server.shutdown(config.shutdown_timeout).await {
            debug!(%status, "MCP server reaped");
        }
        for (internal_id, pending) in table.drain() {
            warn!(
                internal_id,
                action = %pending.action,
                "Request still pending at shutdown, dropping"
            );
        }

        drop(host);
        host_reader.abort();
        if tokio::time::timeout(config.shutdown_timeout, host_writer)
            .await
            .is_err()
        {
            warn!("Host writer did not drain in time");
        }
        info!("Relay stopped");
        Ok(())
    }
}

/// State owned by the dispatch loop.
struct Session<C> {
    dispatcher: Dispatcher<C>,
    host: HostSender,
    server: SubprocessChannel,
    /// Id of our `initialize` request while its answer is outstanding.
    initialize_id: Option<InternalId>,
}

// Handlers only fail when the host writer is gone; everything else is
// logged and absorbed here.
impl<C: ActionCatalog> Session<C> {
    fn initialize(&mut self, config: &BridgeConfig) {
        let id = self.dispatcher.table().reserve();
        let request = JsonRpcRequest::new(
            "initialize",
            json!({
                "protocolVersion": config.protocol_version,
                "capabilities": {},
                "clientInfo": {
                    "name": config.client_name,
                    "version": config.client_version,
                },
            }),
            id,
        );
        match self.server.send(&request) {
            Ok(()) => {
                debug!(id, "Sent initialize");
                self.initialize_id = Some(id);
            }
            Err(e) => warn!("Failed to send initialize: {}", e),
        }
    }

    async fn on_host(&mut self, message: HostMessage) -> Result<(), RelayError> {
        match self
            .dispatcher
            .on_host_message(message, self.server.is_alive())
        {
            HostDispatch::Reply(reply) => self.host.send(reply).await,
            HostDispatch::Forward { id, request } => {
                if let Err(e) = self.server.send(&request) {
                    warn!(internal_id = id, "Failed to forward request: {}", e);
                    if let Some(pending) = self.dispatcher.table().resolve(id) {
                        self.host
                            .send(HostReply::error(pending.external_id, e.to_string()))
                            .await?;
                    }
                }
                Ok(())
            }
            HostDispatch::Ignore => Ok(()),
        }
    }

    async fn on_server(&mut self, message: ServerMessage) -> Result<(), RelayError> {
        match self.dispatcher.on_server_message(message, self.initialize_id) {
            ServerDispatch::Reply(reply) => self.host.send(reply).await,
            ServerDispatch::Respond(response) => {
                if let Err(e) = self.server.send(&response) {
                    warn!("Failed to answer MCP server request: {}", e);
                }
                Ok(())
            }
            ServerDispatch::Initialized(outcome) => {
                self.initialize_id = None;
                self.on_initialized(outcome);
                Ok(())
            }
            ServerDispatch::Ignore => Ok(()),
        }
    }

    fn on_initialized(&mut self, outcome: Result<Value, String>) {
        match outcome {
            Ok(result) => {
                let server_info = result.get("serverInfo").cloned().unwrap_or(Value::Null);
                let protocol = result
                    .get("protocolVersion")
                    .cloned()
                    .unwrap_or(Value::Null);
                info!(
                    server = %server_info,
                    protocol = %protocol,
                    "MCP server initialized"
                );
                let note = JsonRpcRequest::notification("notifications/initialized", None);
                if let Err(e) = self.server.send(&note) {
                    warn!("Failed to send initialized notification: {}", e);
                }
            }
            Err(message) => warn!("MCP server rejected initialize: {}", message),
        }
    }

    /// Fail everything that was waiting on the server.
    async fn on_server_closed(&mut self) -> Result<(), RelayError> {
        warn!("MCP server is gone");
        self.initialize_id = None;
        let message = RelayError::SubprocessUnavailable("server exited".to_string()).to_string();
        for (internal_id, pending) in self.dispatcher.table().drain() {
            debug!(internal_id, action = %pending.action, "Failing pending request");
            self.host
                .send(HostReply::error(pending.external_id, message.clone()))
                .await?;
        }
        Ok(())
    }

    async fn sweep(&mut self, now: Instant) -> Result<(), RelayError> {
        let table = self.dispatcher.table();
        let Some(ttl) = table.ttl() else {
            return Ok(());
        };
        for (internal_id, pending) in table.expire(now) {
            warn!(internal_id, action = %pending.action, "Request timed out");
            self.host
                .send(HostReply::error(
                    pending.external_id,
                    RelayError::Timeout(ttl).to_string(),
                ))
                .await?;
        }
        Ok(())
    }
}
