//! Routing decisions for messages from either side.
//!
//! The dispatcher is pure routing: it consults the correlation table and the
//! action catalog and says what should happen, but performs no I/O. The bridge
//! task carries out the decision.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::correlation::{CorrelationTable, InternalId};
use crate::error::RelayError;
use crate::models::{
    ExternalId, HostMessage, HostReply, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ServerMessage, METHOD_NOT_FOUND,
};

/// Actions the Gmail extension sends by default.
pub const DEFAULT_ACTIONS: &[&str] = &[
    "getEmails",
    "getEmailContent",
    "composeReply",
    "sendEmail",
];

/// A JSON-RPC call the MCP server should receive for a host action.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardCall {
    pub method: String,
    pub params: Value,
}

/// Decides which host actions are forwarded and how.
///
/// This is the seam where the actual business actions plug in; the relay
/// itself treats action payloads as opaque.
pub trait ActionCatalog: Send + Sync {
    /// Map an action to the call to forward, or `None` if it is unknown.
    fn route(&self, action: &str, params: Option<Value>) -> Option<ForwardCall>;
}

/// Forwards a fixed set of action names as MCP `tools/call` requests.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    actions: BTreeSet<String>,
}

impl ToolCatalog {
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, action: &str) -> bool {
        self.actions.contains(action)
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIONS.iter().copied())
    }
}

impl ActionCatalog for ToolCatalog {
    fn route(&self, action: &str, params: Option<Value>) -> Option<ForwardCall> {
        if !self.contains(action) {
            return None;
        }
        Some(ForwardCall {
            method: "tools/call".to_string(),
            params: json!({
                "name": action,
                "arguments": params.unwrap_or_else(|| json!({})),
            }),
        })
    }
}

/// What to do with a message from the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostDispatch {
    /// Answer the host directly.
    Reply(HostReply),
    /// Send `request` to the MCP server; `id` is already registered.
    Forward {
        id: InternalId,
        request: JsonRpcRequest,
    },
    /// Drop it.
    Ignore,
}

/// What to do with a message from the MCP server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerDispatch {
    /// Deliver to the host.
    Reply(HostReply),
    /// Answer the MCP server.
    Respond(JsonRpcResponse),
    /// The server answered our `initialize` request.
    Initialized(Result<Value, String>),
    /// Drop it.
    Ignore,
}

/// Build the liveness reply.
pub fn pong(id: ExternalId, server_connected: bool) -> HostReply {
    let now = chrono::Utc::now();
    HostReply::response(
        id,
        json!({
            "status": "pong",
            "mcp_connected": server_connected,
            "timestamp": now.timestamp_millis() as f64 / 1000.0,
        }),
    )
}

/// Routes messages using the shared correlation table and an action catalog.
pub struct Dispatcher<C> {
    table: Arc<CorrelationTable>,
    catalog: C,
}

impl<C: ActionCatalog> Dispatcher<C> {
    pub fn new(table: Arc<CorrelationTable>, catalog: C) -> Self {
        Self { table, catalog }
    }

    pub fn table(&self) -> &CorrelationTable {
        &self.table
    }

    /// Route a message from the host.
    ///
    /// `server_alive` only affects actions: pings are answered whatever the
    /// MCP server's state.
    pub fn on_host_message(&self, message: HostMessage, server_alive: bool) -> HostDispatch {
        match message {
            HostMessage::Ping { id } => HostDispatch::Reply(pong(id, server_alive)),

            HostMessage::Reply { id, response } => match self.table.resolve_external(&id) {
                Some((internal_id, pending)) => {
                    debug!(
                        internal_id,
                        action = %pending.action,
                        "Host answered pending request itself"
                    );
                    HostDispatch::Reply(HostReply::response(id, response))
                }
                None => {
                    debug!(id = %id, "Host reply matches no pending request, dropping");
                    HostDispatch::Ignore
                }
            },

            HostMessage::Action { id, action, params } => {
                let Some(call) = self.catalog.route(&action, params) else {
                    debug!(%action, "Unknown action");
                    return HostDispatch::Reply(HostReply::error(
                        id,
                        RelayError::UnknownAction(action).to_string(),
                    ));
                };

                if !server_alive {
                    warn!(%action, "MCP server is gone, refusing action");
                    return HostDispatch::Reply(HostReply::error(
                        id,
                        RelayError::SubprocessUnavailable("server has exited".to_string())
                            .to_string(),
                    ));
                }

                let internal_id = self.table.allocate(id, action);
                HostDispatch::Forward {
                    id: internal_id,
                    request: JsonRpcRequest::new(call.method, call.params, internal_id),
                }
            }

            HostMessage::Unroutable { id } => {
                debug!(?id, "Message has neither action nor response, dropping");
                HostDispatch::Ignore
            }
        }
    }

    /// Route a message from the MCP server.
    pub fn on_server_message(
        &self,
        message: ServerMessage,
        initialize_id: Option<InternalId>,
    ) -> ServerDispatch {
        let internal_id = message.internal_id();
        match message {
            ServerMessage::Response { id, outcome } => {
                let Some(internal_id) = internal_id else {
                    warn!(id = %id, "Response id was never issued by the relay, dropping");
                    return ServerDispatch::Ignore;
                };

                if initialize_id == Some(internal_id) {
                    return ServerDispatch::Initialized(outcome);
                }

                match self.table.resolve(internal_id) {
                    Some(pending) => ServerDispatch::Reply(match outcome {
                        Ok(result) => HostReply::response(pending.external_id, result),
                        Err(message) => HostReply::error(pending.external_id, message),
                    }),
                    None => {
                        warn!("{}, dropping", RelayError::CorrelationMiss(internal_id));
                        ServerDispatch::Ignore
                    }
                }
            }

            ServerMessage::Request { id, method, .. } => {
                debug!(%method, "MCP server request has no handler");
                ServerDispatch::Respond(JsonRpcResponse::error(
                    id,
                    JsonRpcError {
                        code: METHOD_NOT_FOUND,
                        message: format!("Method not found: {method}"),
                        data: None,
                    },
                ))
            }

            ServerMessage::Notification { method, .. } => {
                debug!(%method, "MCP server notification");
                ServerDispatch::Ignore
            }
        }
    }
}
