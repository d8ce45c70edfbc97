//! Native messaging host for MCP servers.
//!
//! A browser extension talks to this process over native messaging
//! (length-prefixed JSON on stdin/stdout). The process spawns an MCP server and
//! relays the extension's actions to it as JSON-RPC tool calls over the
//! server's stdio, routing each answer back to whoever asked.
//!
//! - `ipc` - framing codecs and the host / subprocess channel managers
//! - `dispatch` - routing decisions and the pluggable action catalog
//! - `correlation` - internal id → caller id table
//! - `bridge` - the relay loop tying it all together
//! - `models` - wire types for both channels
//!
//! ```ignore
//! use mcp_native_host::bridge::Bridge;
//! use mcp_native_host::config::BridgeConfig;
//!
//! Bridge::from_config(BridgeConfig::default()).run_stdio().await?;
//! ```

pub mod bridge;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod models;
