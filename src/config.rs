//! Runtime configuration and command-line parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::dispatch::{ToolCatalog, DEFAULT_ACTIONS};
use crate::ipc::SpawnConfig;

/// MCP protocol revision sent in `initialize`.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name sent in `initialize`.
pub const DEFAULT_CLIENT_NAME: &str = "gmail-mcp-bridge";

/// Server script looked up next to the executable.
pub const DEFAULT_SERVER_SCRIPT: &str = "index.js";

/// Text of the startup notice.
pub const READY_MESSAGE: &str = "MCP Bridge is ready";

/// Everything the bridge needs to run.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub server: SpawnConfig,
    pub client_name: String,
    pub client_version: String,
    pub protocol_version: String,
    /// How long a forwarded action may wait for the server. `None` waits forever.
    pub pending_timeout: Option<Duration>,
    /// How often expired requests are swept.
    pub sweep_interval: Duration,
    /// Delay before the ready notice is sent to the host.
    pub ready_delay: Duration,
    pub ready_message: String,
    /// Grace period for the server to exit before it is killed.
    pub shutdown_timeout: Duration,
    /// Action names forwarded to the server as tool calls.
    pub actions: Vec<String>,
}

impl BridgeConfig {
    /// Catalog built from the configured action names.
    pub fn catalog(&self) -> ToolCatalog {
        ToolCatalog::new(self.actions.iter().cloned())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: SpawnConfig {
                command: "node".to_string(),
                args: vec![default_server_script().to_string_lossy().into_owned()],
                working_directory: None,
            },
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            pending_timeout: Some(Duration::from_secs(120)),
            sweep_interval: Duration::from_secs(1),
            ready_delay: Duration::from_millis(500),
            ready_message: READY_MESSAGE.to_string(),
            shutdown_timeout: Duration::from_secs(5),
            actions: DEFAULT_ACTIONS.iter().map(|a| (*a).to_string()).collect(),
        }
    }
}

/// `index.js` in the executable's directory, or the bare name if that
/// directory cannot be determined.
pub fn default_server_script() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_SERVER_SCRIPT)))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_SCRIPT))
}

/// Command line as launched by the browser.
#[derive(Parser, Debug)]
#[command(name = "mcp-native-host")]
#[command(version, about = "Native messaging host relaying browser requests to an MCP server")]
pub struct CliArgs {
    /// Caller identification passed by the browser (extension origin, or
    /// manifest path and extension id).
    #[arg(value_name = "ORIGIN")]
    pub caller: Vec<String>,

    /// Native window handle passed by Chrome on Windows. Unused.
    #[arg(long, hide = true)]
    pub parent_window: Option<String>,

    /// Program that runs the MCP server
    #[arg(long, default_value = "node", env = "MCP_SERVER_COMMAND")]
    pub server: String,

    /// Argument for the server program (repeatable). Defaults to index.js
    /// next to this executable.
    #[arg(
        long = "server-arg",
        env = "MCP_SERVER_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true
    )]
    pub server_args: Vec<String>,

    /// Action name forwarded as a tool call (repeatable)
    #[arg(long = "action", env = "MCP_BRIDGE_ACTIONS", value_delimiter = ',')]
    pub actions: Vec<String>,

    /// Seconds a forwarded action may wait for the server; 0 waits forever
    #[arg(long, default_value_t = 120, env = "MCP_PENDING_TIMEOUT_SECS")]
    pub pending_timeout_secs: u64,

    /// Milliseconds before the ready notice is sent
    #[arg(long, default_value_t = 500)]
    pub ready_delay_ms: u64,

    /// Seconds to wait for the server to exit before killing it
    #[arg(long, default_value_t = 5)]
    pub shutdown_timeout_secs: u64,
}

impl CliArgs {
    /// The extension origin, when the browser supplied one.
    pub fn origin(&self) -> Option<&str> {
        self.caller
            .iter()
            .find(|arg| arg.contains("://"))
            .or_else(|| self.caller.first())
            .map(String::as_str)
    }

    pub fn into_config(self) -> BridgeConfig {
        let defaults = BridgeConfig::default();

        let args = if self.server_args.is_empty() {
            defaults.server.args.clone()
        } else {
            self.server_args
        };
        let actions = if self.actions.is_empty() {
            defaults.actions.clone()
        } else {
            self.actions
        };

        BridgeConfig {
            server: SpawnConfig {
                command: self.server,
                args,
                working_directory: None,
            },
            pending_timeout: (self.pending_timeout_secs > 0)
                .then(|| Duration::from_secs(self.pending_timeout_secs)),
            ready_delay: Duration::from_millis(self.ready_delay_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            actions,
            ..defaults
        }
    }
}
