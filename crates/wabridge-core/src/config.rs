//! Runtime configuration.
//!
//! There is no config file: the binary builds a [`Config`] from CLI flags,
//! with environment variables as fallback and the built-in defaults below as
//! the floor (flags > env > defaults).

use serde::{Deserialize, Serialize};

/// Default binary RPC bind address.
pub const DEFAULT_RPC_ADDR: &str = "127.0.0.1:50051";
/// Default MCP/SSE bind address.
pub const DEFAULT_MCP_ADDR: &str = "127.0.0.1:8080";
/// Default bridge database path.
pub const DEFAULT_DB_PATH: &str = "~/.wabridge/messages.db";
/// Default media download directory.
pub const DEFAULT_MEDIA_DIR: &str = "~/.wabridge/media";
/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Which stdio behavior the daemon runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Host-subprocess mode: stdout carries only the `ready` token.
    Server,
    /// Human `/command` REPL on stdin/stdout.
    Interactive,
    /// Line-delimited JSON protocol on stdin/stdout.
    Headless,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Bridge database path. The library device store lives alongside it
    /// with the `_wa` suffix.
    pub db_path: String,
    /// Media download directory; `None` disables media downloads.
    pub media_dir: Option<String>,
    pub rpc_addr: String,
    pub mcp_addr: String,
    pub log_level: String,
    /// Host process to watch; set via `WA_PARENT_PID` only.
    pub parent_pid: Option<i32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Server,
            db_path: DEFAULT_DB_PATH.to_string(),
            media_dir: Some(DEFAULT_MEDIA_DIR.to_string()),
            rpc_addr: DEFAULT_RPC_ADDR.to_string(),
            mcp_addr: DEFAULT_MCP_ADDR.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            parent_pid: None,
        }
    }
}

impl Config {
    /// Path of the library's device/key store: the bridge database plus a
    /// `_wa` suffix, e.g. `messages.db` → `messages.db_wa`.
    pub fn device_db_path(&self) -> String {
        format!("{}_wa", self.db_path)
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}
