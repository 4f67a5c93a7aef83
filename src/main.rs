mod bootstrap;
mod mcp;
mod messaging;
mod rpc;
mod stdio;
mod watchdog;

use clap::Parser;

use wabridge_core::config::{
    Config, Mode, DEFAULT_DB_PATH, DEFAULT_MCP_ADDR, DEFAULT_MEDIA_DIR, DEFAULT_RPC_ADDR,
};

#[derive(Parser)]
#[command(
    name = "wabridge",
    version,
    about = "WhatsApp bridge daemon — one paired session, local history, three transports"
)]
struct Cli {
    /// Run mode: server (host subprocess), interactive, or headless.
    #[arg(long, default_value = "server", value_parser = ["server", "interactive", "headless"])]
    mode: String,

    /// Bridge database path. The library device store lands alongside it
    /// with the `_wa` suffix.
    #[arg(long = "db", env = "WA_DATABASE_PATH", default_value = DEFAULT_DB_PATH)]
    db_path: String,

    /// Media download directory; "none" disables media downloads.
    #[arg(long = "media", env = "WA_MEDIA_PATH", default_value = DEFAULT_MEDIA_DIR)]
    media_dir: String,

    /// Binary RPC bind address.
    #[arg(long = "grpc-port", env = "WA_GRPC_ADDRESS", default_value = DEFAULT_RPC_ADDR)]
    rpc_addr: String,

    /// MCP/SSE bind address.
    #[arg(long = "mcp-port", env = "WA_MCP_ADDRESS", default_value = DEFAULT_MCP_ADDR)]
    mcp_addr: String,

    /// Log level filter (overridden by RUST_LOG).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Stdout belongs to the transport contract (the `ready` token in server
    // mode, protocol lines in headless); all logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let mode = match cli.mode.as_str() {
        "interactive" => Mode::Interactive,
        "headless" => Mode::Headless,
        _ => Mode::Server,
    };

    let media_dir = match cli.media_dir.as_str() {
        "" | "none" => None,
        dir => Some(dir.to_string()),
    };

    // Env-only: an integer parent pid arms the watchdog.
    let parent_pid = std::env::var("WA_PARENT_PID")
        .ok()
        .and_then(|raw| raw.trim().parse::<i32>().ok());

    let config = Config {
        mode,
        db_path: cli.db_path,
        media_dir,
        rpc_addr: cli.rpc_addr,
        mcp_addr: cli.mcp_addr,
        log_level: cli.log_level,
        parent_pid,
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(bootstrap::run(config))
}
