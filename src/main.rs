use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod mux;
mod proxy;
mod stream;
mod transport;
mod utils;

use config::Config;
use error::Result;

#[derive(Parser, Debug)]
#[command(name = "mux-tls-tunnel")]
#[command(about = "Local TCP tunnel over TLS / WebSocket with pooled Yamux sessions", long_about = None)]
struct Args {
    /// Local listen address
    #[arg(short = 'l', long, default_value = config::DEFAULT_LISTEN_ADDR)]
    bind: String,

    /// Remote address (e.g., example.com:443)
    #[arg(short = 'r', long)]
    remote: String,

    /// TLS server name (defaults to the remote host)
    #[arg(long)]
    server_name: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Wrap the TLS connection in WebSocket
    #[arg(long)]
    websocket: bool,

    /// WebSocket path
    #[arg(long, default_value = config::DEFAULT_WS_PATH)]
    path: String,

    /// Enable Yamux multiplexing
    #[arg(long)]
    mux: bool,

    /// Max streams per multiplexed session
    #[arg(long, default_value_t = config::DEFAULT_MUX_MAX_STREAMS)]
    mux_max_streams: usize,

    /// Dial + handshake timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Idle check interval in seconds
    #[arg(long, default_value_t = 2)]
    mux_idle_check: u64,

    /// Close a session after this many idle seconds
    #[arg(long, default_value_t = 30)]
    mux_idle_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            listen_addr: self.bind,
            remote_addr: self.remote,
            server_name: self.server_name,
            insecure_skip_verify: self.insecure,
            use_websocket: self.websocket,
            ws_path: self.path,
            use_mux: self.mux,
            mux_max_streams: self.mux_max_streams,
            handshake_timeout: Duration::from_secs(self.timeout),
            mux_idle_check_interval: Duration::from_secs(self.mux_idle_check),
            mux_idle_timeout: Duration::from_secs(self.mux_idle_timeout),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    let log_level = if args.verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("mux_tls_tunnel={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.into_config();
    config.validate()?;

    info!("🚀 mux-tls-tunnel starting...");
    if config.insecure_skip_verify {
        info!("   TLS certificate verification disabled");
    }

    // 启动隧道服务器
    if let Err(e) = proxy::run_server(config).await {
        error!("❌ Server error: {}", e);
        return Err(e);
    }

    Ok(())
}
