//! TaskSync server
//!
//! Serves the task REST API and the change-notification WebSocket.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tasksync_server::{ServerConfig, SyncServer};
use tracing_subscriber::EnvFilter;

/// TaskSync real-time sync server.
#[derive(Parser)]
#[command(name = "tasksync-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1:8080", env = "TASKSYNC_BIND")]
    bind: SocketAddr,

    /// Secret used to sign access tokens
    #[arg(long, env = "TASKSYNC_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Outbound queue capacity per connection
    #[arg(long, default_value = "256")]
    queue_capacity: usize,

    /// Seconds between server pings
    #[arg(long, default_value = "54")]
    ping_secs: u64,

    /// Seconds of silence after which a connection is dropped
    #[arg(long, default_value = "60")]
    pong_secs: u64,

    /// Print a credential pair for this user id on startup
    #[arg(long)]
    issue_token: Option<i64>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ServerConfig::new(cli.bind)
        .with_send_queue_capacity(cli.queue_capacity)
        .with_keepalive(
            Duration::from_secs(cli.ping_secs),
            Duration::from_secs(cli.pong_secs),
        );
    if let Some(secret) = cli.secret {
        config = config.with_auth(secret.into_bytes());
    }
    if config.uses_dev_secret() {
        tracing::warn!("using the development signing secret; set TASKSYNC_SECRET in production");
    }

    let server = SyncServer::new(config);
    if let Some(user) = cli.issue_token {
        let tokens = server.sessions().issue(user)?;
        println!("{}", serde_json::to_string_pretty(&tokens)?);
    }

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    server
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
