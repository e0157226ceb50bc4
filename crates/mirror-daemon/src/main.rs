//! alices-mirror daemon: validates configuration, then serves one shared
//! shell to every allowed browser on the LAN.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Parser)]
#[command(name = "alices-mirror")]
#[command(about = "Share one terminal with every browser on the LAN")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Bind address pattern, repeatable; `*` expands against local IPv4s
    #[arg(long = "bind", default_value = "127.0.0.1")]
    bind: Vec<String>,

    /// Allowed client IP pattern, repeatable; `*` is a wildcard
    #[arg(long = "allow-ip", default_value = "127.0.0.1")]
    allow_ip: Vec<String>,

    /// Per-IP levels as comma-separated <pattern>-<level>;
    /// level 0 = interact, 1 = watch-only
    #[arg(long = "user-level", default_value = "")]
    user_level: String,

    /// Basic-auth user (auth is enabled when both user and password are set)
    #[arg(long, default_value = "")]
    user: String,

    /// Basic-auth password
    #[arg(long, default_value = "")]
    password: String,

    /// Serve without authentication even when credentials are set
    #[arg(long)]
    yolo: bool,

    /// Working directory for the shell (defaults to the current directory)
    #[arg(long = "cwd")]
    cwd: Option<PathBuf>,

    /// Shell to run: bash, powershell, cmd, or an executable path
    #[arg(long, default_value = "")]
    shell: String,

    /// Display name shown in the browser tab
    #[arg(long, default_value = "")]
    alias: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let work_dir = match cli.cwd {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };

    let cfg = mirror_core::Config {
        alias: cli.alias,
        port: cli.port,
        binds: cli.bind,
        allow_ips: cli.allow_ip,
        user_level: cli.user_level,
        user: cli.user,
        password: cli.password,
        yolo: cli.yolo,
        work_dir,
        shell: cli.shell,
    };

    let ctx = CancellationToken::new();
    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received, shutting down");
            signal_ctx.cancel();
        }
    });

    mirror_core::run(cfg, ctx).await
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("MIRROR_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}
