use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use fnhost_core::{HostBuilder, HostConfig, router};
use tracing_subscriber::EnvFilter;

/// Serve every function folder under a deployment root.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML host config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Deployment root; overrides the config file.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Listen address; overrides the config file.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => HostConfig::load(path).await?,
        None => HostConfig::default(),
    };
    if let Some(root) = args.root {
        config.root = root;
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address '{}'", config.listen))?;

    let host = HostBuilder::new().config(config).build()?;

    // 1) 初回スキャン（失敗したフォルダはログに出すだけ）
    let results = host.load_all().await?;
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    tracing::info!(
        registered = results.len() - failed,
        failed,
        "initial scan done"
    );

    // 2) Ctrl-C まで HTTP を受ける
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(host.clone()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for ctrl-c");
            }
        })
        .await
        .context("http server failed")?;

    // 3) worker と trigger を止める
    host.shutdown().await;
    Ok(())
}
