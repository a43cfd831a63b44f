//! `morphine serve`: load extensions and serve them until Ctrl+C.

use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use morphine_config::Config;
use tracing::{info, warn};

use super::build_manager;
use crate::http;

pub(crate) async fn run(config: Config) -> Result<()> {
    let addr = config
        .server
        .socket_addr()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;

    let manager = Arc::new(build_manager(&config).await?);
    let report = manager.load_all().await?;
    for (id, error) in &report.failed {
        warn!(extension_id = %id, kind = error.kind(), error = %error, "Extension not loaded");
    }
    info!(
        loaded = report.loaded.len(),
        failed = report.failed.len(),
        "Extensions ready"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    println!(
        "{}",
        format!(
            "morphine listening on http://{addr} ({} extensions)",
            report.loaded.len()
        )
        .cyan()
        .bold()
    );

    axum::serve(listener, http::app(Arc::clone(&manager)))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await
        .context("server error")?;

    println!("\n{}", "Shutting down...".yellow());
    manager.unload_all().await;
    println!("{}", "Stopped".green().bold());
    Ok(())
}
