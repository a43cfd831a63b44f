//! `morphine check`: run the discovery pass and report.

use anyhow::Result;
use colored::Colorize;
use morphine_config::Config;

use super::build_manager;

/// Returns whether every discovered extension loaded.
pub(crate) async fn run(config: Config) -> Result<bool> {
    let manager = build_manager(&config).await?;
    let report = manager.load_all().await?;

    println!(
        "{}",
        format!("Extensions in {}", config.extensions.dir.display()).bold()
    );
    for id in &report.loaded {
        println!("  {} {id}", "ok".green());
    }
    for (id, error) in &report.failed {
        println!("  {} {id}: {error}", error.kind().red());
    }
    if report.loaded.is_empty() && report.failed.is_empty() {
        println!("  {}", "no extensions found".dimmed());
    }

    manager.unload_all().await;
    Ok(report.is_clean())
}
