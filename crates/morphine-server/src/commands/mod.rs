//! Subcommand implementations.

pub(crate) mod check;
pub(crate) mod serve;

use std::sync::Arc;

use anyhow::{Context, Result};
use morphine_config::Config;
use morphine_extensions::{DataAccess, ExtensionManager, UnavailableDataAccess};
use tracing::info;

use crate::config_bridge;
use crate::data::SqlDataAccess;

/// Build the manager described by `config`, connecting the database when a
/// URL is configured.
pub(crate) async fn build_manager(config: &Config) -> Result<ExtensionManager> {
    let data: Arc<dyn DataAccess> = match &config.database.url {
        Some(url) => Arc::new(
            SqlDataAccess::connect(url, config.database.max_connections)
                .await
                .context("failed to connect to database")?,
        ),
        None => {
            info!("No database configured; extension data access is disabled");
            Arc::new(UnavailableDataAccess)
        },
    };

    Ok(ExtensionManager::builder(&config.extensions.dir)
        .sandbox_config(config_bridge::sandbox_config(&config.extensions))
        .data_access(data)
        .build())
}
