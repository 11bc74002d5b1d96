//! onedoor binary.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use onedoor::config::{Cli, ConfigError};
use onedoor::{FrontDoor, Whitelist};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_load_from(std::env::args_os()) {
        Ok(cli) => cli,
        Err(ConfigError::Args(e)) => e.exit(),
        Err(e) => return Err(e.into()),
    };

    init_tracing(&cli);

    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let whitelist = Arc::new(Whitelist::new());
    whitelist.add_all(cli.whitelist_entries());
    if let Some(path) = &cli.whitelist_file {
        whitelist
            .load_file(path)
            .with_context(|| format!("Failed to load whitelist file {}", path.display()))?;
    }

    if whitelist.enabled() {
        info!(entries = whitelist.len(), "Whitelist enabled");
    } else {
        warn!("Whitelist is empty: every client address is allowed");
    }

    let (password, generated) = cli.password_or_generate();
    if generated {
        info!(username = %cli.username, password = %password, "Generated admin password");
    }

    let front_door = FrontDoor::start(cli.front_door_config(password), whitelist)
        .await
        .context("Startup failed")?;

    info!(
        public_addr = %front_door.public_addr(),
        "onedoor ready"
    );

    front_door.run().await.context("Mux listener failed")
}

fn init_tracing(cli: &Cli) {
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);

    if cli.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
