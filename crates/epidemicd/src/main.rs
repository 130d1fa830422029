//! epidemicd - CloudGossip epidemic dissemination daemon
//!
//! Keeps a replicated key/value store converged across a set of peers (and
//! optionally a cloud object store) using anti-entropy and rumor mongering.

use clap::Parser;
use epidemicd::config::Config;
use epidemicd::providers::ProviderRegistry;
use epidemicd::server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let filter = EnvFilter::from_default_env().add_directive(
        if config.verbose {
            "epidemicd=debug"
        } else {
            "epidemicd=info"
        }
        .parse()
        .unwrap(),
    );
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        "epidemicd v{} - CloudGossip dissemination daemon",
        env!("CARGO_PKG_VERSION")
    );

    let registry = ProviderRegistry::with_defaults();
    let server = match Server::new(config, &registry) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to initialize server: {e}");
            return ExitCode::FAILURE;
        }
    };

    {
        let server = server.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
            server.shutdown();
        });
    }

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
