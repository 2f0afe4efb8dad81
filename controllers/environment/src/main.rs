//! Environment Controller
//!
//! Reconciles `DevelopmentEnvironment` resources into an isolated namespace
//! with a network policy, optional workspace volume, a single-replica
//! workload, a service and an optional ingress. Environments are torn down
//! on request, at TTL expiry or after an idle timeout.

mod backoff;
mod config;
mod controller;
mod error;
mod metrics;
mod queue;
mod reconciler;
mod server;
mod status;
mod sweeper;
#[cfg(test)]
mod test_utils;
mod translator;
mod watcher;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    info!("Starting Environment Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Domain suffix: {}", config.domain_suffix);
    info!("  Storage class: {}", config.storage_class);
    info!("  Ingress class: {}", config.ingress_class);
    info!("  Workers: {}", config.workers);
    info!("  TTL bounds: {}h..{}h", config.min_ttl_hours, config.max_ttl_hours);
    match config.idle_timeout_hours {
        Some(hours) => info!("  Idle timeout: {}h", hours),
        None => info!("  Idle timeout: disabled"),
    }

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
