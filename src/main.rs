use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use runbox::core::languages::LanguageRegistry;
use runbox::engine::sandbox::{is_network_isolation_available, NetworkPolicy};
use runbox::{http, ExecutionService, ServiceConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("runbox=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env()?;

    // Load language configurations
    let registry = match &config.languages_config {
        Some(path) => {
            let registry = LanguageRegistry::load(path)?;
            info!("Loaded language configurations from {}", path.display());
            registry
        }
        None => {
            let registry = LanguageRegistry::builtin()?;
            info!("Using bundled language configurations");
            registry
        }
    };
    if registry.is_empty() {
        anyhow::bail!("No languages configured");
    }
    info!("{} languages available", registry.len());

    // Refuse to start unsandboxed networking when it was asked for explicitly
    let isolated = is_network_isolation_available().await;
    match config.sandbox.network {
        NetworkPolicy::Enforce if !isolated => {
            anyhow::bail!("SANDBOX_NETWORK=enforce but network namespaces are unavailable");
        }
        NetworkPolicy::Off => warn!("Network isolation disabled; programs can reach the network"),
        _ => {}
    }

    tokio::fs::create_dir_all(&config.sandbox.scratch_root)
        .await
        .with_context(|| {
            format!(
                "Failed to create scratch root {}",
                config.sandbox.scratch_root.display()
            )
        })?;

    info!(
        "Sandbox config: scratch_root={}, max_concurrent={}, max_output_bytes={}",
        config.sandbox.scratch_root.display(),
        config.max_concurrent,
        config.sandbox.max_output_bytes,
    );

    let service = Arc::new(ExecutionService::new(&config, Arc::new(registry)));
    let app = http::router(service);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
