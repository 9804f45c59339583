use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tile_gateway::auth::TokenVerifier;
use tile_gateway::aws::{CredentialSource, CredentialsProvider};
use tile_gateway::backend_pool::BackendPool;
use tile_gateway::config::{Config, RegistryMode};
use tile_gateway::proxy::{Gateway, GatewayServer};
use tile_gateway::registry::{CloudMapRegistry, ServiceRegistry, StaticRegistry};
use tile_gateway::{PKG_NAME, VERSION};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Optional TOML file as the first argument; environment variables override it
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref(), |key| std::env::var(key).ok())
        .context("Failed to load configuration")?;

    init_logging(config.server.verbose);
    print_startup_banner(&config, config_path.as_ref());

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = build_registry(&config)?;
    let pool = Arc::new(BackendPool::new(
        registry,
        config.registry.backend_scheme.clone(),
    ));

    // First refresh completes before the listener opens
    let polling_handle = Arc::clone(&pool)
        .start_polling(config.registry.poll_interval(), shutdown_rx.clone())
        .await;
    if pool.is_ready() {
        info!(backends = pool.backend_count(), "Backend pool ready");
    } else {
        warn!("No tile servers discovered yet; health will report unavailable until one registers");
    }

    let jwks_url = config
        .jwks_url()
        .context("Identity provider key-set URL is not configured")?;
    let verifier = TokenVerifier::new(jwks_url, &config.auth)
        .context("Failed to build identity provider client")?;

    let gateway = Gateway::new(&config, Arc::clone(&pool), Arc::new(verifier))
        .context("Invalid gateway configuration")?;

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GatewayServer::bind(addr, Arc::new(gateway), shutdown_rx.clone())
        .await
        .with_context(|| format!("Failed to bind {}", addr))?
        .with_drain_timeout(config.server.drain_timeout());

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // The server drains on its own; bound the wait slightly above that
    let grace = config.server.drain_timeout() + std::time::Duration::from_secs(1);
    let _ = tokio::time::timeout(grace, async {
        let _ = server_handle.await;
        let _ = polling_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tile_gateway={}", default_level)));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_registry(config: &Config) -> anyhow::Result<Arc<dyn ServiceRegistry>> {
    match config.registry.mode {
        RegistryMode::Static => {
            let registry = StaticRegistry::from_addresses(&config.registry.static_backends)
                .context("Invalid static backend list")?;
            info!(backends = ?config.registry.static_backends, "Using static backend registry");
            Ok(Arc::new(registry))
        }
        RegistryMode::CloudMap => {
            let source = CredentialSource::from_lookup(|key| std::env::var(key).ok())
                .context("No AWS credentials found and instance metadata is disabled")?;
            let credentials = CredentialsProvider::new(source, config.registry.timeout())
                .context("Failed to build AWS credentials client")?;
            info!(source = credentials.source().kind(), "Resolved AWS credential source");
            let registry = CloudMapRegistry::new(&config.registry, credentials)
                .context("Invalid Cloud Map configuration")?;
            Ok(Arc::new(registry))
        }
    }
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config, path: Option<&PathBuf>) {
    info!(name = PKG_NAME, version = VERSION, "Starting tile gateway");
    info!(
        config_file = ?path.map(|p| p.display().to_string()),
        bind = %config.server.bind,
        port = config.server.port,
        route_prefix = %config.server.route_prefix,
        "Server configuration"
    );
    info!(
        mode = ?config.registry.mode,
        namespace = ?config.registry.namespace,
        service = ?config.registry.service_name,
        poll_interval_secs = config.registry.poll_interval().as_secs(),
        "Registry configuration"
    );
    info!(
        issuer = %config.auth.issuer,
        allowed_clients = ?config.auth.allowed_client_ids,
        algorithms = ?config.auth.algorithms,
        "Token verification"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Upstream settings"
    );
}
