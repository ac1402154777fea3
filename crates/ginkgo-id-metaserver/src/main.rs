#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::allocator::{Authority, JsonFileStore, LocalLockService, MemoryStore, RecordStore};
use server::config::{CliArgs, ServerConfig};
use server::service::handler::{MetaService, router};
use server::telemetry::init_telemetry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let store = open_store(&config)?;
    let authority = Authority::new(store, LocalLockService::new(), config.authority.clone());
    let service = MetaService::new(Arc::new(authority));

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    let app = router(service.clone());
    let mut server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(service.shutdown_token().cancelled_owned())
            .into_future(),
    );

    let result = tokio::select! {
        res = &mut server => {
            // The server only stops on its own when it fails.
            res?.map_err(anyhow::Error::from)
        }
        () = shutdown_signal() => {
            tracing::info!("Shutdown signal received, terminating gracefully...");
            // Refuse new allocations and let in-flight ones finish.
            service.shutdown();
            match tokio::time::timeout(config.shutdown_timeout, &mut server).await {
                Ok(res) => res?.map_err(anyhow::Error::from),
                Err(_) => {
                    tracing::warn!(
                        "In-flight requests did not finish within {:?}, exiting",
                        config.shutdown_timeout
                    );
                    server.abort();
                    Ok(())
                }
            }
        }
    };

    if result.is_ok() {
        tracing::info!("Service shut down successfully");
    }
    providers.shutdown();
    result
}

fn open_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn RecordStore>> {
    match &config.store_path {
        Some(path) => Ok(Arc::new(JsonFileStore::open(path)?)),
        None => {
            tracing::warn!(
                "No STORE_PATH configured, allocation records are kept in memory and lost on restart"
            );
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting allocation authority on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting allocation authority on {} (default step {}, {} attempts per allocation)",
            config.server_addr,
            config.authority.default_step,
            config.authority.max_retries
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
