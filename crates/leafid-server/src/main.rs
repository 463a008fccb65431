#![doc = include_str!("../README.md")]

mod server;

use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use leafid::{
    IdGenerator, SegmentIdGenerator, SnowflakeGenerator, SystemClock, repo::PgRepo,
    worker::read_cached_worker_id,
};
use server::config::{CliArgs, GeneratorConfig, ServerConfig};
use server::handler::{AppState, router};
use server::telemetry::init_telemetry;
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

    init_telemetry(config.log_format)?;

    let generator = build_generator(&config.generator).await?;
    generator.init().await?;

    let app = router(
        AppState::new(Arc::clone(&generator), &config.query_param),
        &config.request_path,
    );
    let listener = TcpListener::bind(config.server_addr).await?;
    log_startup_info(&config);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    generator.shutdown().await;
    tracing::info!("Service shut down successfully");
    Ok(())
}

async fn build_generator(config: &GeneratorConfig) -> anyhow::Result<Arc<dyn IdGenerator>> {
    match config {
        GeneratorConfig::Segment {
            database_urls,
            max_connections,
            run_migrations,
            segment,
        } => {
            let repo = PgRepo::connect(database_urls, *max_connections).await?;
            if *run_migrations {
                repo.run_migrations().await?;
            }
            Ok(Arc::new(SegmentIdGenerator::new(
                Arc::new(repo),
                segment.clone(),
            )))
        }
        GeneratorConfig::Snowflake {
            epoch_ms,
            worker_id,
            worker,
        } => {
            let worker_id = match worker_id {
                Some(worker_id) => *worker_id,
                None => {
                    let cache = worker.cache_file();
                    match read_cached_worker_id(&cache)? {
                        Some(worker_id) => {
                            tracing::info!(worker_id, path = %cache.display(), "using cached worker id");
                            worker_id
                        }
                        None => bail!(
                            "snowflake mode needs WORKER_ID or a cached worker id at `{}`",
                            cache.display()
                        ),
                    }
                }
            };
            Ok(Arc::new(SnowflakeGenerator::new(
                *epoch_ms,
                || worker_id,
                SystemClock,
            )?))
        }
    }
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting ID service on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting ID service on {}{}",
            config.server_addr,
            config.request_path
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
