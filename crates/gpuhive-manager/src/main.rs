mod args;

use std::sync::Arc;

use clap::Parser;
use gpuhive_manager::api::router;
use gpuhive_manager::state::AppState;
use gpuhive_manager::ClusterManager;
use gpuhive_meta::{FileMetaStore, MemoryMetaStore, MetaStore};

use crate::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel_provider = gpuhive_common::telemetry::init_tracing(
        "gpuhive-manager",
        args.log_format,
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );

    let config = args.manager_config()?;

    let store: Arc<dyn MetaStore> = if args.ephemeral {
        tracing::warn!("running with an in-memory registry, nodes are lost on exit");
        Arc::new(MemoryMetaStore::new())
    } else {
        Arc::new(FileMetaStore::open(&args.registry_path).await?)
    };

    let manager = ClusterManager::open(store, config).await?;
    let monitor_task = manager.start().await;

    let app = router(AppState::new(manager.clone()));

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(
        addr=%args.listen_addr,
        registry=%args.registry_path.display(),
        ephemeral=args.ephemeral,
        "gpuhive-manager listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown();
    if let Err(e) = monitor_task.await {
        tracing::warn!(error=%e, "health monitor task ended abnormally");
    }
    if let Some(provider) = otel_provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush traces: {e}");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error=%e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
