use std::{net::SocketAddr, sync::Arc, time::Duration};

use eyre::Context;
use gatekeeper::{
    app,
    audit::AuditLog,
    cache::{keys, Cache, MemoryCache, RedisCache},
    database::Database,
    env::Environment,
    tools::install_tools,
    AppState,
};
use tokio::{signal, task::JoinHandle};

const CACHE_PURGE_FREQUENCY: Duration = Duration::from_secs(60);
const COMPACTION_FREQUENCY: Duration = Duration::from_secs(86400 / 2);

#[tokio::main]
async fn main() -> Result<(), eyre::Report> {
    let env = Environment::new()?;
    install_tools(&env)?;

    tracing::info!("App starting with:\n{:#?}", env);

    let database = Database::new(&env)
        .await
        .wrap_err("failed to open the database")?;

    let (cache, cache_monitor): (Arc<dyn Cache>, JoinHandle<Result<(), eyre::Report>>) =
        match &env.redis_url {
            Some(url) => {
                let redis = RedisCache::connect(url)
                    .await
                    .wrap_err("failed to connect to redis")?;
                (Arc::new(redis), tokio::spawn(idle()))
            }
            None => {
                let memory = MemoryCache::new();
                let monitored = memory.clone();
                let monitor = tokio::spawn(async move {
                    monitored.monitor(CACHE_PURGE_FREQUENCY).await;
                    Ok::<(), eyre::Report>(())
                });
                (Arc::new(memory), monitor)
            }
        };

    let port = env.port;
    let state = AppState::new(env, cache.clone(), database);

    let seeded = state.parameters.seed_defaults().await?;
    tracing::info!(seeded = seeded, "Default parameters up to date");

    // Cached permissions from a previous run are not trusted.
    for prefix in [keys::PARAMETER_PREFIX, keys::WHITELISTED_PREFIX] {
        let dropped = cache.delete_prefix(prefix).await?;
        tracing::info!(prefix = prefix, dropped = dropped, "Invalidated cache namespace");
    }

    let compaction = tokio::spawn(compaction_schedule(state.audit.clone()));

    let app = app(state);

    let addr: SocketAddr = format!("[::]:{}", port).parse()?;
    tracing::info!("Listening on: {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| eyre::eyre!("Server error: {:#}", e))
    });

    // The server finishing means shutdown; the other tasks run forever.
    tokio::select! {
        res = flatten(server) => res?,
        res = flatten(cache_monitor) => res?,
        res = flatten(compaction) => res?,
    }

    Ok(())
}

/// Periodic audit retention; failures are logged and retried next tick.
async fn compaction_schedule(audit: AuditLog) -> Result<(), eyre::Report> {
    let mut interval = tokio::time::interval(COMPACTION_FREQUENCY);
    loop {
        interval.tick().await;
        if let Err(e) = audit.compact().await {
            tracing::error!(kind = "audit", error = %e, "Scheduled compaction failed");
        }
    }
}

/// Stand-in for the in-process cache monitor when redis expires keys itself.
async fn idle() -> Result<(), eyre::Report> {
    std::future::pending::<()>().await;
    Ok(())
}

async fn flatten<T>(handle: JoinHandle<Result<T, eyre::Report>>) -> Result<T, eyre::Report> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(e) => Err(e).wrap_err_with(|| "handling failed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        _ = terminate => tracing::info!("Received SIGTERM signal"),
    }
    tracing::info!("Shutting down gracefully...");
}
