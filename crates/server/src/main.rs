use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use marketcache_market::{MarketService, UpstreamClient};
use marketcache_server::{Args, router};
use marketcache_storage::{RefreshCache, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "marketcache_server=info,marketcache_storage=info,marketcache_market=info".into()
            }),
        )
        .init();

    let args = Args::parse();
    let policy = args.cache_policy()?;
    let addr = args.addr();

    let store = Store::new();
    let sweeper = store.spawn_sweeper(args.sweep_interval);
    let cache = RefreshCache::with_limits(store, args.fetch_timeout, args.max_refreshes);
    let client = UpstreamClient::new(&args.upstream_url, args.fetch_timeout)?;
    let market = MarketService::new(cache.clone(), client, policy);

    let listener = TcpListener::bind(&addr).await?;
    info!(
        "marketcache escutando em http://{addr} (upstream {}, ttl {:?}, refresh delay {:?})",
        args.upstream_url, policy.ttl, policy.refresh_delay
    );

    axum::serve(listener, router(market))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Refreshes pendentes têm um prazo para terminar; o cache é só memória
    cache.shutdown(args.shutdown_grace).await;
    sweeper.stop().await;
    info!("servidor encerrado");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("falha ao escutar ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("falha ao escutar SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal recebido");
}
