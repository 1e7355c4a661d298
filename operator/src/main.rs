use std::{net::SocketAddr, sync::Arc};

use axum::{Router, extract::State, http::StatusCode, routing::get};
use environment_operator::{
    cache::{CacheWriters, ObjectCache, SlotWriter, WatchedKind},
    config::OperatorConfig,
    controller::{Controller, Settings},
    event::{KubeEventSink, make_reporter},
    handler::EnqueueOwner,
    informer::Informer,
    metrics::Metrics,
    queue::{WorkQueue, rate_limiter::ExponentialBackoff},
    reconcile::{KubeWriter, Reconciler},
};
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("terminate signal received");
    shutdown.cancel();
}

fn spawn_informer<K: WatchedKind>(
    slot: SlotWriter<K>,
    client: &Client,
    handler: &Arc<EnqueueOwner>,
    shutdown: &CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(Informer::new(slot).run(
        Api::<K>::all(client.clone()),
        handler.clone(),
        shutdown.clone(),
    ))
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> Result<String, StatusCode> {
    metrics.render().map_err(|error| {
        tracing::error!(%error, "failed to render metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn serve_metrics(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "serving metrics");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = OperatorConfig::try_from_env()?;
    tracing::info!(?config, "starting environment operator");

    let client = Client::try_default().await?;
    let metrics = Arc::new(Metrics::new()?);
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let (cache, writers) = ObjectCache::new();
    let cache = Arc::new(cache);
    let queue = Arc::new(WorkQueue::new(ExponentialBackoff::new(
        config.backoff_base(),
        config.backoff_max(),
    )));
    let handler = Arc::new(EnqueueOwner::new(queue.clone(), metrics.clone()));

    let CacheWriters {
        environments,
        namespaces,
        deployments,
        services,
        service_accounts,
        persistent_volume_claims,
        ingresses,
        ingress_routes,
        roles,
        role_bindings,
    } = writers;
    let informers = vec![
        spawn_informer(environments, &client, &handler, &shutdown),
        spawn_informer(namespaces, &client, &handler, &shutdown),
        spawn_informer(deployments, &client, &handler, &shutdown),
        spawn_informer(services, &client, &handler, &shutdown),
        spawn_informer(service_accounts, &client, &handler, &shutdown),
        spawn_informer(persistent_volume_claims, &client, &handler, &shutdown),
        spawn_informer(ingresses, &client, &handler, &shutdown),
        spawn_informer(ingress_routes, &client, &handler, &shutdown),
        spawn_informer(roles, &client, &handler, &shutdown),
        spawn_informer(role_bindings, &client, &handler, &shutdown),
    ];

    let metrics_addr: SocketAddr = config.metrics_addr.parse()?;
    let metrics_server = tokio::spawn(serve_metrics(
        metrics_addr,
        metrics.clone(),
        shutdown.clone(),
    ));

    let events = Arc::new(KubeEventSink::spawn(client.clone(), make_reporter()));
    let reconciler = Reconciler::new(
        cache.clone(),
        KubeWriter::new(client, config.request_timeout()),
        events.clone(),
    );
    let controller = Controller::new(
        cache,
        queue,
        reconciler,
        events,
        metrics,
        Settings::from(&config),
    );

    let result = controller.run(shutdown.clone()).await;
    // a failed startup still has to stop the informers and the metrics server
    shutdown.cancel();
    for informer in informers {
        informer.await?;
    }
    metrics_server.await??;
    tracing::info!("controller terminated");

    result?;
    Ok(())
}
