//! Worker pool that drains the queue into the reconciler.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::ObjectCache,
    config::OperatorConfig,
    crd::Environment,
    error::Error,
    event::{self, EventSink},
    key::EnvKey,
    metrics::Metrics,
    queue::WorkQueue,
    reconcile::{ClusterWriter, Reconciler},
};

const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

/// Blocks until every watched kind finished its initial list.
pub async fn wait_for_cache_sync(cache: &ObjectCache, timeout: Duration) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    loop {
        let pending = cache.unsynced_kinds();
        if pending.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::CacheSyncTimeout { pending, timeout });
        }
        tracing::debug!(?pending, "waiting for caches to sync");
        tokio::time::sleep(CACHE_SYNC_POLL).await;
    }
}

pub struct Settings {
    pub workers: usize,
    pub resync_interval: Option<Duration>,
    pub cache_sync_timeout: Duration,
}

impl From<&OperatorConfig> for Settings {
    fn from(config: &OperatorConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            resync_interval: config.resync_interval(),
            cache_sync_timeout: config.cache_sync_timeout(),
        }
    }
}

struct Shared<W> {
    cache: Arc<ObjectCache>,
    queue: Arc<WorkQueue<EnvKey>>,
    reconciler: Reconciler<W>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
}

pub struct Controller<W> {
    shared: Arc<Shared<W>>,
    settings: Settings,
}

impl<W: ClusterWriter + 'static> Controller<W> {
    pub fn new(
        cache: Arc<ObjectCache>,
        queue: Arc<WorkQueue<EnvKey>>,
        reconciler: Reconciler<W>,
        events: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
        settings: Settings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache,
                queue,
                reconciler,
                events,
                metrics,
            }),
            settings,
        }
    }

    /// Waits for the caches, then reconciles until `shutdown` fires.
    ///
    /// On shutdown the queue stops handing out keys; passes already running
    /// finish before this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let synced = tokio::select! {
            _ = shutdown.cancelled() => None,
            synced = wait_for_cache_sync(&self.shared.cache, self.settings.cache_sync_timeout) => Some(synced),
        };
        match synced {
            None => {
                self.shared.queue.shut_down();
                return Ok(());
            }
            Some(synced) => synced?,
        }
        tracing::info!(workers = self.settings.workers, "caches synced, starting workers");

        let mut workers = JoinSet::new();
        for id in 0..self.settings.workers {
            workers.spawn(worker(id, self.shared.clone()));
        }
        if let Some(interval) = self.settings.resync_interval {
            tokio::spawn(resync(self.shared.clone(), interval, shutdown.clone()));
        }

        shutdown.cancelled().await;
        tracing::info!("shutting down, waiting for in-flight reconciliations");
        self.shared.queue.shut_down();
        while let Some(joined) = workers.join_next().await {
            if let Err(error) = joined {
                tracing::error!(%error, "worker panicked");
            }
        }
        tracing::info!("workers stopped");
        Ok(())
    }
}

async fn worker<W: ClusterWriter>(id: usize, shared: Arc<Shared<W>>) {
    while let Some(key) = shared.queue.get().await {
        shared.metrics.queue_depth.set(shared.queue.len() as i64);

        let timer = shared.metrics.reconcile_duration.start_timer();
        let result = shared.reconciler.reconcile(&key).await;
        timer.observe_duration();

        match result {
            Ok(()) => {
                shared
                    .metrics
                    .reconciliations
                    .with_label_values(&["success"])
                    .inc();
                shared.queue.forget(&key);
            }
            Err(error) => {
                shared
                    .metrics
                    .reconciliations
                    .with_label_values(&["error"])
                    .inc();
                shared.metrics.retries.inc();
                tracing::warn!(
                    worker = id,
                    %key,
                    %error,
                    transient = error.is_transient(),
                    failures = shared.queue.num_requeues(&key) + 1,
                    "reconcile failed"
                );
                if let Some(env) = shared
                    .cache
                    .get::<Environment>(Some(&key.namespace), &key.name)
                {
                    shared
                        .events
                        .publish(&env, event::warning("ReconcileFailed", error.to_string()));
                }
                shared.queue.add_rate_limited(key.clone());
            }
        }
        shared.queue.done(&key);
    }
    tracing::debug!(worker = id, "worker exiting");
}

/// Requeues every cached Environment on a fixed interval.
async fn resync<W: ClusterWriter>(
    shared: Arc<Shared<W>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let envs = shared.cache.list::<Environment>();
        tracing::debug!(count = envs.len(), "periodic resync");
        for env in envs {
            if let (Some(namespace), Some(name)) = (&env.metadata.namespace, &env.metadata.name) {
                shared.queue.add(EnvKey::new(namespace.as_str(), name.as_str()));
            }
        }
    }
}
