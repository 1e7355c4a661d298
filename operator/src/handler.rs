//! Turns watch notifications of every kind into Environment keys on the queue.

use std::sync::Arc;

use kube::Resource;

use crate::{
    cache::WatchedKind,
    key::{EnvKey, KeyExtraction, KeyExtractor},
    metrics::Metrics,
    queue::WorkQueue,
};

/// A deleted object as delivered by the informer.
pub enum Deleted<'a, K> {
    /// The watch reported the deletion itself.
    Observed(&'a K),
    /// The deletion happened while the watch was down; this is the state the
    /// cache last held.
    Tombstone(&'a K),
}

impl<'a, K> Deleted<'a, K> {
    pub fn last_known(&self) -> &'a K {
        match self {
            Deleted::Observed(obj) | Deleted::Tombstone(obj) => obj,
        }
    }
}

/// Watch notifications for one kind. Called on the watch delivery path, so
/// implementations must not block.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, deleted: Deleted<'_, K>);
}

/// Enqueues the owning Environment for any event of any watched kind.
pub struct EnqueueOwner {
    queue: Arc<WorkQueue<EnvKey>>,
    metrics: Arc<Metrics>,
}

impl EnqueueOwner {
    pub fn new(queue: Arc<WorkQueue<EnvKey>>, metrics: Arc<Metrics>) -> Self {
        Self { queue, metrics }
    }

    fn enqueue<K: WatchedKind>(&self, obj: &K, event: &'static str) {
        match obj.extract_key() {
            KeyExtraction::Key(key) => {
                tracing::trace!(kind = K::KIND, event, %key, "enqueue");
                self.metrics.enqueued.with_label_values(&[K::KIND]).inc();
                self.queue.add(key);
            }
            KeyExtraction::Unowned => {
                tracing::trace!(kind = K::KIND, event, name = ?obj.meta().name, "ignoring unowned object");
            }
            KeyExtraction::Malformed(reason) => {
                tracing::warn!(
                    kind = K::KIND,
                    event,
                    namespace = ?obj.meta().namespace,
                    name = ?obj.meta().name,
                    reason,
                    "ignoring orphaned object"
                );
                self.metrics
                    .ignored_objects
                    .with_label_values(&[K::KIND, "malformed"])
                    .inc();
            }
        }
    }
}

impl<K: WatchedKind> ResourceEventHandler<K> for EnqueueOwner {
    fn on_add(&self, obj: &K) {
        self.enqueue(obj, "add");
    }

    fn on_update(&self, old: &K, new: &K) {
        if !K::is_meaningful_update(old, new) {
            tracing::trace!(kind = K::KIND, name = ?new.meta().name, "skipping update without changes");
            return;
        }
        self.enqueue(new, "update");
    }

    fn on_delete(&self, deleted: Deleted<'_, K>) {
        let event = match deleted {
            Deleted::Observed(_) => "delete",
            Deleted::Tombstone(_) => "tombstone",
        };
        self.enqueue(deleted.last_known(), event);
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
    use kube::api::ObjectMeta;

    use super::*;
    use crate::{
        crd::{Environment, EnvironmentPhase, EnvironmentStatus},
        queue::rate_limiter::ExponentialBackoff,
        testutil,
    };

    fn adapter() -> (EnqueueOwner, Arc<WorkQueue<EnvKey>>) {
        let queue = Arc::new(WorkQueue::new(ExponentialBackoff::default()));
        let metrics = Arc::new(Metrics::new().unwrap());
        (EnqueueOwner::new(queue.clone(), metrics), queue)
    }

    #[tokio::test]
    async fn add_enqueues_environment_and_owned_objects() {
        let (adapter, queue) = adapter();
        let env = testutil::environment("ns", "foo", 2);
        let owned = Deployment {
            metadata: testutil::owned_meta(&env, "foo"),
            ..Default::default()
        };

        adapter.on_add(&env);
        adapter.on_add(&owned);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(EnvKey::new("ns", "foo")));
    }

    #[tokio::test]
    async fn status_only_update_does_not_retrigger() {
        let (adapter, queue) = adapter();
        let old = testutil::environment("ns", "foo", 2);
        let mut new = old.clone();
        new.metadata.resource_version = Some("2".into());
        new.status = Some(EnvironmentStatus {
            phase: Some(EnvironmentPhase::Ready),
            ..Default::default()
        });

        adapter.on_update(&old, &new);
        assert_eq!(queue.len(), 0);

        let mut scaled = new.clone();
        scaled.metadata.resource_version = Some("3".into());
        scaled.spec.replicas = 3;
        adapter.on_update(&new, &scaled);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn owned_updates_always_enqueue() {
        let (adapter, queue) = adapter();
        let env = testutil::environment("ns", "foo", 2);
        let old = Service {
            metadata: ObjectMeta {
                resource_version: Some("1".into()),
                ..testutil::owned_meta(&env, "foo")
            },
            ..Default::default()
        };
        let mut new = old.clone();
        new.metadata.resource_version = Some("2".into());

        adapter.on_update(&old, &old);
        assert_eq!(queue.len(), 0);
        adapter.on_update(&old, &new);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn tombstones_are_keyed_from_last_known_state() {
        let (adapter, queue) = adapter();
        let env = testutil::environment("ns", "foo", 2);
        let gone = Deployment {
            metadata: testutil::owned_meta(&env, "foo"),
            ..Default::default()
        };

        adapter.on_delete(Deleted::Tombstone(&gone));
        assert_eq!(queue.get().await, Some(EnvKey::new("ns", "foo")));
    }

    #[tokio::test]
    async fn orphans_are_dropped() {
        let (adapter, queue) = adapter();
        let orphan = Deployment {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("ns".into()),
                ..Default::default()
            },
            ..Default::default()
        };

        adapter.on_add(&orphan);
        adapter.on_delete(Deleted::Observed(&orphan));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn deleting_environment_enqueues_it_for_cleanup() {
        let (adapter, queue) = adapter();
        let env: Environment = testutil::environment("ns", "foo", 1);
        adapter.on_delete(Deleted::Observed(&env));
        assert_eq!(queue.get().await, Some(EnvKey::new("ns", "foo")));
    }
}
