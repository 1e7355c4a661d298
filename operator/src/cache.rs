//! Read side of the per-kind object caches.
//!
//! Each watched kind has one reflector store filled by its informer and a
//! flag telling whether the initial list has been applied. [`ObjectCache`]
//! holds all of them and is built once at startup; the matching
//! [`CacheWriters`] are handed to the informers.

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Namespace, PersistentVolumeClaim, Service, ServiceAccount},
    networking::v1::Ingress,
    rbac::v1::{Role, RoleBinding},
};
use kube::{
    Resource, ResourceExt,
    runtime::reflector::{ObjectRef, Store, store::Writer},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    crd::{Environment, IngressRoute},
    key::KeyExtractor,
};

pub struct Slot<K: WatchedKind> {
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K: WatchedKind> Slot<K> {
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        let obj_ref = match namespace {
            Some(ns) => ObjectRef::new(name).within(ns),
            None => ObjectRef::new(name),
        };
        self.store.get(&obj_ref)
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

pub struct SlotWriter<K: WatchedKind> {
    pub writer: Writer<K>,
    synced: Arc<AtomicBool>,
}

impl<K: WatchedKind> SlotWriter<K> {
    pub fn reader(&self) -> Store<K> {
        self.writer.as_reader()
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }
}

fn slot<K: WatchedKind>() -> (Slot<K>, SlotWriter<K>) {
    let writer = Writer::<K>::default();
    let synced = Arc::new(AtomicBool::new(false));
    (
        Slot {
            store: writer.as_reader(),
            synced: synced.clone(),
        },
        SlotWriter { writer, synced },
    )
}

/// A kind the controller watches and caches.
pub trait WatchedKind:
    Resource<DynamicType = ()>
    + KeyExtractor
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    const KIND: &'static str;

    fn slot(cache: &ObjectCache) -> &Slot<Self>;

    #[cfg(test)]
    fn slot_writer(writers: &mut CacheWriters) -> &mut SlotWriter<Self>;

    /// Whether an update carries anything worth reconciling for.
    ///
    /// Owned kinds report every real change, status included, so drift and
    /// readiness are noticed. Only identical resource versions (replays) are
    /// dropped.
    fn is_meaningful_update(old: &Self, new: &Self) -> bool {
        match (old.resource_version(), new.resource_version()) {
            (Some(old), Some(new)) => old != new,
            _ => true,
        }
    }
}

impl WatchedKind for Environment {
    const KIND: &'static str = "Environment";

    fn slot(cache: &ObjectCache) -> &Slot<Self> {
        &cache.environments
    }

    #[cfg(test)]
    fn slot_writer(writers: &mut CacheWriters) -> &mut SlotWriter<Self> {
        &mut writers.environments
    }

    /// The controller's own status writes come back through the watch; they
    /// leave the object spec untouched and must not queue another pass.
    fn is_meaningful_update(old: &Self, new: &Self) -> bool {
        if old.resource_version().is_some() && old.resource_version() == new.resource_version() {
            return false;
        }
        old.spec.content_hash() != new.spec.content_hash()
            || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
            || old.uid() != new.uid()
    }
}

macro_rules! watched_kinds {
    ($($kind:ty => $field:ident),+ $(,)?) => {
        $(
            impl WatchedKind for $kind {
                const KIND: &'static str = stringify!($kind);

                fn slot(cache: &ObjectCache) -> &Slot<Self> {
                    &cache.$field
                }

                #[cfg(test)]
                fn slot_writer(writers: &mut CacheWriters) -> &mut SlotWriter<Self> {
                    &mut writers.$field
                }
            }
        )+

        /// Every per-kind store, plus its sync flag.
        pub struct ObjectCache {
            environments: Slot<Environment>,
            $($field: Slot<$kind>,)+
        }

        /// Write halves of [`ObjectCache`], one per informer.
        pub struct CacheWriters {
            pub environments: SlotWriter<Environment>,
            $(pub $field: SlotWriter<$kind>,)+
        }

        #[cfg(test)]
        impl CacheWriters {
            pub fn mark_all_synced(&self) {
                self.environments.mark_synced();
                $(self.$field.mark_synced();)+
            }
        }

        impl ObjectCache {
            pub fn new() -> (Self, CacheWriters) {
                let environments = slot::<Environment>();
                $(let $field = slot::<$kind>();)+
                (
                    ObjectCache {
                        environments: environments.0,
                        $($field: $field.0,)+
                    },
                    CacheWriters {
                        environments: environments.1,
                        $($field: $field.1,)+
                    },
                )
            }

            /// Kinds whose initial list has not completed yet.
            pub fn unsynced_kinds(&self) -> Vec<&'static str> {
                let mut pending = Vec::new();
                if !self.environments.has_synced() {
                    pending.push(Environment::KIND);
                }
                $(
                    if !self.$field.has_synced() {
                        pending.push(<$kind as WatchedKind>::KIND);
                    }
                )+
                pending
            }
        }
    };
}

watched_kinds!(
    Namespace => namespaces,
    Deployment => deployments,
    Service => services,
    ServiceAccount => service_accounts,
    PersistentVolumeClaim => persistent_volume_claims,
    Ingress => ingresses,
    IngressRoute => ingress_routes,
    Role => roles,
    RoleBinding => role_bindings,
);

impl ObjectCache {
    pub fn get<K: WatchedKind>(&self, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        K::slot(self).get(namespace, name)
    }

    pub fn list<K: WatchedKind>(&self) -> Vec<Arc<K>> {
        K::slot(self).list()
    }

    pub fn has_synced(&self) -> bool {
        self.unsynced_kinds().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use kube::runtime::watcher;

    use super::*;

    #[test]
    fn kinds_start_unsynced() {
        let (cache, writers) = ObjectCache::new();
        assert!(!cache.has_synced());
        assert_eq!(cache.unsynced_kinds().len(), 10);

        writers.environments.mark_synced();
        writers.deployments.mark_synced();
        let pending = cache.unsynced_kinds();
        assert!(!pending.contains(&"Environment"));
        assert!(!pending.contains(&"Deployment"));
        assert!(pending.contains(&"IngressRoute"));
    }

    #[test]
    fn lookup_is_by_namespace_and_name() {
        let (cache, mut writers) = ObjectCache::new();
        let mut env = Environment::new("foo", Default::default());
        env.metadata.namespace = Some("ns".into());
        writers
            .environments
            .writer
            .apply_watcher_event(&watcher::Event::Apply(env));

        assert!(cache.get::<Environment>(Some("ns"), "foo").is_some());
        assert!(cache.get::<Environment>(Some("other"), "foo").is_none());
        assert_eq!(cache.list::<Environment>().len(), 1);
    }
}
