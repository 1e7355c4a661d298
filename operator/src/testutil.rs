//! In-memory cluster for reconciler and controller tests.
//!
//! Writes go straight into the reflector stores, so the next pass sees them the
//! way it would once a real watch delivered them. Deliveries can be held back
//! to let the cache lag behind the server.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use kube::{
    Resource, ResourceExt,
    api::ObjectMeta,
    core::ErrorResponse,
    runtime::{events::Event, watcher},
};
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    cache::{CacheWriters, ObjectCache, WatchedKind},
    crd::{Environment, EnvironmentSpec, EnvironmentStatus},
    error::Error,
    event::EventSink,
    reconcile::{ClusterWriter, OwnedKind},
};

pub fn environment(namespace: &str, name: &str, replicas: i32) -> Environment {
    environment_with_uid(namespace, name, replicas, &format!("uid-{namespace}-{name}"))
}

pub fn environment_with_uid(namespace: &str, name: &str, replicas: i32, uid: &str) -> Environment {
    let mut env = Environment::new(
        name,
        EnvironmentSpec {
            image: "nginx:1.25".into(),
            replicas,
            port: 8080,
            ..Default::default()
        },
    );
    env.metadata.namespace = Some(namespace.into());
    env.metadata.uid = Some(uid.into());
    env.metadata.resource_version = Some("1".into());
    env.metadata.generation = Some(1);
    env
}

/// Metadata of an object controlled by `env`.
pub fn owned_meta(env: &Environment, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: env.namespace(),
        owner_references: Some(vec![env.controller_owner_ref(&()).unwrap()]),
        ..Default::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create { kind: &'static str, name: String },
    Patch { kind: &'static str, name: String, patch: Value },
    Delete { kind: &'static str, name: String },
    Status(EnvironmentStatus),
}

impl Call {
    pub fn kind(&self) -> &'static str {
        match self {
            Call::Create { kind, .. } | Call::Patch { kind, .. } | Call::Delete { kind, .. } => kind,
            Call::Status(_) => "Environment",
        }
    }
}

/// An API error the way the server reports it.
pub fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".into(),
        message: format!("{reason} ({code})"),
        reason: reason.into(),
        code,
    }))
}

/// A watch delivery not yet applied to the cache.
struct Held {
    kind: &'static str,
    namespace: Option<String>,
    name: String,
    /// Object as stored server side, `None` once deleted.
    object: Option<Value>,
    deliver: Box<dyn FnOnce(&mut CacheWriters) + Send>,
}

pub struct FakeCluster {
    pub cache: Arc<ObjectCache>,
    writers: Mutex<CacheWriters>,
    /// `Some` while watch deliveries are held back.
    held: Mutex<Option<Vec<Held>>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<usize>,
    next_version: AtomicU64,
}

impl FakeCluster {
    /// A cluster whose caches have all completed their initial list.
    pub fn new() -> Arc<Self> {
        let cluster = Self::unsynced();
        cluster.writers.lock().mark_all_synced();
        cluster
    }

    pub fn unsynced() -> Arc<Self> {
        let (cache, writers) = ObjectCache::new();
        Arc::new(Self {
            cache: Arc::new(cache),
            writers: Mutex::new(writers),
            held: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(0),
            next_version: AtomicU64::new(100),
        })
    }

    pub fn with_writers<T>(&self, f: impl FnOnce(&mut CacheWriters) -> T) -> T {
        f(&mut self.writers.lock())
    }

    /// Stores `obj` as if it had been created by someone else.
    pub fn put<K: WatchedKind>(&self, mut obj: K) {
        if obj.meta().resource_version.is_none() {
            obj.meta_mut().resource_version = Some(self.version());
        }
        self.apply(obj);
    }

    pub fn remove<K: WatchedKind>(&self, namespace: Option<&str>, name: &str) {
        let Some(obj) = self.get::<K>(namespace, name) else {
            return;
        };
        self.deliver_or_hold::<K>(namespace, name, None, move |writers| {
            K::slot_writer(writers)
                .writer
                .apply_watcher_event(&watcher::Event::Delete(obj));
        });
    }

    /// Changes a stored object out of band, bumping its resource version.
    pub fn mutate<K: WatchedKind>(&self, namespace: Option<&str>, name: &str, f: impl FnOnce(&mut K)) {
        let mut obj = self
            .get::<K>(namespace, name)
            .unwrap_or_else(|| panic!("{} {name} does not exist", K::KIND));
        f(&mut obj);
        obj.meta_mut().resource_version = Some(self.version());
        self.apply(obj);
    }

    /// The object as the server has it, which may be ahead of the cache.
    pub fn get<K: WatchedKind>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let held = self.held.lock();
        let latest = held.iter().flatten().rev().find(|held| {
            held.kind == K::KIND && held.namespace.as_deref() == namespace && held.name == name
        });
        match latest {
            Some(held) => held
                .object
                .clone()
                .map(|object| serde_json::from_value(object).unwrap()),
            None => self.cache.get::<K>(namespace, name).map(|obj| obj.as_ref().clone()),
        }
    }

    /// Makes the next `n` writes fail with a timeout.
    pub fn fail_next_writes(&self, n: usize) {
        *self.failures.lock() += n;
    }

    /// Stops applying writes to the cache until they are delivered.
    pub fn hold_watch_events(&self) {
        self.held.lock().get_or_insert_with(Vec::new);
    }

    /// Applies the held events of one kind, keeping the rest back.
    pub fn deliver<K: WatchedKind>(&self) {
        let ready: Vec<Held> = match self.held.lock().as_mut() {
            Some(held) => {
                let (ready, rest): (Vec<Held>, Vec<Held>) = std::mem::take(held)
                    .into_iter()
                    .partition(|held| held.kind == K::KIND);
                *held = rest;
                ready
            }
            None => Vec::new(),
        };
        self.flush(ready);
    }

    /// Applies every held event and stops holding.
    pub fn deliver_all(&self) {
        let ready = self.held.lock().take().unwrap_or_default();
        self.flush(ready);
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.calls.lock())
    }

    fn version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn apply<K: WatchedKind>(&self, obj: K) {
        let namespace = obj.namespace();
        let name = obj.name_any();
        let object = serde_json::to_value(&obj).unwrap();
        self.deliver_or_hold::<K>(namespace.as_deref(), &name, Some(object), move |writers| {
            K::slot_writer(writers)
                .writer
                .apply_watcher_event(&watcher::Event::Apply(obj));
        });
    }

    fn deliver_or_hold<K: WatchedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        object: Option<Value>,
        deliver: impl FnOnce(&mut CacheWriters) + Send + 'static,
    ) {
        let mut held = self.held.lock();
        match held.as_mut() {
            Some(held) => held.push(Held {
                kind: K::KIND,
                namespace: namespace.map(str::to_string),
                name: name.to_string(),
                object,
                deliver: Box::new(deliver),
            }),
            None => {
                drop(held);
                deliver(&mut self.writers.lock());
            }
        }
    }

    fn flush(&self, ready: Vec<Held>) {
        let mut writers = self.writers.lock();
        for held in ready {
            (held.deliver)(&mut writers);
        }
    }

    fn check_failure(&self, kind: &'static str, name: &str) -> Result<(), Error> {
        let mut failures = self.failures.lock();
        if *failures == 0 {
            return Ok(());
        }
        *failures -= 1;
        Err(Error::RequestTimeout {
            kind,
            name: name.to_string(),
            timeout: Duration::from_secs(30),
        })
    }
}

impl ClusterWriter for Arc<FakeCluster> {
    async fn create<K: OwnedKind>(&self, obj: &K) -> Result<(), Error> {
        let name = obj.name_any();
        self.check_failure(K::KIND, &name)?;
        let namespace = obj.namespace();
        if self.get::<K>(namespace.as_deref(), &name).is_some() {
            return Err(api_error(409, "AlreadyExists"));
        }

        let mut obj = obj.clone();
        obj.meta_mut().uid = Some(format!("uid-{}-{name}", K::KIND));
        obj.meta_mut().resource_version = Some(self.version());
        self.apply(obj);
        self.calls.lock().push(Call::Create { kind: K::KIND, name });
        Ok(())
    }

    async fn patch<K: OwnedKind>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        self.check_failure(K::KIND, name)?;
        let Some(current) = self.get::<K>(namespace, name) else {
            return Err(api_error(404, "NotFound"));
        };
        if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            if current.meta().resource_version.as_deref() != Some(expected) {
                return Err(api_error(409, "Conflict"));
            }
        }

        let mut doc = serde_json::to_value(&current)?;
        json_patch::merge(&mut doc, patch);
        let mut patched: K = serde_json::from_value(doc)?;
        patched.meta_mut().resource_version = Some(self.version());
        self.apply(patched);
        self.calls.lock().push(Call::Patch {
            kind: K::KIND,
            name: name.to_string(),
            patch: patch.clone(),
        });
        Ok(())
    }

    async fn delete<K: OwnedKind>(&self, namespace: Option<&str>, name: &str) -> Result<(), Error> {
        self.check_failure(K::KIND, name)?;
        if self.get::<K>(namespace, name).is_none() {
            return Err(api_error(404, "NotFound"));
        }
        self.remove::<K>(namespace, name);
        self.calls.lock().push(Call::Delete {
            kind: K::KIND,
            name: name.to_string(),
        });
        Ok(())
    }

    async fn patch_status(&self, env: &Environment, status: &EnvironmentStatus) -> Result<(), Error> {
        self.check_failure("Environment", &env.name_any())?;
        self.mutate::<Environment>(env.namespace().as_deref(), &env.name_any(), |stored| {
            stored.status = Some(status.clone());
        });
        self.calls.lock().push(Call::Status(status.clone()));
        Ok(())
    }
}

/// Keeps every published event's reason.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, Event)>>,
}

impl RecordingSink {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|(_, event)| event.reason.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, env: &Environment, event: Event) {
        self.events.lock().push((env.name_any(), event));
    }
}
