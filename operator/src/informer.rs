//! Drives one kind's watch stream into its cache and notifies a handler.

use std::{collections::HashMap, pin::pin, sync::Arc};

use futures::StreamExt;
use kube::{
    Api,
    runtime::{
        WatchStreamExt,
        reflector::{ObjectRef, Store},
        watcher,
    },
};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{SlotWriter, WatchedKind},
    handler::{Deleted, ResourceEventHandler},
};

/// Objects seen while a relist is in progress.
struct Relist<K: WatchedKind> {
    previous: HashMap<ObjectRef<K>, Arc<K>>,
    pending: Vec<(Option<Arc<K>>, K)>,
}

pub struct Informer<K: WatchedKind> {
    slot: SlotWriter<K>,
    reader: Store<K>,
    relist: Option<Relist<K>>,
}

impl<K: WatchedKind> Informer<K> {
    pub fn new(slot: SlotWriter<K>) -> Self {
        let reader = slot.reader();
        Self {
            slot,
            reader,
            relist: None,
        }
    }

    /// Applies one watch event to the cache, then tells the handler.
    ///
    /// Notifications for a relist are held back until the new listing is
    /// visible in the store. Objects that were cached before the relist but
    /// are missing from it are reported as tombstones.
    pub fn handle<H: ResourceEventHandler<K> + ?Sized>(
        &mut self,
        event: watcher::Event<K>,
        handler: &H,
    ) {
        let old = match &event {
            watcher::Event::Apply(obj)
            | watcher::Event::Delete(obj)
            | watcher::Event::InitApply(obj) => self.reader.get(&ObjectRef::from_obj(obj)),
            watcher::Event::Init | watcher::Event::InitDone => None,
        };
        self.slot.writer.apply_watcher_event(&event);

        match event {
            watcher::Event::Apply(obj) => notify(handler, old, &obj),
            watcher::Event::Delete(obj) => handler.on_delete(Deleted::Observed(&obj)),
            watcher::Event::Init => {
                let previous = self
                    .reader
                    .state()
                    .into_iter()
                    .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
                    .collect();
                self.relist = Some(Relist {
                    previous,
                    pending: Vec::new(),
                });
            }
            watcher::Event::InitApply(obj) => match self.relist.as_mut() {
                Some(relist) => {
                    relist.previous.remove(&ObjectRef::from_obj(&obj));
                    relist.pending.push((old, obj));
                }
                None => notify(handler, old, &obj),
            },
            watcher::Event::InitDone => {
                self.slot.mark_synced();
                if let Some(relist) = self.relist.take() {
                    for (old, obj) in relist.pending {
                        notify(handler, old, &obj);
                    }
                    for gone in relist.previous.into_values() {
                        handler.on_delete(Deleted::Tombstone(gone.as_ref()));
                    }
                }
            }
        }
    }

    /// Runs until the watch stream ends or `shutdown` fires.
    pub async fn run<H>(mut self, api: Api<K>, handler: Arc<H>, shutdown: CancellationToken)
    where
        H: ResourceEventHandler<K> + ?Sized,
    {
        let mut stream = pin!(watcher(api, watcher::Config::default()).default_backoff());
        tracing::info!(kind = K::KIND, "starting informer");

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(event)) => self.handle(event, handler.as_ref()),
                Some(Err(error)) => tracing::warn!(kind = K::KIND, %error, "watch failed"),
                None => break,
            }
        }

        tracing::info!(kind = K::KIND, "informer stopped");
    }
}

fn notify<K, H>(handler: &H, old: Option<Arc<K>>, new: &K)
where
    K: WatchedKind,
    H: ResourceEventHandler<K> + ?Sized,
{
    match old {
        Some(old) => handler.on_update(old.as_ref(), new),
        None => handler.on_add(new),
    }
}
