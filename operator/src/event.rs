use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType};
use kube::{Client, Resource};
use kube_runtime::events::{Recorder, Reporter};
use tokio::sync::mpsc;

use crate::crd::Environment;

const EVENT_BUFFER: usize = 256;

/// Where human readable events about an Environment go. Publishing never
/// blocks and never fails from the caller's point of view.
pub trait EventSink: Send + Sync {
    fn publish(&self, env: &Environment, event: Event);
}

pub fn normal(reason: &str, note: impl Into<String>) -> Event {
    event(EventType::Normal, reason, note.into())
}

pub fn warning(reason: &str, note: impl Into<String>) -> Event {
    event(EventType::Warning, reason, note.into())
}

fn event(type_: EventType, reason: &str, note: String) -> Event {
    Event {
        type_,
        reason: reason.into(),
        note: Some(note),
        action: reason.into(),
        secondary: None,
    }
}

pub fn make_reporter() -> Reporter {
    Reporter {
        controller: "environment-operator".into(),
        instance: std::env::var("POD_NAME").ok(),
    }
}

/// Hands events to a single background task that writes them through the
/// kube [`Recorder`]. Events are dropped when the buffer is full.
#[derive(Clone)]
pub struct KubeEventSink {
    tx: mpsc::Sender<(ObjectReference, Event)>,
}

impl KubeEventSink {
    /// Must be called from within a tokio runtime.
    pub fn spawn(client: Client, reporter: Reporter) -> Self {
        let (tx, mut rx) = mpsc::channel::<(ObjectReference, Event)>(EVENT_BUFFER);
        let recorder = Recorder::new(client, reporter);

        tokio::spawn(async move {
            while let Some((reference, event)) = rx.recv().await {
                if let Err(error) = recorder.publish(&event, &reference).await {
                    tracing::warn!(%error, reason = %event.reason, "failed to publish event");
                }
            }
        });

        Self { tx }
    }
}

impl EventSink for KubeEventSink {
    fn publish(&self, env: &Environment, event: Event) {
        let reference = env.object_ref(&());
        if let Err(error) = self.tx.try_send((reference, event)) {
            tracing::debug!(%error, "dropping event");
        }
    }
}
