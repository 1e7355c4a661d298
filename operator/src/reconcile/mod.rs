//! One reconciliation pass: bring an Environment's owned objects in line
//! with its spec and report the outcome in its status.
//!
//! Reads come exclusively from the [`ObjectCache`]. Writes go through a
//! [`ClusterWriter`] and are not expected to be visible in the cache until
//! the watch delivers them, which in turn triggers the next pass.

mod drift;
mod resources;
mod status;
mod writer;

use std::sync::Arc;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Namespace, PersistentVolumeClaim, Service, ServiceAccount},
    networking::v1::Ingress,
    rbac::v1::{Role, RoleBinding},
};
use kube::{Resource, ResourceExt};
use serde_json::{Value, json};

pub use self::{
    drift::Drift,
    resources::{DesiredContext, OwnedKind, Ownership},
    writer::{ClusterWriter, KubeWriter},
};
use self::{
    drift::parse_quantity,
    status::{Outcome, Verdict},
};
use crate::{
    cache::ObjectCache,
    crd::{Environment, EnvironmentSpec, EnvironmentStatus, IngressRoute},
    error::Error,
    event::{self, EventSink},
    key::{EnvKey, KeyExtraction, KeyExtractor},
};

/// What a pass does about one owned kind.
#[derive(Debug, PartialEq)]
pub enum Step<K> {
    Create(K),
    /// JSON merge patch, guarded by the live object's resource version.
    Patch(Value),
    Recreate(&'static str),
    Delete,
    /// Wanted, but the object under that name is controlled by someone else.
    Conflict(String),
    /// Ours and already being deleted; wait for it to go away.
    Terminating,
    InSync,
    /// Neither wanted nor present under our control.
    Absent,
}

/// Decides the step for one kind from the desired and the cached object.
pub fn plan<K: OwnedKind>(ctx: &DesiredContext<'_>, observed: Option<&K>) -> Step<K> {
    let desired = K::desired(ctx);
    let Some(actual) = observed else {
        return match desired {
            Some(obj) => Step::Create(obj),
            None => Step::Absent,
        };
    };

    match (actual.ownership(ctx), desired) {
        (Ownership::Shared, _) => Step::InSync,
        (Ownership::Foreign(owner), Some(_)) => Step::Conflict(format!("is controlled by {owner}")),
        (Ownership::Unmanaged, Some(_)) => Step::Conflict("exists without a controller".into()),
        (Ownership::Foreign(_) | Ownership::Unmanaged, None) => Step::Absent,
        (Ownership::Ours, _) if actual.meta().deletion_timestamp.is_some() => Step::Terminating,
        (Ownership::Ours, None) => Step::Delete,
        (Ownership::Ours, Some(desired)) => match K::drift(&desired, actual) {
            Drift::InSync => Step::InSync,
            Drift::Patch(patch) => Step::Patch(guard_with_resource_version(patch, actual)),
            Drift::Recreate(reason) => Step::Recreate(reason),
        },
    }
}

fn guard_with_resource_version<K: Resource>(mut patch: Value, actual: &K) -> Value {
    if let (Some(version), Some(root)) = (&actual.meta().resource_version, patch.as_object_mut()) {
        let metadata = root.entry("metadata").or_insert_with(|| json!({}));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.insert("resourceVersion".into(), Value::String(version.clone()));
        }
    }
    patch
}

/// Problems that make the Environment spec impossible to realise. Empty when valid.
pub fn validate(spec: &EnvironmentSpec) -> Vec<String> {
    let mut problems = Vec::new();

    if spec.image.trim().is_empty() {
        problems.push("image must not be empty".to_string());
    }
    if spec.replicas < 0 {
        problems.push(format!("replicas must not be negative, got {}", spec.replicas));
    }
    if !(1..=65535).contains(&spec.port) {
        problems.push(format!("port must be between 1 and 65535, got {}", spec.port));
    }
    if !parse_quantity(&spec.storage.size).is_some_and(|bytes| bytes > 0.0) {
        problems.push(format!(
            "storage size {:?} is not a positive quantity",
            spec.storage.size
        ));
    }
    if spec.networking.mode.wants_ingress_route() && spec.networking.entry_points.is_empty() {
        problems.push("networking.entryPoints must not be empty for IngressRoute".to_string());
    }
    if spec.rbac.enabled {
        for (i, rule) in spec.rbac.rules.iter().enumerate() {
            if rule.verbs.is_empty() {
                problems.push(format!("rbac rule {i} has no verbs"));
            }
            if rule.resources.is_empty() {
                problems.push(format!("rbac rule {i} has no resources"));
            }
            if rule.api_groups.is_empty() {
                problems.push(format!(
                    "rbac rule {i} has no apiGroups, use \"\" for the core group"
                ));
            }
        }
    }

    problems
}

pub struct Reconciler<W> {
    cache: Arc<ObjectCache>,
    writer: W,
    events: Arc<dyn EventSink>,
}

impl<W: ClusterWriter> Reconciler<W> {
    pub fn new(cache: Arc<ObjectCache>, writer: W, events: Arc<dyn EventSink>) -> Self {
        Self {
            cache,
            writer,
            events,
        }
    }

    pub async fn reconcile(&self, key: &EnvKey) -> Result<(), Error> {
        let Some(env) = self
            .cache
            .get::<Environment>(Some(&key.namespace), &key.name)
        else {
            return self.cleanup(key).await;
        };
        if env.meta().deletion_timestamp.is_some() {
            tracing::debug!(%key, "environment is being deleted");
            return Ok(());
        }

        let problems = validate(&env.spec);
        if !problems.is_empty() {
            tracing::info!(%key, ?problems, "environment spec is invalid");
            let next = status::compute(&env, Verdict::Invalid(&problems));
            if self.write_status(&env, &next).await? {
                self.events
                    .publish(&env, event::warning("InvalidSpec", problems.join("; ")));
            }
            return Ok(());
        }

        let ctx = DesiredContext::new(&env)?;
        let mut outcome = Outcome::default();

        if let Err(error) = self.apply(&ctx, &mut outcome).await {
            let next = status::compute(
                &env,
                Verdict::Failed {
                    outcome: &outcome,
                    error: error.to_string(),
                },
            );
            if let Err(status_error) = self.write_status(&env, &next).await {
                tracing::warn!(%key, error = %status_error, "failed to record failure in status");
            }
            return Err(error);
        }

        let deployment = self
            .cache
            .get::<Deployment>(Some(&ctx.namespace), &<Deployment as OwnedKind>::owned_name(&ctx))
            .filter(|deployment| deployment.ownership(&ctx) == Ownership::Ours);
        let next = status::compute(
            &env,
            Verdict::Synced {
                outcome: &outcome,
                deployment: deployment.as_deref(),
            },
        );

        if status::conflict_is_new(env.status.as_ref(), &next) {
            self.events.publish(
                &env,
                event::warning("OwnershipConflict", outcome.conflicts.join("; ")),
            );
        }
        self.write_status(&env, &next).await?;

        tracing::debug!(
            %key,
            writes = outcome.writes,
            conflicts = outcome.conflicts.len(),
            phase = ?next.phase,
            "reconciled"
        );
        Ok(())
    }

    /// Owned kinds in dependency order. The first failure ends the pass.
    async fn apply(&self, ctx: &DesiredContext<'_>, outcome: &mut Outcome) -> Result<(), Error> {
        self.sync::<Namespace>(ctx, outcome).await?;
        self.sync::<ServiceAccount>(ctx, outcome).await?;
        self.sync::<PersistentVolumeClaim>(ctx, outcome).await?;
        self.sync::<Role>(ctx, outcome).await?;
        self.sync::<RoleBinding>(ctx, outcome).await?;
        self.sync::<Deployment>(ctx, outcome).await?;
        self.sync::<Service>(ctx, outcome).await?;
        self.sync::<Ingress>(ctx, outcome).await?;
        self.sync::<IngressRoute>(ctx, outcome).await?;
        Ok(())
    }

    async fn sync<K: OwnedKind>(
        &self,
        ctx: &DesiredContext<'_>,
        outcome: &mut Outcome,
    ) -> Result<(), Error> {
        let name = K::owned_name(ctx);
        let namespace = K::lookup_namespace(ctx);
        let observed = self.cache.get::<K>(namespace, &name);

        let (result, note) = match plan(ctx, observed.as_deref()) {
            Step::InSync | Step::Absent => return Ok(()),
            Step::Terminating => {
                outcome.terminating += 1;
                return Ok(());
            }
            Step::Conflict(reason) => {
                tracing::warn!(kind = K::KIND, %name, %reason, "not touching object we do not own");
                outcome.conflicts.push(format!("{} {name} {reason}", K::KIND));
                return Ok(());
            }
            Step::Create(obj) => (
                self.writer.create(&obj).await,
                event::normal("Created", format!("Created {} {name}", K::KIND)),
            ),
            Step::Patch(patch) => {
                tracing::debug!(kind = K::KIND, %name, %patch, "patching drifted fields");
                (
                    self.writer.patch::<K>(namespace, &name, &patch).await,
                    event::normal("Updated", format!("Updated {} {name}", K::KIND)),
                )
            }
            Step::Recreate(reason) => (
                self.writer.delete::<K>(namespace, &name).await,
                event::normal(
                    "Recreating",
                    format!("Deleted {} {name} to recreate it: {reason}", K::KIND),
                ),
            ),
            Step::Delete => (
                self.writer.delete::<K>(namespace, &name).await,
                event::normal("Deleted", format!("Deleted {} {name}", K::KIND)),
            ),
        };

        match result {
            Ok(()) => {}
            Err(error) if error.is_stale_read() => {
                tracing::debug!(kind = K::KIND, %name, %error, "cache is behind the cluster, waiting for the watch");
                outcome.pending += 1;
                return Ok(());
            }
            Err(error) => return Err(error),
        }

        tracing::info!(kind = K::KIND, %name, action = %note.action, "applied");
        outcome.writes += 1;
        self.events.publish(ctx.env, note);
        Ok(())
    }

    /// Runs when the Environment is gone. Namespaced objects are collected by
    /// the cluster through their owner references; namespaces created for the
    /// Environment carry labels instead and are removed here once no other
    /// Environment lives in them. A namespace is only labelled when this
    /// controller created it, which a live cluster never requires (see
    /// the `resources` module), so there this finds nothing to delete.
    async fn cleanup(&self, key: &EnvKey) -> Result<(), Error> {
        for namespace in self.cache.list::<Namespace>() {
            if namespace.extract_key() != KeyExtraction::Key(key.clone())
                || namespace.meta().deletion_timestamp.is_some()
            {
                continue;
            }
            let name = namespace.name_any();
            let occupied = self
                .cache
                .list::<Environment>()
                .iter()
                .any(|env| env.namespace().as_deref() == Some(name.as_str()));
            if occupied {
                tracing::debug!(%key, namespace = %name, "namespace still holds environments");
                continue;
            }

            tracing::info!(%key, namespace = %name, "deleting namespace of removed environment");
            match self.writer.delete::<Namespace>(None, &name).await {
                Err(error) if !error.is_not_found() => return Err(error),
                _ => {}
            }
        }
        Ok(())
    }

    /// Returns whether anything was written.
    async fn write_status(&self, env: &Environment, next: &EnvironmentStatus) -> Result<bool, Error> {
        if env.status.as_ref() == Some(next) {
            return Ok(false);
        }
        self.writer.patch_status(env, next).await?;
        Ok(true)
    }
}
