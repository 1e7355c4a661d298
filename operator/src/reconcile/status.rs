//! Computes the Environment status reported after a pass.

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;

use crate::crd::{Condition, Environment, EnvironmentPhase, EnvironmentStatus};

pub const READY: &str = "Ready";
pub const OWNERSHIP_CONFLICT: &str = "OwnershipConflict";

/// What one pass over the owned kinds did and found.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Creates, patches and deletes issued.
    pub writes: usize,
    /// Objects that are ours but still on their way out.
    pub terminating: usize,
    /// Writes the cluster refused because the cache has not caught up with
    /// an earlier write yet.
    pub pending: usize,
    /// One line per object the Environment wants but does not control.
    pub conflicts: Vec<String>,
}

impl Outcome {
    pub fn converged(&self) -> bool {
        self.writes == 0 && self.terminating == 0 && self.pending == 0
    }
}

/// How a pass ended, from the status' point of view.
pub enum Verdict<'a> {
    Invalid(&'a [String]),
    Synced {
        outcome: &'a Outcome,
        deployment: Option<&'a Deployment>,
    },
    Failed {
        outcome: &'a Outcome,
        error: String,
    },
}

fn condition(type_: &str, status: bool, reason: &str, message: String) -> Condition {
    Condition {
        r#type: type_.into(),
        status: if status { "True" } else { "False" }.into(),
        reason: Some(reason.into()),
        message: Some(message),
        last_transition_time: None,
    }
}

fn conflict_condition(outcome: &Outcome) -> Option<Condition> {
    (!outcome.conflicts.is_empty()).then(|| {
        condition(
            OWNERSHIP_CONFLICT,
            true,
            "ForeignOwner",
            outcome.conflicts.join("; "),
        )
    })
}

fn replicas(deployment: Option<&Deployment>) -> (i32, i32) {
    let Some(deployment) = deployment else {
        return (0, 0);
    };
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    (available, desired)
}

pub fn compute(env: &Environment, verdict: Verdict<'_>) -> EnvironmentStatus {
    let (phase, conditions) = match verdict {
        Verdict::Invalid(problems) => (
            EnvironmentPhase::Invalid,
            vec![condition(READY, false, "InvalidSpec", problems.join("; "))],
        ),
        Verdict::Failed { outcome, error } => {
            let mut conditions = vec![condition(READY, false, "ReconcileFailed", error)];
            conditions.extend(conflict_condition(outcome));
            (EnvironmentPhase::Failed, conditions)
        }
        Verdict::Synced {
            outcome,
            deployment,
        } => {
            let (available, desired) = replicas(deployment);
            let replicas_message = format!("{available}/{desired} replicas available");
            let (phase, ready) = if !outcome.conflicts.is_empty() {
                (
                    EnvironmentPhase::Conflict,
                    condition(
                        READY,
                        false,
                        OWNERSHIP_CONFLICT,
                        "owned resources are controlled by someone else".into(),
                    ),
                )
            } else if !outcome.converged() {
                (
                    EnvironmentPhase::Provisioning,
                    condition(
                        READY,
                        false,
                        "Reconciling",
                        "owned resources are being updated".into(),
                    ),
                )
            } else if deployment.is_none() || available < desired {
                (
                    EnvironmentPhase::Provisioning,
                    condition(READY, false, "ReplicasUnavailable", replicas_message),
                )
            } else {
                (
                    EnvironmentPhase::Ready,
                    condition(READY, true, "Available", replicas_message),
                )
            };
            let mut conditions = vec![ready];
            conditions.extend(conflict_condition(outcome));
            (phase, conditions)
        }
    };

    finish(env, phase, conditions)
}

/// Stamps transition times, keeping the previous one for every condition
/// whose status did not change.
fn finish(
    env: &Environment,
    phase: EnvironmentPhase,
    mut conditions: Vec<Condition>,
) -> EnvironmentStatus {
    let previous = env.status.as_ref();
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    for condition in &mut conditions {
        let carried = previous
            .and_then(|status| status.condition(&condition.r#type))
            .filter(|old| old.status == condition.status)
            .and_then(|old| old.last_transition_time.clone());
        condition.last_transition_time = Some(carried.unwrap_or_else(|| now.clone()));
    }

    EnvironmentStatus {
        phase: Some(phase),
        conditions,
        observed_generation: env.metadata.generation,
    }
}

/// Whether `next` reports a conflict the previous status did not.
pub fn conflict_is_new(previous: Option<&EnvironmentStatus>, next: &EnvironmentStatus) -> bool {
    let Some(now) = next.condition(OWNERSHIP_CONFLICT) else {
        return false;
    };
    previous
        .and_then(|status| status.condition(OWNERSHIP_CONFLICT))
        .is_none_or(|before| before.message != now.message)
}
