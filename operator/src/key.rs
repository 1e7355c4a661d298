//! Maps any watched object to the Environment that owns it.

use std::fmt;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Namespace, PersistentVolumeClaim, Service, ServiceAccount},
    networking::v1::Ingress,
    rbac::v1::{Role, RoleBinding},
};
use kube::{Resource, ResourceExt, api::ObjectMeta};

use crate::crd::{Environment, IngressRoute};

/// Label put on namespaces created for an Environment. Namespaces are cluster
/// scoped and cannot carry an owner reference to a namespaced object.
pub const OWNER_NAME_LABEL: &str = "envctl.example/environment";
pub const OWNER_NAMESPACE_LABEL: &str = "envctl.example/environment-namespace";

/// Identity of an Environment, and the unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvKey {
    pub namespace: String,
    pub name: String,
}

impl EnvKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EnvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExtraction {
    Key(EnvKey),
    /// Nothing points at an Environment; the object is none of our business.
    Unowned,
    /// A reference to an Environment exists but cannot be turned into a key.
    Malformed(&'static str),
}

/// Per-kind strategy for finding the owning Environment.
///
/// Works purely on the object it is given, which for deletes may be the
/// last-known state rather than anything still present in a cache.
pub trait KeyExtractor {
    fn extract_key(&self) -> KeyExtraction;
}

impl KeyExtractor for Environment {
    fn extract_key(&self) -> KeyExtraction {
        match (self.meta().namespace.as_deref(), self.meta().name.as_deref()) {
            (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() => {
                KeyExtraction::Key(EnvKey::new(ns, name))
            }
            _ => KeyExtraction::Malformed("environment without namespace or name"),
        }
    }
}

impl KeyExtractor for Namespace {
    fn extract_key(&self) -> KeyExtraction {
        let labels = self.labels();
        match (
            labels.get(OWNER_NAMESPACE_LABEL),
            labels.get(OWNER_NAME_LABEL),
        ) {
            (None, None) => KeyExtraction::Unowned,
            (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() => {
                KeyExtraction::Key(EnvKey::new(ns.as_str(), name.as_str()))
            }
            _ => KeyExtraction::Malformed("incomplete environment owner labels"),
        }
    }
}

/// Resolves the controller owner reference pointing at an Environment.
///
/// Owner references are namespace-local, so the owner lives in the object's
/// own namespace.
pub fn key_from_owner_references(meta: &ObjectMeta) -> KeyExtraction {
    let group = Environment::group(&());
    let kind = Environment::kind(&());

    let Some(owner) = meta.owner_references.iter().flatten().find(|r| {
        r.kind == kind && r.api_version.split('/').next() == Some(group.as_ref())
    }) else {
        return KeyExtraction::Unowned;
    };

    if owner.controller != Some(true) {
        return KeyExtraction::Malformed("environment owner reference is not a controller reference");
    }
    if owner.name.is_empty() {
        return KeyExtraction::Malformed("environment owner reference without name");
    }
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => KeyExtraction::Key(EnvKey::new(ns, owner.name.as_str())),
        _ => KeyExtraction::Malformed("owned object without namespace"),
    }
}

macro_rules! owned_by_reference {
    ($($kind:ty),+ $(,)?) => {
        $(
            impl KeyExtractor for $kind {
                fn extract_key(&self) -> KeyExtraction {
                    key_from_owner_references(self.meta())
                }
            }
        )+
    };
}

owned_by_reference!(
    Deployment,
    Service,
    ServiceAccount,
    PersistentVolumeClaim,
    Ingress,
    IngressRoute,
    Role,
    RoleBinding,
);
