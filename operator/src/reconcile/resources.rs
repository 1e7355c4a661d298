//! Desired state and drift rules for every kind an Environment owns.
//!
//! Drift is checked against a per-kind whitelist of controller-owned fields:
//!
//! | kind                  | compared fields                                              |
//! |-----------------------|--------------------------------------------------------------|
//! | Namespace             | existence only                                               |
//! | ServiceAccount        | managed labels                                               |
//! | PersistentVolumeClaim | managed labels, storage request (grow only)                  |
//! | Role                  | managed labels, rules                                        |
//! | RoleBinding           | managed labels, subjects, roleRef (immutable, recreated)     |
//! | Deployment            | managed labels, replicas, container image, service account   |
//! | Service               | managed labels, selector keys, the `http` port               |
//! | Ingress               | managed labels, rules                                        |
//! | IngressRoute          | managed labels, entryPoints and routes                       |
//!
//! Anything else on a live object, such as cluster IPs, defaulted pod fields,
//! or image digests, belongs to the cluster and is never written.
//!
//! An Environment can only be stored in a namespace that already exists, so
//! on a live cluster the Namespace step finds it and leaves it alone. Creating
//! the namespace, and the label based cleanup that goes with it, only happen
//! when the Namespace cache has not seen it yet, which in practice means test
//! clusters built from the cache alone.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, Namespace, PersistentVolumeClaim,
            PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
            PodTemplateSpec, Service, ServiceAccount, ServicePort, ServiceSpec, Volume,
            VolumeMount, VolumeResourceRequirements,
        },
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, ServiceBackendPort,
        },
        rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, OwnerReference},
        util::intstr::IntOrString,
    },
};
use kube::{Api, Client, Resource, ResourceExt, api::ObjectMeta};

use super::drift::{Drift, PatchBuilder, diff_labels, image_matches, parse_quantity};
use crate::{
    cache::WatchedKind,
    crd::{Environment, IngressRoute, IngressRouteRoute, IngressRouteService, IngressRouteSpec},
    error::Error,
    key::{OWNER_NAME_LABEL, OWNER_NAMESPACE_LABEL},
};

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGER: &str = "environment-operator";

const CONTAINER_NAME: &str = "environment";
const PORT_NAME: &str = "http";
const DATA_VOLUME: &str = "data";
const DATA_MOUNT_PATH: &str = "/data";

/// Everything derived from the Environment once per pass.
pub struct DesiredContext<'a> {
    pub env: &'a Environment,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    owner_ref: OwnerReference,
}

impl<'a> DesiredContext<'a> {
    pub fn new(env: &'a Environment) -> Result<Self, Error> {
        let namespace = env
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let uid = env.uid().ok_or(Error::MissingObjectKey(".metadata.uid"))?;
        let owner_ref = env
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

        Ok(Self {
            env,
            namespace,
            name: env.name_any(),
            uid,
            owner_ref,
        })
    }

    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (NAME_LABEL.to_string(), "environment".to_string()),
            (INSTANCE_LABEL.to_string(), self.name.clone()),
        ])
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER.to_string());
        labels
    }

    pub fn host(&self) -> String {
        self.env
            .spec
            .networking
            .host
            .clone()
            .unwrap_or_else(|| format!("{}.local", self.name))
    }

    pub fn pvc_name(&self) -> String {
        format!("{}-data", self.name)
    }

    fn metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            owner_references: Some(vec![self.owner_ref.clone()]),
            ..Default::default()
        }
    }
}

/// Who controls a live object, relative to the Environment being reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Ours,
    /// Controlled by something else, including a previous Environment of the
    /// same name.
    Foreign(String),
    /// No controller at all; never adopted.
    Unmanaged,
    /// Never claimed, patched or deleted by a pass.
    Shared,
}

/// A kind an Environment owns at most one instance of.
pub trait OwnedKind: WatchedKind {
    /// Name of the single instance belonging to the Environment.
    fn owned_name(ctx: &DesiredContext<'_>) -> String {
        ctx.name.clone()
    }

    /// Namespace the instance is looked up in, `None` for cluster scoped kinds.
    fn lookup_namespace<'c>(ctx: &'c DesiredContext<'_>) -> Option<&'c str> {
        Some(ctx.namespace.as_str())
    }

    /// The object as the Environment spec wants it, or `None` when it should not exist.
    fn desired(ctx: &DesiredContext<'_>) -> Option<Self>;

    /// Compares controller-owned fields only.
    fn drift(desired: &Self, actual: &Self) -> Drift;

    fn api(client: Client, namespace: &str) -> Api<Self>;

    fn ownership(&self, ctx: &DesiredContext<'_>) -> Ownership {
        let controller = self
            .owner_references()
            .iter()
            .find(|r| r.controller == Some(true));
        match controller {
            Some(owner) if owner.uid == ctx.uid => Ownership::Ours,
            Some(owner) => Ownership::Foreign(format!("{}/{}", owner.kind, owner.name)),
            None => Ownership::Unmanaged,
        }
    }
}

impl OwnedKind for Namespace {
    fn owned_name(ctx: &DesiredContext<'_>) -> String {
        ctx.namespace.clone()
    }

    fn lookup_namespace<'c>(_ctx: &'c DesiredContext<'_>) -> Option<&'c str> {
        None
    }

    fn desired(ctx: &DesiredContext<'_>) -> Option<Self> {
        let mut labels = BTreeMap::from([
            (OWNER_NAMESPACE_LABEL.to_string(), ctx.namespace.clone()),
            (OWNER_NAME_LABEL.to_string(), ctx.name.clone()),
        ]);
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGER.to_string());

        Some(Namespace {
            metadata: ObjectMeta {
                name: Some(ctx.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn drift(_desired: &Self, _actual: &Self) -> Drift {
        Drift::InSync
    }

    fn api(client: Client, _namespace: &str) -> Api<Self> {
        Api::all(client)
    }

    fn ownership(&self, _ctx: &DesiredContext<'_>) -> Ownership {
        Ownership::Shared
    }
}

impl OwnedKind for ServiceAccount {
    fn desired(ctx: &DesiredContext<'_>) -> Option<Self> {
        Some(ServiceAccount {
            metadata: ctx.metadata(Self::owned_name(ctx)),
            ..Default::default()
        })
    }

    fn drift(desired: &Self, actual: &Self) -> Drift {
        let mut patch = PatchBuilder::default();
        diff_labels(&mut patch, desired.metadata.labels.as_ref(), actual.metadata.labels.as_ref());
        patch.into_drift()
    }

    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

fn storage_request(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
}

impl OwnedKind for PersistentVolumeClaim {
    fn owned_name(ctx: &DesiredContext<'_>) -> String {
        ctx.pvc_name()
    }

    fn desired(ctx: &DesiredContext<'_>) -> Option<Self> {
        let storage = &ctx.env.spec.storage;
        Some(PersistentVolumeClaim {
            metadata: ctx.metadata(Self::owned_name(ctx)),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".into()]),
                storage_class_name: storage.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(storage.size.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Claims can only grow; a smaller request is left for the cluster to
    /// reject rather than fought over on every pass.
    fn drift(desired: &Self, actual: &Self) -> Drift {
        let mut patch = PatchBuilder::default();
        diff_labels(&mut patch, desired.metadata.labels.as_ref(), actual.metadata.labels.as_ref());

        if let Some(want) = storage_request(desired) {
            let have = storage_request(actual).and_then(|q| parse_quantity(&q.0));
            match (parse_quantity(&want.0), have) {
                (Some(want_bytes), Some(have_bytes)) if want_bytes > have_bytes => {
                    patch.set(&["spec", "resources", "requests", "storage"], want);
                }
                (Some(_), None) => {
                    patch.set(&["spec", "resources", "requests", "storage"], want);
                }
                _ => {}
            }
        }
        patch.into_drift()
    }

    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

impl OwnedKind for Role {
    fn desired(ctx: &DesiredContext<'_>) -> Option<Self> {
        let rbac = &ctx.env.spec.rbac;
        if !rbac.enabled {
            return None;
        }
        let rules = rbac
            .rules
            .iter()
            .map(|rule| PolicyRule {
                api_groups: Some(rule.api_groups.clone()),
                resources: Some(rule.resources.clone()),
                verbs: rule.verbs.clone(),
                resource_names: (!rule.resource_names.is_empty())
                    .then(|| rule.resource_names.clone()),
                non_resource_urls: None,
            })
            .collect();

        Some(Role {
            metadata: ctx.metadata(Self::owned_name(ctx)),
            rules: Some(rules),
        })
    }

    fn drift(desired: &Self, actual: &Self) -> Drift {
        let mut patch = PatchBuilder::default();
        diff_labels(&mut patch, desired.metadata.labels.as_ref(), actual.metadata.labels.as_ref());

        let want = desired.rules.as_deref().unwrap_or_default();
        let have = actual.rules.as_deref().unwrap_or_default();
        if want != have {
            patch.set(&["rules"], want);
        }
        patch.into_drift()
    }

    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

impl OwnedKind for RoleBinding {
    fn desired(ctx: &DesiredContext<'_>) -> Option<Self> {
        if !ctx.env.spec.rbac.enabled {
            return None;
        }
        Some(RoleBinding {
            metadata: ctx.metadata(Self::owned_name(ctx)),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "Role".into(),
                name: <Role as OwnedKind>::owned_name(ctx),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".into(),
                name: <ServiceAccount as OwnedKind>::owned_name(ctx),
                namespace: Some(ctx.namespace.clone()),
                api_group: None,
            }]),
        })
    }

    fn drift(desired: &Self, actual: &Self) -> Drift {
        if desired.role_ref != actual.role_ref {
            return Drift::Recreate("roleRef is immutable");
        }
        let mut patch = PatchBuilder::default();
        diff_labels(&mut patch, desired.metadata.labels.as_ref(), actual.metadata.labels.as_ref());
        if desired.subjects != actual.subjects {
            patch.set(&["subjects"], &desired.subjects);
        }
        patch.into_drift()
    }

    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

fn pod_spec(deployment: &Deployment) -> Option<&PodSpec> {
    deployment.spec.as_ref()?.template.spec.as_ref()
}

impl OwnedKind for Deployment {
    fn desired(ctx: &DesiredContext<'_>) -> Option<Self> {
        let spec = &ctx.env.spec;
        let selector = ctx.selector_labels();

        let container = Container {
            name: CONTAINER_NAME.into(),
            image: Some(spec.image.clone()),
            ports: Some(vec![ContainerPort {
                name: Some(PORT_NAME.into()),
                container_port: spec.port,
                ..Default::default()
            }]),
            volume_mounts: Some(vec![VolumeMount {
                name: DATA_VOLUME.into(),
                mount_path: DATA_MOUNT_PATH.into(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        Some(Deployment {
            metadata: ctx.metadata(Self::owned_name(ctx)),
            spec: Some(DeploymentSpec {
                replicas: Some(spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(ctx.labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        service_account_name: Some(
                            <ServiceAccount as OwnedKind>::owned_name(ctx),
                        ),
                        volumes: Some(vec![Volume {
                            name: DATA_VOLUME.into(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: ctx.pvc_name(),
                                read_only: None,
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn drift(desired: &Self, actual: &Self) -> Drift {
        let mut patch = PatchBuilder::default();
        diff_labels(&mut patch, desired.metadata.labels.as_ref(), actual.metadata.labels.as_ref());

        let want_replicas = desired.spec.as_ref().and_then(|s| s.replicas);
        let have_replicas = actual.spec.as_ref().and_then(|s| s.replicas);
        if want_replicas != have_replicas {
            patch.set(&["spec", "replicas"], want_replicas);
        }

        let (Some(want_pod), actual_pod) = (pod_spec(desired), pod_spec(actual)) else {
            return patch.into_drift();
        };

        let want_sa = want_pod.service_account_name.as_deref();
        if actual_pod.and_then(|p| p.service_account_name.as_deref()) != want_sa {
            patch.set(&["spec", "template", "spec", "serviceAccountName"], want_sa);
        }

        // merge patches replace lists wholesale, so start from the live list
        // and only touch the controller's container
        if let Some(want) = want_pod.containers.first() {
            let mut containers = actual_pod.map(|p| p.containers.clone()).unwrap_or_default();
            let want_image = want.image.as_deref().unwrap_or_default();
            let changed = match containers.iter_mut().find(|c| c.name == want.name) {
                Some(have) => {
                    let stale = !have
                        .image
                        .as_deref()
                        .is_some_and(|image| image_matches(want_image, image));
                    if stale {
                        have.image = want.image.clone();
                    }
                    stale
                }
                None => {
                    containers.push(want.clone());
                    true
                }
            };
            if changed {
                patch.set(&["spec", "template", "spec", "containers"], containers);
            }
        }

        patch.into_drift()
    }

    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

impl OwnedKind for Service {
    fn desired(ctx: &DesiredContext<'_>) -> Option<Self> {
        let port = ctx.env.spec.port;
        Some(Service {
            metadata: ctx.metadata(Self::owned_name(ctx)),
            spec: Some(ServiceSpec {
                selector: Some(ctx.selector_labels()),
                ports: Some(vec![ServicePort {
                    name: Some(PORT_NAME.into()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn drift(desired: &Self, actual: &Self) -> Drift {
        let mut patch = PatchBuilder::default();
        diff_labels(&mut patch, desired.metadata.labels.as_ref(), actual.metadata.labels.as_ref());

        let Some(want) = desired.spec.as_ref() else {
            return patch.into_drift();
        };
        let have = actual.spec.as_ref();

        let have_selector = have.and_then(|s| s.selector.as_ref());
        for (key, value) in want.selector.iter().flatten() {
            if have_selector.and_then(|s| s.get(key)) != Some(value) {
                patch.set(&["spec", "selector", key.as_str()], value);
            }
        }

        if let Some(want_port) = want.ports.iter().flatten().next() {
            let mut ports = have.and_then(|s| s.ports.clone()).unwrap_or_default();
            let changed = match ports.iter_mut().find(|p| p.name == want_port.name) {
                Some(have_port)
                    if have_port.port == want_port.port
                        && have_port.target_port == want_port.target_port =>
                {
                    false
                }
                Some(have_port) => {
                    have_port.port = want_port.port;
                    have_port.target_port = want_port.target_port.clone();
                    true
                }
                None => {
                    ports.push(want_port.clone());
                    true
                }
            };
            if changed {
                patch.set(&["spec", "ports"], ports);
            }
        }

        patch.into_drift()
    }

    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

impl OwnedKind for Ingress {
    fn desired(ctx: &DesiredContext<'_>) -> Option<Self> {
        if !ctx.env.spec.networking.mode.wants_ingress() {
            return None;
        }
        let backend = IngressBackend {
            service: Some(IngressServiceBackend {
                name: <Service as OwnedKind>::owned_name(ctx),
                port: Some(ServiceBackendPort {
                    number: Some(ctx.env.spec.port),
                    name: None,
                }),
            }),
            resource: None,
        };

        Some(Ingress {
            metadata: ctx.metadata(Self::owned_name(ctx)),
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(ctx.host()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".into()),
                            path_type: "Prefix".into(),
                            backend,
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn drift(desired: &Self, actual: &Self) -> Drift {
        let mut patch = PatchBuilder::default();
        diff_labels(&mut patch, desired.metadata.labels.as_ref(), actual.metadata.labels.as_ref());

        let want = desired.spec.as_ref().and_then(|s| s.rules.as_ref());
        let have = actual.spec.as_ref().and_then(|s| s.rules.as_ref());
        if want != have {
            patch.set(&["spec", "rules"], want);
        }
        patch.into_drift()
    }

    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

impl OwnedKind for IngressRoute {
    fn desired(ctx: &DesiredContext<'_>) -> Option<Self> {
        let networking = &ctx.env.spec.networking;
        if !networking.mode.wants_ingress_route() {
            return None;
        }

        let mut route = IngressRoute::new(
            &Self::owned_name(ctx),
            IngressRouteSpec {
                entry_points: networking.entry_points.clone(),
                routes: vec![IngressRouteRoute {
                    r#match: format!("Host(`{}`)", ctx.host()),
                    kind: "Rule".into(),
                    services: vec![IngressRouteService {
                        name: <Service as OwnedKind>::owned_name(ctx),
                        kind: "Service".into(),
                        port: ctx.env.spec.port,
                    }],
                }],
            },
        );
        route.metadata = ctx.metadata(Self::owned_name(ctx));
        Some(route)
    }

    fn drift(desired: &Self, actual: &Self) -> Drift {
        let mut patch = PatchBuilder::default();
        diff_labels(&mut patch, desired.metadata.labels.as_ref(), actual.metadata.labels.as_ref());
        if desired.spec.entry_points != actual.spec.entry_points {
            patch.set(&["spec", "entryPoints"], &desired.spec.entry_points);
        }
        if desired.spec.routes != actual.spec.routes {
            patch.set(&["spec", "routes"], &desired.spec.routes);
        }
        patch.into_drift()
    }

    fn api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use serde_json::json;

    use super::*;
    use crate::{crd::NetworkingMode, testutil};

    fn ctx(env: &Environment) -> DesiredContext<'_> {
        DesiredContext::new(env).unwrap()
    }

    #[test]
    fn context_requires_uid() {
        let mut env = testutil::environment("ns", "foo", 1);
        env.metadata.uid = None;
        assert!(matches!(
            DesiredContext::new(&env),
            Err(Error::MissingObjectKey(".metadata.uid"))
        ));
    }

    #[test]
    fn desired_objects_carry_owner_and_labels() {
        let env = testutil::environment("ns", "foo", 2);
        let ctx = ctx(&env);
        let deployment = Deployment::desired(&ctx).unwrap();

        assert_eq!(deployment.name_any(), "foo");
        assert_eq!(deployment.namespace().as_deref(), Some("ns"));
        assert_eq!(deployment.ownership(&ctx), Ownership::Ours);
        assert_eq!(deployment.labels().get(MANAGED_BY_LABEL).map(String::as_str), Some(MANAGER));
        assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(2));

        let pvc = PersistentVolumeClaim::desired(&ctx).unwrap();
        assert_eq!(pvc.name_any(), "foo-data");
        assert_eq!(storage_request(&pvc), Some(&Quantity("10Gi".into())));
    }

    #[test]
    fn networking_mode_and_rbac_gate_optional_kinds() {
        let mut env = testutil::environment("ns", "foo", 1);
        env.spec.networking.mode = NetworkingMode::Ingress;
        env.spec.rbac.enabled = false;
        let ctx = ctx(&env);

        assert!(Ingress::desired(&ctx).is_some());
        assert!(IngressRoute::desired(&ctx).is_none());
        assert!(Role::desired(&ctx).is_none());
        assert!(RoleBinding::desired(&ctx).is_none());
    }

    #[test]
    fn ownership_is_decided_by_controller_uid() {
        let env = testutil::environment("ns", "foo", 1);
        let other = testutil::environment_with_uid("ns", "foo", 1, "other-uid");
        let ctx = ctx(&env);

        let mine = Service::desired(&ctx).unwrap();
        let theirs = Service::desired(&DesiredContext::new(&other).unwrap()).unwrap();
        let mut unmanaged = mine.clone();
        unmanaged.metadata.owner_references = None;

        assert_eq!(mine.ownership(&ctx), Ownership::Ours);
        assert_eq!(
            theirs.ownership(&ctx),
            Ownership::Foreign("Environment/foo".into())
        );
        assert_eq!(unmanaged.ownership(&ctx), Ownership::Unmanaged);
    }

    #[test]
    fn deployment_drift_only_touches_owned_fields() {
        let env = testutil::environment("ns", "foo", 2);
        let ctx = ctx(&env);
        let desired = Deployment::desired(&ctx).unwrap();

        let mut live = desired.clone();
        live.status = Some(DeploymentStatus {
            available_replicas: Some(5),
            ..Default::default()
        });
        live.spec.as_mut().unwrap().replicas = Some(5);
        let pod = live.spec.as_mut().unwrap().template.spec.as_mut().unwrap();
        pod.containers[0].image = Some("nginx:1.25@sha256:feed".into());
        pod.dns_policy = Some("ClusterFirst".into());

        assert_eq!(
            Deployment::drift(&desired, &live),
            Drift::Patch(json!({"spec": {"replicas": 2}}))
        );
    }

    #[test]
    fn deployment_image_change_keeps_sidecars() {
        let mut env = testutil::environment("ns", "foo", 1);
        let mut live = Deployment::desired(&ctx(&env)).unwrap();
        live.spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers
            .push(Container {
                name: "proxy".into(),
                image: Some("envoy:1".into()),
                ..Default::default()
            });

        env.spec.image = "nginx:1.26".into();
        let desired = Deployment::desired(&ctx(&env)).unwrap();
        let Drift::Patch(patch) = Deployment::drift(&desired, &live) else {
            panic!("expected a patch");
        };
        let containers = &patch["spec"]["template"]["spec"]["containers"];
        assert_eq!(containers[0]["image"], "nginx:1.26");
        assert_eq!(containers[1]["name"], "proxy");
    }

    #[test]
    fn service_drift_preserves_cluster_ip() {
        let mut env = testutil::environment("ns", "foo", 1);
        let mut live = Service::desired(&ctx(&env)).unwrap();
        live.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.7".into());

        let desired = Service::desired(&ctx(&env)).unwrap();
        assert_eq!(Service::drift(&desired, &live), Drift::InSync);

        env.spec.port = 9090;
        let desired = Service::desired(&ctx(&env)).unwrap();
        let Drift::Patch(patch) = Service::drift(&desired, &live) else {
            panic!("expected a patch");
        };
        assert_eq!(patch["spec"]["ports"][0]["port"], 9090);
        assert!(patch["spec"].get("clusterIP").is_none());
    }

    #[test]
    fn pvc_only_grows() {
        let mut env = testutil::environment("ns", "foo", 1);
        let live = PersistentVolumeClaim::desired(&ctx(&env)).unwrap();

        env.spec.storage.size = "5Gi".into();
        let smaller = PersistentVolumeClaim::desired(&ctx(&env)).unwrap();
        assert_eq!(PersistentVolumeClaim::drift(&smaller, &live), Drift::InSync);

        env.spec.storage.size = "20Gi".into();
        let larger = PersistentVolumeClaim::desired(&ctx(&env)).unwrap();
        assert_eq!(
            PersistentVolumeClaim::drift(&larger, &live),
            Drift::Patch(json!({"spec": {"resources": {"requests": {"storage": "20Gi"}}}}))
        );
    }

    #[test]
    fn role_binding_role_ref_change_recreates() {
        let env = testutil::environment("ns", "foo", 1);
        let desired = RoleBinding::desired(&ctx(&env)).unwrap();
        let mut live = desired.clone();
        live.role_ref.name = "something-else".into();

        assert!(matches!(RoleBinding::drift(&desired, &live), Drift::Recreate(_)));
    }

    #[test]
    fn namespace_is_shared_and_never_drifts() {
        let env = testutil::environment("ns", "foo", 1);
        let ctx = ctx(&env);
        let ns = Namespace::desired(&ctx).unwrap();

        assert_eq!(Namespace::owned_name(&ctx), "ns");
        assert_eq!(Namespace::lookup_namespace(&ctx), None);
        assert_eq!(ns.ownership(&ctx), Ownership::Shared);
        assert_eq!(Namespace::drift(&ns, &Namespace::default()), Drift::InSync);
    }

    #[test]
    fn ingress_route_points_at_service() {
        let env = testutil::environment("ns", "foo", 1);
        let route = IngressRoute::desired(&ctx(&env)).unwrap();

        assert_eq!(route.spec.entry_points, vec!["web".to_string()]);
        assert_eq!(route.spec.routes[0].r#match, "Host(`foo.local`)");
        assert_eq!(route.spec.routes[0].services[0].name, "foo");
        assert_eq!(route.spec.routes[0].services[0].port, 8080);
    }
}
