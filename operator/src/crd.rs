use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "envctl.example",
    version = "v1alpha1",
    kind = "Environment",
    plural = "environments",
    derive = "Default",
    status = "EnvironmentStatus",
    shortname = "env",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    namespaced
)]
pub struct EnvironmentSpec {
    pub image: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default = "default_port")]
    pub port: i32,

    #[serde(default)]
    pub storage: StorageSpec,

    #[serde(default)]
    pub networking: NetworkingSpec,

    #[serde(default)]
    pub rbac: RbacSpec,
}

impl EnvironmentSpec {
    /// Hex encoded sha256 of the serialized spec.
    ///
    /// Two specs with the same hash produce the same set of owned resources, so
    /// watch updates that keep the hash (status writes, label edits) carry no
    /// new desired state.
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default = "default_storage_size")]
    pub size: String,
    #[serde(default)]
    pub storage_class_name: Option<String>,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            size: default_storage_size(),
            storage_class_name: None,
        }
    }
}

/// Which edge resources front the environment's Service.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, JsonSchema, Default, PartialEq, Eq)]
pub enum NetworkingMode {
    None,
    Ingress,
    IngressRoute,
    #[default]
    Both,
}

impl NetworkingMode {
    pub fn wants_ingress(self) -> bool {
        matches!(self, NetworkingMode::Ingress | NetworkingMode::Both)
    }

    pub fn wants_ingress_route(self) -> bool {
        matches!(self, NetworkingMode::IngressRoute | NetworkingMode::Both)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingSpec {
    #[serde(default)]
    pub mode: NetworkingMode,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_entry_points")]
    pub entry_points: Vec<String>,
}

impl Default for NetworkingSpec {
    fn default() -> Self {
        Self {
            mode: NetworkingMode::default(),
            host: None,
            entry_points: default_entry_points(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RbacSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<RbacRule>,
}

impl Default for RbacSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RbacRule {
    #[serde(default)]
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub verbs: Vec<String>,
    #[serde(default)]
    pub resource_names: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, JsonSchema, PartialEq, Eq)]
pub enum EnvironmentPhase {
    Provisioning,
    Ready,
    Conflict,
    Invalid,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    pub phase: Option<EnvironmentPhase>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub observed_generation: Option<i64>,
}

impl EnvironmentStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == type_)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub last_transition_time: Option<String>,
}

/// Traefik's IngressRoute, as far as this operator writes it.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "traefik.containo.us",
    version = "v1alpha1",
    kind = "IngressRoute",
    plural = "ingressroutes",
    derive = "Default",
    namespaced
)]
pub struct IngressRouteSpec {
    #[serde(default)]
    pub entry_points: Vec<String>,
    #[serde(default)]
    pub routes: Vec<IngressRouteRoute>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressRouteRoute {
    pub r#match: String,
    pub kind: String,
    #[serde(default)]
    pub services: Vec<IngressRouteService>,
}

#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressRouteService {
    pub name: String,
    pub kind: String,
    pub port: i32,
}

fn default_replicas() -> i32 {
    1
}
fn default_port() -> i32 {
    8080
}
fn default_storage_size() -> String {
    "10Gi".into()
}
fn default_entry_points() -> Vec<String> {
    vec!["web".into()]
}
fn default_true() -> bool {
    true
}
