use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    DATABASE_NAME_PREFIX, GENERIC_KEY, LABEL_DATABASE_KIND, LABEL_DATABASE_NAME,
    MANAGED_BY_LABEL_KEY, NAME_LABEL_KEY, RESOURCE_KIND_POSTGRES,
};

#[derive(
    CustomResource,
    Deserialize,
    Serialize,
    Clone,
    Debug,
    JsonSchema,
    Default,
    PartialEq,
)]
#[kube(
    group = "db.oaas.io",
    version = "v1alpha1",
    kind = "Postgres",
    plural = "postgreses",
    shortname = "pg",
    namespaced,
    status = "PostgresStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresSpec {
    /// Database engine version (e.g., "16.2")
    pub version: String,
    /// Number of database replicas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Secret holding the superuser credentials. Generated on first
    /// provision when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_secret: Option<SecretRef>,
    /// Continuous WAL archival configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archiver: Option<ArchiverSpec>,
    /// Purge leftover secrets and archived WAL data on termination
    #[serde(default)]
    pub wipe_out: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub secret_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiverSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<BackendSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    /// Secret with object-storage credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_secret_name: Option<String>,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<DatabasePhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum DatabasePhase {
    Creating,
    Running,
    Failed,
    Terminating,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
    Available,
    Progressing,
    Degraded,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl PostgresSpec {
    /// Names of every secret this spec refers to.
    pub fn secrets(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(s) = &self.database_secret {
            out.push(s.secret_name.clone());
        }
        if let Some(name) = self
            .archiver
            .as_ref()
            .and_then(|a| a.storage.as_ref())
            .and_then(|s| s.storage_secret_name.clone())
        {
            out.push(name);
        }
        out
    }
}

/// Label set selecting the pods and services owned by the named instance.
pub fn offshoot_selectors(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_DATABASE_NAME.to_string(), name.to_string()),
        (LABEL_DATABASE_KIND.to_string(), RESOURCE_KIND_POSTGRES.to_string()),
    ])
}

/// Selector labels plus the instance's own labels and the managed-by marker.
/// Selector keys always win over user labels.
pub fn offshoot_labels(
    name: &str,
    user_labels: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = user_labels
        .iter()
        .filter(|(k, _)| !k.starts_with(GENERIC_KEY))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    out.insert(NAME_LABEL_KEY.into(), "postgres".into());
    out.insert(MANAGED_BY_LABEL_KEY.into(), GENERIC_KEY.into());
    out.extend(offshoot_selectors(name));
    out
}

pub fn snapshot_sa_name(name: &str) -> String {
    format!("{}-snapshot", name)
}

pub fn leader_lock_name(name: &str) -> String {
    format!("{}-leader-lock", name)
}

pub fn governing_service_name(name: &str) -> String {
    format!("{}-pods", name)
}

pub fn auth_secret_name(name: &str) -> String {
    format!("{}-auth", name)
}

/// Object-storage prefix holding the archived WAL segments of an instance.
pub fn wal_data_dir(ns: &str, name: &str, storage: &BackendSpec) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(prefix) = storage.prefix.as_deref() {
        let trimmed = prefix.trim_matches('/');
        if !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }
    parts.extend([DATABASE_NAME_PREFIX, ns, name, "archive"]);
    parts.join("/")
}
