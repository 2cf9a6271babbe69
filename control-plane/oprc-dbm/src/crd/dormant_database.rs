use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::postgres::PostgresSpec;

/// Archival snapshot of a decommissioned database. Keyed by the identity of
/// the database it was taken from.
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
    kind = "DormantDatabase",
    plural = "dormantdatabases",
    shortname = "drmn",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseSpec {
    pub origin: Origin,
    /// Purge leftover secrets and archived data of the origin
    #[serde(default)]
    pub wipe_out: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub metadata: OriginMeta,
    pub spec: OriginSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OriginMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// RFC 3339 creation time of the origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OriginSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresSpec>,
}

impl DormantDatabase {
    pub fn database_secrets(&self) -> Vec<String> {
        self.spec
            .origin
            .spec
            .postgres
            .as_ref()
            .map(|s| s.secrets())
            .unwrap_or_default()
    }
}
