//! Typed access to cluster objects.
//!
//! Everything the controller reads or writes goes through [`ObjectStore`].
//! [`KubeStore`] talks to the API server; [`MemoryStore`] keeps objects in
//! process with the same optimistic-concurrency and finalizer rules, which is
//! what the tests and local runs use.

mod kube_store;
mod memory;
mod update;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use serde::{Serialize, de::DeserializeOwned};

use crate::crd::dormant_database::DormantDatabase;
use crate::crd::postgres::Postgres;

pub use self::kube_store::KubeStore;
pub use self::memory::{Journal, JournalEntry, MemoryStore, MemoryStores, Op};
pub use self::update::{
    Verb, create_merge_patch, patch_with_retry, update_status_with_retry,
};

/// Equality-based label selector; empty selects everything.
pub type LabelSet = BTreeMap<String, String>;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },
    #[error("conflict writing {kind} {key}: {message}")]
    Conflict {
        kind: String,
        key: String,
        message: String,
    },
    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("watch error: {0}")]
    Watch(String),
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

/// Namespace + name identity of a namespaced object. Renders as `ns/name`,
/// which is also the work-queue key format.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<K: ::kube::Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("malformed object key {0:?}; expected <namespace>/<name>")]
pub struct KeyParseError(pub String);

impl FromStr for ObjectKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name))
                if !ns.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(ns, name))
            }
            _ => Err(KeyParseError(s.to_string())),
        }
    }
}

/// Bound shared by every kind the stores can hold.
pub trait StoreObject:
    ::kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Serialize
    + DeserializeOwned
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
}

impl<T> StoreObject for T where
    T: ::kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + fmt::Debug
        + Send
        + Sync
        + 'static
{
}

pub fn kind_of<K: StoreObject>() -> String {
    K::kind(&()).to_string()
}

#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Applied(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

#[async_trait]
pub trait ObjectStore<K: StoreObject>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<K>;

    async fn list(&self, namespace: &str, labels: &LabelSet)
    -> StoreResult<Vec<K>>;

    /// Fails with `AlreadyExists` when the identity is taken.
    async fn create(&self, obj: &K) -> StoreResult<K>;

    /// JSON merge patch. A `metadata.resourceVersion` inside the patch is a
    /// precondition: a stale one fails with `Conflict`.
    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> StoreResult<K>;

    /// Same as [`ObjectStore::patch`] against the status subresource.
    async fn patch_status(
        &self,
        key: &ObjectKey,
        patch: &serde_json::Value,
    ) -> StoreResult<K>;

    /// Requests deletion. Objects carrying finalizers only get a deletion
    /// timestamp and stay visible until the last finalizer is removed.
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;

    fn watch(&self) -> BoxStream<'static, StoreResult<WatchEvent<K>>>;

    async fn get_opt(&self, key: &ObjectKey) -> StoreResult<Option<K>> {
        match self.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete that treats an already absent object as success.
    async fn delete_if_exists(&self, key: &ObjectKey) -> StoreResult<()> {
        match self.delete(key).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }
}

/// One handle per kind the controller touches.
#[derive(Clone)]
pub struct Stores {
    pub postgres: Arc<dyn ObjectStore<Postgres>>,
    pub dormant: Arc<dyn ObjectStore<DormantDatabase>>,
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    pub pods: Arc<dyn ObjectStore<Pod>>,
    pub services: Arc<dyn ObjectStore<Service>>,
    pub service_accounts: Arc<dyn ObjectStore<ServiceAccount>>,
    pub roles: Arc<dyn ObjectStore<Role>>,
    pub role_bindings: Arc<dyn ObjectStore<RoleBinding>>,
    pub leases: Arc<dyn ObjectStore<Lease>>,
}

impl Stores {
    pub fn kube(client: ::kube::Client, watch_namespace: Option<&str>) -> Self {
        let ns = watch_namespace.map(str::to_string);
        Self {
            postgres: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            dormant: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            secrets: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            pods: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            services: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            service_accounts: Arc::new(KubeStore::new(
                client.clone(),
                ns.clone(),
            )),
            roles: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            role_bindings: Arc::new(KubeStore::new(client.clone(), ns.clone())),
            leases: Arc::new(KubeStore::new(client, ns)),
        }
    }
}

pub fn label_selector(labels: &LabelSet) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn matches_labels(
    have: Option<&BTreeMap<String, String>>,
    want: &LabelSet,
) -> bool {
    want.iter().all(|(k, v)| have.and_then(|h| h.get(k)) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrips_through_display() {
        let key: ObjectKey = "ns/pg1".parse().unwrap();
        assert_eq!(key, ObjectKey::new("ns", "pg1"));
        assert_eq!(key.to_string(), "ns/pg1");
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for bad in ["", "pg1", "/pg1", "ns/", "ns/a/b"] {
            assert!(bad.parse::<ObjectKey>().is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn selector_is_sorted_and_comma_joined() {
        let labels = LabelSet::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "a=1,b=2");
        assert!(matches_labels(Some(&labels), &LabelSet::new()));
        assert!(!matches_labels(None, &labels));
    }
}
