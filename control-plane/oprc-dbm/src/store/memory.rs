use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Pod, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;

use super::{
    LabelSet, ObjectKey, ObjectStore, StoreError, StoreObject, StoreResult,
    Stores, WatchEvent, kind_of, matches_labels,
};
use crate::crd::dormant_database::DormantDatabase;
use crate::crd::postgres::Postgres;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Create,
    Patch,
    PatchStatus,
    /// Deletion requested; the object may linger behind finalizers.
    Delete,
    /// Object physically removed.
    Purge,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub op: Op,
    pub kind: String,
    pub key: ObjectKey,
}

/// Ordered record of writes, shared by all stores of a [`MemoryStores`].
#[derive(Clone, Default)]
pub struct Journal(Arc<StdMutex<Vec<JournalEntry>>>);

impl Journal {
    fn record(&self, op: Op, kind: String, key: &ObjectKey) {
        if let Ok(mut entries) = self.0.lock() {
            entries.push(JournalEntry {
                op,
                kind,
                key: key.clone(),
            });
        }
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn with_op(&self, op: Op) -> Vec<JournalEntry> {
        self.entries().into_iter().filter(|e| e.op == op).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.0.lock() {
            entries.clear();
        }
    }
}

struct MemoryState<K> {
    objects: BTreeMap<ObjectKey, K>,
    pending_conflicts: u32,
}

/// In-process object store with API-server semantics: resource versions,
/// merge-patch preconditions, finalizer-gated deletion and a watch feed.
pub struct MemoryStore<K: StoreObject> {
    state: Mutex<MemoryState<K>>,
    events: broadcast::Sender<WatchEvent<K>>,
    journal: Journal,
    versions: Arc<std::sync::atomic::AtomicU64>,
}

impl<K: StoreObject> MemoryStore<K> {
    pub fn new() -> Self {
        Self::with_journal(Journal::default(), Default::default())
    }

    fn with_journal(
        journal: Journal,
        versions: Arc<std::sync::atomic::AtomicU64>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(MemoryState {
                objects: BTreeMap::new(),
                pending_conflicts: 0,
            }),
            events,
            journal,
            versions,
        }
    }

    /// Make the next `n` patches fail with `Conflict`, as if another writer
    /// had won the race.
    pub async fn inject_conflicts(&self, n: u32) {
        self.state.lock().await.pending_conflicts = n;
    }

    pub async fn snapshot(&self) -> Vec<K> {
        self.state.lock().await.objects.values().cloned().collect()
    }

    fn next_version(&self) -> String {
        let v = self
            .versions
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        v.to_string()
    }

    fn not_found(key: &ObjectKey) -> StoreError {
        StoreError::NotFound {
            kind: kind_of::<K>(),
            key: key.to_string(),
        }
    }

    fn conflict(key: &ObjectKey, message: &str) -> StoreError {
        StoreError::Conflict {
            kind: kind_of::<K>(),
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    fn publish(&self, ev: WatchEvent<K>) {
        // No subscribers is fine
        let _ = self.events.send(ev);
    }

    async fn apply_patch(
        &self,
        key: &ObjectKey,
        patch: &Value,
        status_only: bool,
    ) -> StoreResult<K> {
        let mut state = self.state.lock().await;
        let current = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))?;
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(Self::conflict(key, "injected conflict"));
        }
        if let Some(rv) = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            if current.meta().resource_version.as_deref() != Some(rv) {
                return Err(Self::conflict(
                    key,
                    "the object has been modified; please apply your \
                     changes to the latest version",
                ));
            }
        }

        let effective = scope_patch(patch, status_only);
        let spec_touched = effective.get("spec").is_some();
        let mut doc = serde_json::to_value(&current)?;
        json_patch::merge(&mut doc, &effective);
        let mut next: K = serde_json::from_value(doc)?;

        // Server-owned metadata survives any patch
        {
            let (cur, meta) = (current.meta(), next.meta_mut());
            meta.uid = cur.uid.clone();
            meta.creation_timestamp = cur.creation_timestamp.clone();
            meta.deletion_timestamp = cur.deletion_timestamp.clone();
            meta.generation = match (cur.generation, spec_touched) {
                (Some(g), true) => Some(g + 1),
                (g, _) => g,
            };
        }
        next.meta_mut().resource_version = Some(self.next_version());
        let op = if status_only { Op::PatchStatus } else { Op::Patch };
        self.journal.record(op, kind_of::<K>(), key);

        let drained = next.meta().deletion_timestamp.is_some()
            && next.meta().finalizers.as_ref().is_none_or(|f| f.is_empty());
        if drained {
            state.objects.remove(key);
            self.journal.record(Op::Purge, kind_of::<K>(), key);
            self.publish(WatchEvent::Deleted(next.clone()));
        } else {
            state.objects.insert(key.clone(), next.clone());
            self.publish(WatchEvent::Applied(next.clone()));
        }
        Ok(next)
    }
}

impl<K: StoreObject> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Main-resource patches cannot touch status and status patches can only
/// touch status.
fn scope_patch(patch: &Value, status_only: bool) -> Value {
    let Value::Object(map) = patch else {
        return patch.clone();
    };
    let out = map
        .iter()
        .filter(|(k, _)| (k.as_str() == "status") == status_only)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(out)
}

#[async_trait]
impl<K: StoreObject> ObjectStore<K> for MemoryStore<K> {
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> {
        self.state
            .lock()
            .await
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))
    }

    async fn list(
        &self,
        namespace: &str,
        labels: &LabelSet,
    ) -> StoreResult<Vec<K>> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .filter(|(_, o)| matches_labels(o.meta().labels.as_ref(), labels))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        let key = ObjectKey::of(obj).ok_or_else(|| {
            StoreError::Invalid(format!(
                "{} without namespace/name",
                kind_of::<K>()
            ))
        })?;
        let mut state = self.state.lock().await;
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: kind_of::<K>(),
                key: key.to_string(),
            });
        }
        let mut created = obj.clone();
        let version = self.next_version();
        {
            let meta = created.meta_mut();
            let kind = kind_of::<K>().to_lowercase();
            meta.uid = Some(format!("{kind}-{version}"));
            meta.resource_version = Some(version);
            meta.creation_timestamp = Some(Time(Utc::now()));
            meta.deletion_timestamp = None;
            meta.generation = Some(1);
        }
        state.objects.insert(key.clone(), created.clone());
        self.journal.record(Op::Create, kind_of::<K>(), &key);
        self.publish(WatchEvent::Applied(created.clone()));
        Ok(created)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> StoreResult<K> {
        self.apply_patch(key, patch, false).await
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        patch: &Value,
    ) -> StoreResult<K> {
        self.apply_patch(key, patch, true).await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let mut obj = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))?;
        self.journal.record(Op::Delete, kind_of::<K>(), key);
        let has_finalizers =
            obj.meta().finalizers.as_ref().is_some_and(|f| !f.is_empty());
        if has_finalizers {
            if obj.meta().deletion_timestamp.is_none() {
                obj.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
                obj.meta_mut().resource_version = Some(self.next_version());
                state.objects.insert(key.clone(), obj.clone());
                self.publish(WatchEvent::Applied(obj));
            }
            return Ok(());
        }
        state.objects.remove(key);
        self.journal.record(Op::Purge, kind_of::<K>(), key);
        self.publish(WatchEvent::Deleted(obj));
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, StoreResult<WatchEvent<K>>> {
        BroadcastStream::new(self.events.subscribe())
            .map(|res| res.map_err(|e| StoreError::Watch(e.to_string())))
            .boxed()
    }
}

/// A full set of in-memory stores sharing one journal and one version
/// counter, so journal order and resource versions are global.
#[derive(Clone)]
pub struct MemoryStores {
    pub journal: Journal,
    pub postgres: Arc<MemoryStore<Postgres>>,
    pub dormant: Arc<MemoryStore<DormantDatabase>>,
    pub secrets: Arc<MemoryStore<Secret>>,
    pub pods: Arc<MemoryStore<Pod>>,
    pub services: Arc<MemoryStore<Service>>,
    pub service_accounts: Arc<MemoryStore<ServiceAccount>>,
    pub roles: Arc<MemoryStore<Role>>,
    pub role_bindings: Arc<MemoryStore<RoleBinding>>,
    pub leases: Arc<MemoryStore<Lease>>,
}

impl MemoryStores {
    pub fn new() -> Self {
        let journal = Journal::default();
        let versions = Arc::new(std::sync::atomic::AtomicU64::new(0));
        macro_rules! store {
            () => {
                Arc::new(MemoryStore::with_journal(
                    journal.clone(),
                    versions.clone(),
                ))
            };
        }
        Self {
            postgres: store!(),
            dormant: store!(),
            secrets: store!(),
            pods: store!(),
            services: store!(),
            service_accounts: store!(),
            roles: store!(),
            role_bindings: store!(),
            leases: store!(),
            journal,
        }
    }

    pub fn stores(&self) -> Stores {
        Stores {
            postgres: self.postgres.clone(),
            dormant: self.dormant.clone(),
            secrets: self.secrets.clone(),
            pods: self.pods.clone(),
            services: self.services.clone(),
            service_accounts: self.service_accounts.clone(),
            roles: self.roles.clone(),
            role_bindings: self.role_bindings.clone(),
            leases: self.leases.clone(),
        }
    }
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use serde_json::json;

    fn cm(name: &str, finalizers: Option<Vec<String>>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                labels: Some(BTreeMap::from([("app".into(), name.into())])),
                finalizers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_assigns_server_fields_and_rejects_duplicates() {
        let store = MemoryStore::<ConfigMap>::new();
        let created = store.create(&cm("a", None)).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());
        let err = store.create(&cm("a", None)).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::<ConfigMap>::new();
        let created = store.create(&cm("a", None)).await.unwrap();
        let key = ObjectKey::new("ns", "a");
        let rv = created.metadata.resource_version.clone().unwrap();
        let labelled = |x: &str| {
            json!({"metadata": {"resourceVersion": rv, "labels": {"x": x}}})
        };
        store.patch(&key, &labelled("1")).await.unwrap();
        let err = store.patch(&key, &labelled("2")).await.unwrap_err();
        assert!(err.is_conflict());
        let cur = store.get(&key).await.unwrap();
        assert_eq!(
            cur.metadata.labels.unwrap().get("x").map(String::as_str),
            Some("1")
        );
    }

    #[tokio::test]
    async fn finalizers_hold_deletion_until_removed() {
        let store = MemoryStore::<ConfigMap>::new();
        store
            .create(&cm("a", Some(vec!["x/hold".into()])))
            .await
            .unwrap();
        let key = ObjectKey::new("ns", "a");
        store.delete(&key).await.unwrap();
        let held = store.get(&key).await.unwrap();
        assert!(held.metadata.deletion_timestamp.is_some());

        store
            .patch(&key, &json!({"metadata": {"finalizers": null}}))
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_filters_namespace_and_labels() {
        let store = MemoryStore::<ConfigMap>::new();
        store.create(&cm("a", None)).await.unwrap();
        store.create(&cm("b", None)).await.unwrap();
        let mut other = cm("a", None);
        other.metadata.namespace = Some("other".into());
        store.create(&other).await.unwrap();

        let sel = LabelSet::from([("app".to_string(), "a".to_string())]);
        let found = store.list("ns", &sel).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(store.list("ns", &LabelSet::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn watch_sees_writes() {
        let store = MemoryStore::<ConfigMap>::new();
        let mut events = store.watch();
        store.create(&cm("a", None)).await.unwrap();
        store.delete(&ObjectKey::new("ns", "a")).await.unwrap();
        assert!(matches!(events.next().await, Some(Ok(WatchEvent::Applied(_)))));
        assert!(matches!(events.next().await, Some(Ok(WatchEvent::Deleted(_)))));
    }
}
