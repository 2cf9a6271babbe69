use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::crd::dormant_database::DormantDatabase;
use crate::crd::postgres::Postgres;
use crate::store::{LabelSet, ObjectKey, ObjectStore, StoreResult, Stores};

/// Read-side snapshot of every `Postgres` and `DormantDatabase` the operator
/// has seen, keyed by `ns/name`.
///
/// Refreshed from watch events and a periodic full relist, so a read can lag
/// the store. Callers that act destructively on what they read here must
/// confirm against the store first.
#[derive(Clone, Default)]
pub struct ListerCache {
    postgres: Arc<RwLock<HashMap<ObjectKey, Postgres>>>,
    dormant: Arc<RwLock<HashMap<ObjectKey, DormantDatabase>>>,
}

impl ListerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_postgres(&self, pg: Postgres) {
        if let Some(key) = ObjectKey::of(&pg) {
            self.postgres.write().await.insert(key, pg);
        }
    }

    pub async fn remove_postgres(&self, key: &ObjectKey) {
        self.postgres.write().await.remove(key);
    }

    pub async fn upsert_dormant(&self, dd: DormantDatabase) {
        if let Some(key) = ObjectKey::of(&dd) {
            self.dormant.write().await.insert(key, dd);
        }
    }

    pub async fn remove_dormant(&self, key: &ObjectKey) {
        self.dormant.write().await.remove(key);
    }

    pub async fn get_postgres(&self, key: &ObjectKey) -> Option<Postgres> {
        self.postgres.read().await.get(key).cloned()
    }

    pub async fn postgres_in(&self, namespace: &str) -> Vec<Postgres> {
        let r = self.postgres.read().await;
        r.iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub async fn dormant_in(&self, namespace: &str) -> Vec<DormantDatabase> {
        let r = self.dormant.read().await;
        r.iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Replace the snapshot of one namespace with a fresh list from the
    /// store.
    pub async fn resync_namespace(
        &self,
        stores: &Stores,
        namespace: &str,
        dormant_selector: &LabelSet,
    ) -> StoreResult<()> {
        let pgs = stores.postgres.list(namespace, &LabelSet::new()).await?;
        let dds = stores.dormant.list(namespace, dormant_selector).await?;
        {
            let mut w = self.postgres.write().await;
            w.retain(|k, _| k.namespace != namespace);
            w.extend(
                pgs.into_iter()
                    .filter_map(|p| ObjectKey::of(&p).map(|k| (k, p))),
            );
        }
        {
            let mut w = self.dormant.write().await;
            w.retain(|k, _| k.namespace != namespace);
            w.extend(
                dds.into_iter()
                    .filter_map(|d| ObjectKey::of(&d).map(|k| (k, d))),
            );
        }
        debug!(%namespace, "lister cache resynced");
        Ok(())
    }

    /// Namespaces currently holding at least one cached object.
    pub async fn namespaces(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .postgres
            .read()
            .await
            .keys()
            .map(|k| k.namespace.clone())
            .chain(self.dormant.read().await.keys().map(|k| k.namespace.clone()))
            .collect();
        out.sort();
        out.dedup();
        out
    }
}
