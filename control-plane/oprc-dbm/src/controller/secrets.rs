use std::collections::BTreeSet;

use tracing::{info, instrument};

use super::ReconcileErr;
use super::lister::ListerCache;
use crate::crd::dormant_database::DormantDatabase;
use crate::crd::postgres::{Postgres, PostgresSpec, wal_data_dir};
use crate::crd::{
    GENERIC_KEY, LABEL_DATABASE_KIND, MANAGED_BY_LABEL_KEY,
    RESOURCE_KIND_POSTGRES,
};
use crate::store::{LabelSet, ObjectKey, ObjectStore, Stores};
use crate::wal::WalArchive;

pub fn dormant_selector() -> LabelSet {
    LabelSet::from([(
        LABEL_DATABASE_KIND.to_string(),
        RESOURCE_KIND_POSTGRES.to_string(),
    )])
}

fn is_postgres_dormant(dd: &DormantDatabase) -> bool {
    dd.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_DATABASE_KIND))
        .is_some_and(|k| k == RESOURCE_KIND_POSTGRES)
}

/// Secrets referenced by any live instance or Postgres dormant record in the
/// slices, other than the one named `exclude`.
fn referenced_by_peers(
    pgs: &[Postgres],
    dormant: &[DormantDatabase],
    exclude: &ObjectKey,
) -> BTreeSet<String> {
    let live = pgs
        .iter()
        .filter(|p| p.metadata.name.as_deref() != Some(exclude.name.as_str()))
        .flat_map(|p| p.spec.secrets());
    let archived = dormant
        .iter()
        .filter(|d| is_postgres_dormant(d))
        .filter(|d| d.metadata.name.as_deref() != Some(exclude.name.as_str()))
        .flat_map(|d| d.database_secrets());
    live.chain(archived).collect()
}

/// Decides which secrets of a terminated instance nobody needs anymore.
#[derive(Clone)]
pub struct SecretUsageResolver {
    stores: Stores,
    lister: ListerCache,
}

impl SecretUsageResolver {
    pub fn new(stores: Stores, lister: ListerCache) -> Self {
        Self { stores, lister }
    }

    /// Peer references as seen by the lister cache.
    pub async fn secrets_used_by_peers(
        &self,
        exclude: &ObjectKey,
    ) -> BTreeSet<String> {
        let ns = exclude.namespace.as_str();
        let pgs = self.lister.postgres_in(ns).await;
        let dds = self.lister.dormant_in(ns).await;
        referenced_by_peers(&pgs, &dds, exclude)
    }

    /// Peer references read straight from the store.
    async fn secrets_used_by_peers_fresh(
        &self,
        exclude: &ObjectKey,
    ) -> Result<BTreeSet<String>, ReconcileErr> {
        let ns = exclude.namespace.as_str();
        let pgs = self.stores.postgres.list(ns, &LabelSet::new()).await?;
        let dds = self.stores.dormant.list(ns, &dormant_selector()).await?;
        Ok(referenced_by_peers(&pgs, &dds, exclude))
    }

    /// Candidates no peer references that exist and carry the managed-by
    /// label. Secrets without it belong to the user and are never returned.
    pub async fn unused_secrets(
        &self,
        candidates: &[String],
        exclude: &ObjectKey,
    ) -> Result<BTreeSet<String>, ReconcileErr> {
        let used = self.secrets_used_by_peers(exclude).await;
        let mut out = BTreeSet::new();
        for name in candidates.iter().filter(|c| !used.contains(*c)) {
            let key = ObjectKey::new(exclude.namespace.clone(), name.clone());
            let Some(secret) = self.stores.secrets.get_opt(&key).await? else {
                continue;
            };
            let managed = secret
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(MANAGED_BY_LABEL_KEY))
                .is_some_and(|v| v == GENERIC_KEY);
            if managed {
                out.insert(name.clone());
            }
        }
        Ok(out)
    }

    /// Delete the unused managed secrets among `secrets`, then purge the
    /// archived WAL data of `origin`. Every deletion is preceded by a fresh
    /// store read so a peer the cache has not seen yet still protects its
    /// secrets.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn wipe_out(
        &self,
        key: &ObjectKey,
        secrets: &[String],
        origin: Option<&PostgresSpec>,
        wal: &dyn WalArchive,
    ) -> Result<(), ReconcileErr> {
        let unused = self.unused_secrets(secrets, key).await?;
        if !unused.is_empty() {
            let confirmed = self.secrets_used_by_peers_fresh(key).await?;
            for name in unused.iter().filter(|s| !confirmed.contains(*s)) {
                info!(secret = %name, "deleting unused secret");
                self.stores
                    .secrets
                    .delete_if_exists(&ObjectKey::new(
                        key.namespace.clone(),
                        name.clone(),
                    ))
                    .await?;
            }
        }

        let storage = origin
            .and_then(|s| s.archiver.as_ref())
            .and_then(|a| a.storage.as_ref());
        if let Some(storage) = storage {
            let prefix = wal_data_dir(&key.namespace, &key.name, storage);
            wal.purge(storage, &prefix)
                .await
                .map_err(|e| ReconcileErr::Internal(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::crd::dormant_database::{DormantDatabaseSpec, Origin, OriginSpec};
    use crate::crd::postgres::{ArchiverSpec, BackendSpec, SecretRef};
    use crate::store::MemoryStores;
    use crate::wal::MemoryWalArchive;

    fn spec(secret: &str) -> PostgresSpec {
        PostgresSpec {
            version: "16".into(),
            database_secret: Some(SecretRef {
                secret_name: secret.into(),
            }),
            ..Default::default()
        }
    }

    fn pg(name: &str, secret: Option<&str>) -> Postgres {
        let mut pg = Postgres::new(
            name,
            secret.map(spec).unwrap_or_else(|| PostgresSpec {
                version: "16".into(),
                ..Default::default()
            }),
        );
        pg.metadata.namespace = Some("ns".into());
        pg
    }

    fn dormant(name: &str, secret: &str) -> DormantDatabase {
        let mut dd = DormantDatabase::new(
            name,
            DormantDatabaseSpec {
                origin: Origin {
                    spec: OriginSpec {
                        postgres: Some(spec(secret)),
                    },
                    ..Default::default()
                },
                wipe_out: false,
            },
        );
        dd.metadata.namespace = Some("ns".into());
        dd.metadata.labels = Some(dormant_selector());
        dd
    }

    fn secret(name: &str, managed: bool) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                labels: managed.then(|| {
                    BTreeMap::from([(
                        MANAGED_BY_LABEL_KEY.to_string(),
                        GENERIC_KEY.to_string(),
                    )])
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn setup() -> (MemoryStores, ListerCache, SecretUsageResolver) {
        let mem = MemoryStores::new();
        let lister = ListerCache::new();
        let resolver = SecretUsageResolver::new(mem.stores(), lister.clone());
        (mem, lister, resolver)
    }

    #[tokio::test]
    async fn secret_held_by_live_peer_is_retained_until_peer_goes() {
        let (mem, lister, resolver) = setup().await;
        mem.secrets.create(&secret("s", true)).await.unwrap();
        lister.upsert_postgres(pg("a", Some("s"))).await;
        lister.upsert_postgres(pg("b", None)).await;
        let b = ObjectKey::new("ns", "b");

        let unused = resolver.unused_secrets(&["s".into()], &b).await.unwrap();
        assert!(unused.is_empty());

        lister.remove_postgres(&ObjectKey::new("ns", "a")).await;
        let unused = resolver.unused_secrets(&["s".into()], &b).await.unwrap();
        assert_eq!(unused, BTreeSet::from(["s".to_string()]));
    }

    #[tokio::test]
    async fn dormant_record_keeps_secret_alive() {
        let (mem, lister, resolver) = setup().await;
        mem.secrets.create(&secret("s", true)).await.unwrap();
        lister.upsert_dormant(dormant("old", "s")).await;
        let unused = resolver
            .unused_secrets(&["s".into()], &ObjectKey::new("ns", "pg1"))
            .await
            .unwrap();
        assert!(unused.is_empty());
        // The record of the instance being cleaned does not count
        let unused = resolver
            .unused_secrets(&["s".into()], &ObjectKey::new("ns", "old"))
            .await
            .unwrap();
        assert_eq!(unused.len(), 1);
    }

    #[tokio::test]
    async fn user_supplied_and_missing_secrets_are_never_candidates() {
        let (mem, _lister, resolver) = setup().await;
        mem.secrets.create(&secret("mine", false)).await.unwrap();
        let candidates = ["mine".to_string(), "ghost".to_string()];
        let unused = resolver
            .unused_secrets(&candidates, &ObjectKey::new("ns", "pg1"))
            .await
            .unwrap();
        assert!(unused.is_empty());
    }

    #[tokio::test]
    async fn wipe_out_rechecks_store_before_deleting() {
        let (mem, _lister, resolver) = setup().await;
        mem.secrets.create(&secret("s", true)).await.unwrap();
        mem.secrets.create(&secret("t", true)).await.unwrap();
        // pg2 exists in the store but the cache has not caught up
        mem.postgres.create(&pg("pg2", Some("s"))).await.unwrap();

        let wal = MemoryWalArchive::default();
        let origin = PostgresSpec {
            archiver: Some(ArchiverSpec {
                storage: Some(BackendSpec {
                    storage_secret_name: Some("t".into()),
                    bucket: "wal".into(),
                    prefix: None,
                }),
            }),
            ..spec("s")
        };
        resolver
            .wipe_out(
                &ObjectKey::new("ns", "pg1"),
                &origin.secrets(),
                Some(&origin),
                &wal,
            )
            .await
            .unwrap();

        let left: Vec<_> = mem
            .secrets
            .snapshot()
            .await
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect();
        assert_eq!(left, vec!["s".to_string()]);
        assert_eq!(wal.purged(), vec!["wal/dbm/ns/pg1/archive".to_string()]);
    }
}
