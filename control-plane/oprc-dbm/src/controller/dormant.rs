use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use tracing::{info, instrument};

use super::ReconcileErr;
use crate::config::RetryPolicy;
use crate::crd::dormant_database::{
    DormantDatabase, DormantDatabaseSpec, Origin, OriginMeta, OriginSpec,
};
use crate::crd::postgres::Postgres;
use crate::crd::{LABEL_DATABASE_KIND, RESOURCE_KIND_POSTGRES};
use crate::store::{ObjectKey, ObjectStore, Stores, patch_with_retry};

/// Turns terminated instances into dormant records and keeps stale records
/// from shadowing a live instance of the same identity.
#[derive(Clone)]
pub struct DormantArchiver {
    stores: Stores,
    retry: RetryPolicy,
}

impl DormantArchiver {
    pub fn new(stores: Stores, retry: RetryPolicy) -> Self {
        Self { stores, retry }
    }

    /// Remove the record of `key`, if any. Its wipe flag is cleared first so
    /// nothing acting on the record's deletion purges data the new instance
    /// may still use.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn delete_matching(
        &self,
        key: &ObjectKey,
    ) -> Result<(), ReconcileErr> {
        if self.stores.dormant.get_opt(key).await?.is_none() {
            return Ok(());
        }
        let res = patch_with_retry(
            self.stores.dormant.as_ref(),
            key,
            self.retry,
            |mut dd| {
                dd.spec.wipe_out = false;
                dd
            },
        )
        .await;
        match res {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.stores.dormant.delete_if_exists(key).await?;
        info!("deleted stale dormant record");
        Ok(())
    }

    /// Record `pg` as dormant. Fails without writing when the instance
    /// cannot be referenced.
    #[instrument(skip_all, fields(key = ?ObjectKey::of(pg)))]
    pub async fn archive(
        &self,
        pg: &Postgres,
    ) -> Result<DormantDatabase, ReconcileErr> {
        let record = dormant_record_for(pg)?;
        let key = ObjectKey::of(&record).ok_or_else(|| {
            ReconcileErr::Unrecoverable("dormant record without identity".into())
        })?;
        self.delete_matching(&key).await?;
        let created = self.stores.dormant.create(&record).await?;
        info!("archived to dormant record");
        Ok(created)
    }

    pub async fn destroy(&self, key: &ObjectKey) -> Result<(), ReconcileErr> {
        self.stores.dormant.delete_if_exists(key).await?;
        Ok(())
    }
}

/// The dormant record for `pg`: spec, labels, annotations and creation time
/// copied verbatim.
pub fn dormant_record_for(
    pg: &Postgres,
) -> Result<DormantDatabase, ReconcileErr> {
    let meta = &pg.metadata;
    let (Some(name), Some(namespace), Some(_uid)) =
        (meta.name.as_ref(), meta.namespace.as_ref(), meta.uid.as_ref())
    else {
        return Err(ReconcileErr::Unrecoverable(format!(
            "cannot reference Postgres {:?}/{:?}: \
             name, namespace and uid are required",
            meta.namespace, meta.name
        )));
    };
    Ok(DormantDatabase {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(BTreeMap::from([(
                LABEL_DATABASE_KIND.to_string(),
                RESOURCE_KIND_POSTGRES.to_string(),
            )])),
            ..Default::default()
        },
        spec: DormantDatabaseSpec {
            origin: Origin {
                metadata: OriginMeta {
                    name: name.clone(),
                    namespace: namespace.clone(),
                    labels: meta.labels.clone().unwrap_or_default(),
                    annotations: meta.annotations.clone().unwrap_or_default(),
                    creation_timestamp: meta
                        .creation_timestamp
                        .as_ref()
                        .map(|t| t.0.to_rfc3339()),
                },
                spec: OriginSpec {
                    postgres: Some(pg.spec.clone()),
                },
            },
            wipe_out: pg.spec.wipe_out,
        },
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crd::postgres::PostgresSpec;
    use crate::store::{MemoryStores, Op};

    fn retry() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(1),
            attempts: 5,
        }
    }

    fn pg_spec() -> PostgresSpec {
        PostgresSpec {
            version: "16".into(),
            replicas: Some(3),
            wipe_out: true,
            ..Default::default()
        }
    }

    async fn stored_pg(mem: &MemoryStores) -> Postgres {
        let mut pg = Postgres::new("pg1", pg_spec());
        pg.metadata.namespace = Some("ns".into());
        pg.metadata.labels =
            Some(BTreeMap::from([("team".into(), "a".into())]));
        pg.metadata.annotations =
            Some(BTreeMap::from([("note".into(), "x".into())]));
        mem.postgres.create(&pg).await.unwrap()
    }

    #[tokio::test]
    async fn archive_copies_origin_verbatim() {
        let mem = MemoryStores::new();
        let archiver = DormantArchiver::new(mem.stores(), retry());
        let pg = stored_pg(&mem).await;

        let dd = archiver.archive(&pg).await.unwrap();
        let origin = &dd.spec.origin;
        assert_eq!(origin.metadata.name, "pg1");
        let meta = &origin.metadata;
        assert_eq!(meta.labels.get("team").map(String::as_str), Some("a"));
        assert_eq!(meta.annotations.get("note").map(String::as_str), Some("x"));
        assert!(origin.metadata.creation_timestamp.is_some());
        assert_eq!(origin.spec.postgres.as_ref(), Some(&pg.spec));
        assert!(dd.spec.wipe_out);
    }

    #[tokio::test]
    async fn archive_replaces_stale_record() {
        let mem = MemoryStores::new();
        let archiver = DormantArchiver::new(mem.stores(), retry());
        let pg = stored_pg(&mem).await;
        archiver.archive(&pg).await.unwrap();
        mem.journal.clear();

        archiver.archive(&pg).await.unwrap();
        let ops: Vec<_> = mem
            .journal
            .entries()
            .into_iter()
            .filter(|e| e.kind == "DormantDatabase")
            .map(|e| e.op)
            .collect();
        assert_eq!(ops, vec![Op::Patch, Op::Delete, Op::Purge, Op::Create]);
        assert_eq!(mem.dormant.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn unreferenceable_instance_fails_loudly() {
        let mem = MemoryStores::new();
        let archiver = DormantArchiver::new(mem.stores(), retry());
        let mut pg = Postgres::new("pg1", pg_spec());
        pg.metadata.namespace = Some("ns".into());

        let err = archiver.archive(&pg).await.unwrap_err();
        assert!(matches!(err, ReconcileErr::Unrecoverable(_)));
        assert!(mem.journal.entries().is_empty());
    }

    #[tokio::test]
    async fn delete_matching_without_record_is_noop() {
        let mem = MemoryStores::new();
        let archiver = DormantArchiver::new(mem.stores(), retry());
        archiver
            .delete_matching(&ObjectKey::new("ns", "pg1"))
            .await
            .unwrap();
        archiver.destroy(&ObjectKey::new("ns", "pg1")).await.unwrap();
        assert!(mem.journal.entries().is_empty());
    }
}
