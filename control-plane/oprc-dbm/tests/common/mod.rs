#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::ObjectMeta;
use oprc_dbm::config::{ControllerSettings, RetryPolicy};
use oprc_dbm::controller::events::MemoryEventRecorder;
use oprc_dbm::controller::{Controller, ControllerContext, ReconcileErr};
use oprc_dbm::crd::postgres::{
    Postgres, PostgresSpec, SecretRef, leader_lock_name, offshoot_selectors,
};
use oprc_dbm::crd::{GENERIC_KEY, MANAGED_BY_LABEL_KEY};
use oprc_dbm::store::{MemoryStores, ObjectKey, ObjectStore};
use oprc_dbm::wal::MemoryWalArchive;

// DNS-1123 safe numeric suffix for unique names
pub const DIGITS: [char; 10] =
    ['0', '1', '2', '3', '4', '5', '6', '7', '8', '9'];
pub fn uniq(prefix: &str) -> String {
    format!("{prefix}-{}", nanoid::nanoid!(6, &DIGITS))
}

pub const NS: &str = "ns";

pub fn fast_settings() -> ControllerSettings {
    ControllerSettings {
        workers: 2,
        max_requeues: 3,
        requeue_base: Duration::from_millis(5),
        requeue_max: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
        poll_timeout: Duration::from_millis(100),
        retry: RetryPolicy {
            interval: Duration::from_millis(1),
            attempts: 10,
        },
        lister_resync: Duration::from_millis(50),
    }
}

/// Controller wired to in-memory stores, event recorder and WAL archive.
pub struct Harness {
    pub mem: MemoryStores,
    pub events: Arc<MemoryEventRecorder>,
    pub wal: Arc<MemoryWalArchive>,
    pub ctx: Arc<ControllerContext>,
    pub controller: Controller,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: ControllerSettings) -> Self {
        let mem = MemoryStores::new();
        let events = Arc::new(MemoryEventRecorder::new());
        let wal = Arc::new(MemoryWalArchive::default());
        let ctx = Arc::new(ControllerContext::new(
            mem.stores(),
            settings,
            events.clone(),
            wal.clone(),
        ));
        let controller = Controller::new(ctx.clone());
        Self {
            mem,
            events,
            wal,
            ctx,
            controller,
        }
    }

    pub async fn create_pg(&self, pg: &Postgres) -> Postgres {
        self.mem.postgres.create(pg).await.expect("create Postgres")
    }

    pub async fn get_pg(&self, name: &str) -> Option<Postgres> {
        self.mem
            .postgres
            .get_opt(&ObjectKey::new(NS, name))
            .await
            .expect("get Postgres")
    }

    pub async fn delete_pg(&self, name: &str) {
        self.mem
            .postgres
            .delete(&ObjectKey::new(NS, name))
            .await
            .expect("delete Postgres");
    }

    pub async fn handle(&self, name: &str) -> Result<(), ReconcileErr> {
        self.controller.handle(&format!("{NS}/{name}")).await
    }

    /// Pods and the leader lease are made by the workload, not by
    /// provisioning; seed them so termination has something to remove.
    pub async fn seed_workload(&self, name: &str, replicas: usize) {
        for i in 0..replicas {
            self.mem
                .pods
                .create(&Pod {
                    metadata: meta(
                        &format!("{name}-{i}"),
                        Some(offshoot_selectors(name)),
                    ),
                    ..Default::default()
                })
                .await
                .expect("create pod");
        }
        self.mem
            .leases
            .create(&Lease {
                metadata: meta(&leader_lock_name(name), None),
                ..Default::default()
            })
            .await
            .expect("create lease");
    }

    pub async fn secret_names(&self) -> Vec<String> {
        self.mem
            .secrets
            .snapshot()
            .await
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect()
    }
}

pub fn meta(name: &str, labels: Option<BTreeMap<String, String>>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(NS.into()),
        labels,
        ..Default::default()
    }
}

pub fn postgres(name: &str, secret: Option<&str>, wipe_out: bool) -> Postgres {
    let mut pg = Postgres::new(
        name,
        PostgresSpec {
            version: "16.2".into(),
            replicas: Some(1),
            database_secret: secret.map(|s| SecretRef {
                secret_name: s.into(),
            }),
            wipe_out,
            ..Default::default()
        },
    );
    pg.metadata.namespace = Some(NS.into());
    pg
}

pub fn managed_secret(name: &str) -> Secret {
    Secret {
        metadata: meta(
            name,
            Some(BTreeMap::from([(
                MANAGED_BY_LABEL_KEY.to_string(),
                GENERIC_KEY.to_string(),
            )])),
        ),
        ..Default::default()
    }
}

pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
