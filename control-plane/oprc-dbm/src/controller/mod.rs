use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ControllerSettings, DbmConfig};
use crate::crd::postgres::Postgres;
use crate::queue::{Dispatcher, KeyHandler, WorkQueue};
use crate::store::{
    KeyParseError, ObjectKey, ObjectStore, StoreError, Stores, WatchEvent,
    patch_with_retry, update_status_with_retry,
};
use crate::wal::{NoopWalArchive, WalArchive};

pub mod cleanup;
pub mod dormant;
pub mod events;
pub mod finalizer;
pub mod lister;
mod reconcile;
pub mod secrets;
pub mod status;
mod terminate;

use dormant::DormantArchiver;
use events::{
    EventRecorder, KubeEventRecorder, REASON_FAILED_TO_CREATE,
    REASON_FAILED_TO_DELETE, REASON_RETRIES_EXHAUSTED, Severity, obj_ref_of,
};
use finalizer::{Lifecycle, add_finalizer, classify, remove_finalizer};
use lister::ListerCache;
use secrets::{SecretUsageResolver, dormant_selector};

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("timed out after {after:?} waiting for {step} to be deleted")]
    Timeout { step: String, after: Duration },
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
    #[error("gave up after repeated write conflicts: {0}")]
    RetryExhausted(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ReconcileErr {
    fn from(e: StoreError) -> Self {
        match e {
            // The write helpers only surface a conflict once their budget
            // is spent
            StoreError::Conflict { .. } => {
                ReconcileErr::RetryExhausted(e.to_string())
            }
            other => ReconcileErr::Store(other),
        }
    }
}

impl From<KeyParseError> for ReconcileErr {
    fn from(e: KeyParseError) -> Self {
        ReconcileErr::Unrecoverable(e.to_string())
    }
}

/// Everything a reconcile pass needs, shared by all workers.
#[derive(Clone)]
pub struct ControllerContext {
    pub stores: Stores,
    pub settings: ControllerSettings,
    pub lister: ListerCache,
    pub events: Arc<dyn EventRecorder>,
    pub wal: Arc<dyn WalArchive>,
}

impl ControllerContext {
    pub fn new(
        stores: Stores,
        settings: ControllerSettings,
        events: Arc<dyn EventRecorder>,
        wal: Arc<dyn WalArchive>,
    ) -> Self {
        Self {
            stores,
            settings,
            lister: ListerCache::new(),
            events,
            wal,
        }
    }

    pub fn archiver(&self) -> DormantArchiver {
        DormantArchiver::new(self.stores.clone(), self.settings.retry)
    }

    pub fn resolver(&self) -> SecretUsageResolver {
        SecretUsageResolver::new(self.stores.clone(), self.lister.clone())
    }
}

/// Routes each `ns/name` key through the finalizer gate to provisioning or
/// termination.
#[derive(Clone)]
pub struct Controller {
    ctx: Arc<ControllerContext>,
}

impl Controller {
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ControllerContext {
        &self.ctx
    }

    #[instrument(skip(self))]
    pub async fn handle(&self, key: &str) -> Result<(), ReconcileErr> {
        let key: ObjectKey = key.parse()?;
        let Some(pg) = self.ctx.stores.postgres.get_opt(&key).await? else {
            debug!("Postgres no longer exists");
            self.ctx.lister.remove_postgres(&key).await;
            return Ok(());
        };
        self.ctx.lister.upsert_postgres(pg.clone()).await;

        match classify(&pg.metadata) {
            Lifecycle::Provisioning => {
                let (pg, _) = patch_with_retry(
                    self.ctx.stores.postgres.as_ref(),
                    &key,
                    self.ctx.settings.retry,
                    add_finalizer,
                )
                .await?;
                self.reconcile(&pg).await
            }
            Lifecycle::Active => self.reconcile(&pg).await,
            Lifecycle::Terminating => self.finalize(&pg).await,
            Lifecycle::Finalized => Ok(()),
        }
    }

    /// Provisioning pass. On failure the instance is marked failed and a
    /// warning event is published before the error is returned.
    pub async fn reconcile(&self, pg: &Postgres) -> Result<(), ReconcileErr> {
        let Err(err) = reconcile::provision(&self.ctx, pg).await else {
            return Ok(());
        };
        error!(error = %err, "provisioning failed");
        if let Some(r) = obj_ref_of(pg) {
            self.ctx
                .events
                .publish(
                    &r,
                    Severity::Warning,
                    REASON_FAILED_TO_CREATE,
                    "Provision",
                    Some(err.to_string()),
                )
                .await;
        }
        if let Some(key) = ObjectKey::of(pg) {
            let now = Utc::now().to_rfc3339();
            let reason = err.to_string();
            if let Err(e) = update_status_with_retry(
                self.ctx.stores.postgres.as_ref(),
                &key,
                self.ctx.settings.retry,
                |mut cur| {
                    cur.status = Some(status::failed(&cur, &reason, &now));
                    cur
                },
            )
            .await
            {
                warn!(error = %e, "failed to record failure status");
            }
        }
        Err(err)
    }

    /// Termination pass. The finalizer is removed only after every step
    /// succeeded; on error it stays and the pass is retried.
    pub async fn finalize(&self, pg: &Postgres) -> Result<(), ReconcileErr> {
        if let Err(err) = terminate::terminate(&self.ctx, pg).await {
            error!(error = %err, "termination failed");
            if let Some(r) = obj_ref_of(pg) {
                self.ctx
                    .events
                    .publish(
                        &r,
                        Severity::Warning,
                        REASON_FAILED_TO_DELETE,
                        "Terminate",
                        Some(err.to_string()),
                    )
                    .await;
            }
            return Err(err);
        }
        let key = ObjectKey::of(pg).ok_or_else(|| {
            ReconcileErr::Unrecoverable("Postgres without namespace/name".into())
        })?;
        match patch_with_retry(
            self.ctx.stores.postgres.as_ref(),
            &key,
            self.ctx.settings.retry,
            remove_finalizer,
        )
        .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.ctx.lister.remove_postgres(&key).await;
        info!(%key, "finalizer removed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl KeyHandler for Controller {
    type Error = ReconcileErr;

    async fn handle(&self, key: &str) -> Result<(), ReconcileErr> {
        Controller::handle(self, key).await
    }

    async fn on_exhausted(&self, key: &str, err: &ReconcileErr) {
        let Ok(key) = key.parse::<ObjectKey>() else {
            return;
        };
        let Some(pg) = self.ctx.lister.get_postgres(&key).await else {
            return;
        };
        if let Some(r) = obj_ref_of(&pg) {
            self.ctx
                .events
                .publish(
                    &r,
                    Severity::Warning,
                    REASON_RETRIES_EXHAUSTED,
                    "Reconcile",
                    Some(err.to_string()),
                )
                .await;
        }
    }
}

/// Feed Postgres changes into the queue and dormant records into the lister
/// cache until `token` is cancelled.
async fn watch_postgres(
    ctx: Arc<ControllerContext>,
    queue: WorkQueue,
    token: CancellationToken,
) {
    let mut stream = ctx.stores.postgres.watch();
    loop {
        let ev = tokio::select! {
            _ = token.cancelled() => return,
            ev = stream.next() => ev,
        };
        match ev {
            Some(Ok(ev)) => {
                let Some(key) = ObjectKey::of(ev.object()) else { continue };
                match ev {
                    WatchEvent::Applied(pg) => {
                        ctx.lister.upsert_postgres(pg).await
                    }
                    WatchEvent::Deleted(_) => {
                        ctx.lister.remove_postgres(&key).await
                    }
                }
                queue.add(key.to_string());
            }
            Some(Err(e)) => warn!(error = %e, "Postgres watch error"),
            None => {
                warn!("Postgres watch ended");
                return;
            }
        }
    }
}

async fn watch_dormant(ctx: Arc<ControllerContext>, token: CancellationToken) {
    let mut stream = ctx.stores.dormant.watch();
    let selector = dormant_selector();
    loop {
        let ev = tokio::select! {
            _ = token.cancelled() => return,
            ev = stream.next() => ev,
        };
        match ev {
            Some(Ok(WatchEvent::Applied(dd))) => {
                let labels = dd.metadata.labels.as_ref();
                if crate::store::matches_labels(labels, &selector) {
                    ctx.lister.upsert_dormant(dd).await;
                }
            }
            Some(Ok(WatchEvent::Deleted(dd))) => {
                if let Some(key) = ObjectKey::of(&dd) {
                    ctx.lister.remove_dormant(&key).await;
                }
            }
            Some(Err(e)) => warn!(error = %e, "DormantDatabase watch error"),
            None => {
                warn!("DormantDatabase watch ended");
                return;
            }
        }
    }
}

/// Periodic full relist of the lister cache; every cached Postgres is
/// enqueued again so failures that ran out of requeues get another chance.
async fn resync_loop(
    ctx: Arc<ControllerContext>,
    queue: WorkQueue,
    namespace: Option<String>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(ctx.settings.lister_resync);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let namespaces = match &namespace {
            Some(ns) => vec![ns.clone()],
            None => ctx.lister.namespaces().await,
        };
        for ns in namespaces {
            let resynced = ctx
                .lister
                .resync_namespace(&ctx.stores, &ns, &dormant_selector())
                .await;
            if let Err(e) = resynced {
                warn!(namespace = %ns, error = %e, "lister resync failed");
                continue;
            }
            for pg in ctx.lister.postgres_in(&ns).await {
                if let Some(key) = ObjectKey::of(&pg) {
                    queue.add(key.to_string());
                }
            }
        }
    }
}

/// Run the watch feeds, the resync loop and the worker pool until `token`
/// is cancelled.
pub async fn run(
    ctx: Arc<ControllerContext>,
    namespace: Option<String>,
    token: CancellationToken,
) {
    let queue =
        WorkQueue::new(ctx.settings.requeue_base, ctx.settings.requeue_max);
    let controller = Arc::new(Controller::new(ctx.clone()));
    let dispatcher = Dispatcher::new(
        queue.clone(),
        controller,
        ctx.settings.workers,
        ctx.settings.max_requeues,
    );

    let feeds = vec![
        tokio::spawn(watch_postgres(ctx.clone(), queue.clone(), token.clone())),
        tokio::spawn(watch_dormant(ctx.clone(), token.clone())),
        tokio::spawn(resync_loop(
            ctx.clone(),
            queue.clone(),
            namespace,
            token.clone(),
        )),
    ];
    let stop = {
        let queue = queue.clone();
        let token = token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            queue.shutdown();
        })
    };

    dispatcher.run().await;
    for f in feeds {
        f.abort();
    }
    stop.abort();
    info!("controller stopped");
}

pub async fn run_controller(
    client: Client,
    cfg: DbmConfig,
) -> anyhow::Result<()> {
    let namespace = cfg.watch_namespace.clone();
    let stores = Stores::kube(client.clone(), namespace.as_deref());
    let ctx = Arc::new(ControllerContext::new(
        stores,
        cfg.controller_settings(),
        Arc::new(KubeEventRecorder::new(client)),
        Arc::new(NoopWalArchive),
    ));
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        shutdown.cancel();
    });
    run(ctx, namespace, token).await;
    Ok(())
}
