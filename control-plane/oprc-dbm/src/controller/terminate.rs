use chrono::Utc;
use tracing::{info, instrument};

use super::cleanup::{PollSettings, await_cleanup};
use super::events::{
    NOTE_WAL_NOT_PURGED, REASON_SUCCESSFUL_WIPE_OUT, Severity, obj_ref_of,
};
use super::{ControllerContext, ReconcileErr, status};
use crate::crd::postgres::Postgres;
use crate::store::{ObjectKey, update_status_with_retry};

fn has_wal_storage(pg: &Postgres) -> bool {
    pg.spec
        .archiver
        .as_ref()
        .is_some_and(|a| a.storage.is_some())
}

/// Termination pass: wait for the dependents to go, wipe leftovers when
/// asked to, then archive. Every step is safe to repeat, so a failed pass is
/// simply run again from the top.
#[instrument(skip_all, fields(key = ?ObjectKey::of(pg)))]
pub async fn terminate(
    ctx: &ControllerContext,
    pg: &Postgres,
) -> Result<(), ReconcileErr> {
    let key = ObjectKey::of(pg).ok_or_else(|| {
        ReconcileErr::Unrecoverable("Postgres without namespace/name".into())
    })?;

    let now = Utc::now().to_rfc3339();
    update_status_with_retry(
        ctx.stores.postgres.as_ref(),
        &key,
        ctx.settings.retry,
        |mut cur| {
            cur.status = Some(status::terminating(&cur, &now));
            cur
        },
    )
    .await?;

    await_cleanup(
        &ctx.stores,
        &key,
        PollSettings {
            interval: ctx.settings.poll_interval,
            timeout: ctx.settings.poll_timeout,
        },
    )
    .await?;

    if pg.spec.wipe_out {
        ctx.resolver()
            .wipe_out(
                &key,
                &pg.spec.secrets(),
                Some(&pg.spec),
                ctx.wal.as_ref(),
            )
            .await?;
    }

    let archiver = ctx.archiver();
    archiver.archive(pg).await?;

    if pg.spec.wipe_out {
        archiver.destroy(&key).await?;
        info!("wiped out");
        let note = (has_wal_storage(pg) && !ctx.wal.is_configured())
            .then(|| NOTE_WAL_NOT_PURGED.to_string());
        if let Some(r) = obj_ref_of(pg) {
            ctx.events
                .publish(
                    &r,
                    Severity::Normal,
                    REASON_SUCCESSFUL_WIPE_OUT,
                    "Terminate",
                    note,
                )
                .await;
        }
    }
    Ok(())
}
