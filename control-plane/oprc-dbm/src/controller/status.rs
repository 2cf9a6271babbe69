use crate::crd::postgres::{
    Condition, ConditionStatus, ConditionType, DatabasePhase, Postgres,
    PostgresStatus,
};

fn condition(
    type_: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: Option<String>,
    now: &str,
) -> Condition {
    Condition {
        type_,
        status,
        reason: Some(reason.into()),
        message,
        last_transition_time: Some(now.to_string()),
    }
}

/// Replace the condition of the same type, keeping its transition time when
/// the status did not flip.
fn upsert_condition(conditions: &mut Vec<Condition>, mut next: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == next.type_) {
        Some(cur) => {
            if cur.status == next.status {
                next.last_transition_time = cur.last_transition_time.clone();
            }
            *cur = next;
        }
        None => conditions.push(next),
    }
}

fn with_phase(
    pg: &Postgres,
    phase: DatabasePhase,
    reason: Option<String>,
    cond: Condition,
) -> PostgresStatus {
    let mut status = pg.status.clone().unwrap_or_default();
    status.phase = Some(phase);
    status.reason = reason;
    status.observed_generation = pg.metadata.generation;
    let mut conditions = status.conditions.take().unwrap_or_default();
    upsert_condition(&mut conditions, cond);
    status.conditions = Some(conditions);
    status
}

pub fn running(pg: &Postgres, now: &str) -> PostgresStatus {
    with_phase(
        pg,
        DatabasePhase::Running,
        None,
        condition(
            ConditionType::Available,
            ConditionStatus::True,
            "Provisioned",
            Some("Dependent objects are in place".into()),
            now,
        ),
    )
}

pub fn failed(pg: &Postgres, reason: &str, now: &str) -> PostgresStatus {
    with_phase(
        pg,
        DatabasePhase::Failed,
        Some(reason.to_string()),
        condition(
            ConditionType::Degraded,
            ConditionStatus::True,
            "ProvisionFailed",
            Some(reason.to_string()),
            now,
        ),
    )
}

pub fn terminating(pg: &Postgres, now: &str) -> PostgresStatus {
    with_phase(
        pg,
        DatabasePhase::Terminating,
        None,
        condition(
            ConditionType::Available,
            ConditionStatus::False,
            "Terminating",
            None,
            now,
        ),
    )
}
