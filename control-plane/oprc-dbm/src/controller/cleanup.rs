use std::fmt;
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::ReconcileErr;
use crate::crd::postgres::{
    leader_lock_name, offshoot_selectors, snapshot_sa_name,
};
use crate::store::{LabelSet, ObjectKey, ObjectStore, StoreObject, Stores};

/// Kinds of objects an instance owns, in no particular order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependentClass {
    Pods,
    Services,
    Role,
    RoleBinding,
    ServiceAccount,
    SnapshotServiceAccount,
    LeaderLease,
}

impl fmt::Display for DependentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DependentClass::Pods => "pods",
            DependentClass::Services => "services",
            DependentClass::Role => "role",
            DependentClass::RoleBinding => "role-binding",
            DependentClass::ServiceAccount => "service-account",
            DependentClass::SnapshotServiceAccount => "snapshot-service-account",
            DependentClass::LeaderLease => "leader-lease",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    Labels(LabelSet),
    Named(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanupStep {
    pub class: DependentClass,
    pub selection: Selection,
}

/// Dependents of an instance in the order they must disappear. Pods go
/// first so nothing still running references the services, and the RBAC
/// objects and service accounts outlive the pods' grace period.
pub fn cleanup_plan(key: &ObjectKey) -> Vec<CleanupStep> {
    let name = &key.name;
    let step = |class, selection| CleanupStep { class, selection };
    vec![
        step(DependentClass::Pods, Selection::Labels(offshoot_selectors(name))),
        step(
            DependentClass::Services,
            Selection::Labels(offshoot_selectors(name)),
        ),
        step(DependentClass::Role, Selection::Named(name.clone())),
        step(DependentClass::RoleBinding, Selection::Named(name.clone())),
        step(DependentClass::ServiceAccount, Selection::Named(name.clone())),
        step(
            DependentClass::SnapshotServiceAccount,
            Selection::Named(snapshot_sa_name(name)),
        ),
        step(
            DependentClass::LeaderLease,
            Selection::Named(leader_lock_name(name)),
        ),
    ]
}

#[derive(Clone, Copy, Debug)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Delete every dependent of `key` and wait for each class to be gone
/// before touching the next. Safe to call again after a partial run.
#[instrument(skip_all, fields(key = %key))]
pub async fn await_cleanup(
    stores: &Stores,
    key: &ObjectKey,
    poll: PollSettings,
) -> Result<(), ReconcileErr> {
    for step in cleanup_plan(key) {
        let ns = key.namespace.as_str();
        match step.class {
            DependentClass::Pods => {
                delete_and_await(stores.pods.as_ref(), ns, &step, poll).await?
            }
            DependentClass::Services => {
                delete_and_await(stores.services.as_ref(), ns, &step, poll).await?
            }
            DependentClass::Role => {
                delete_and_await(stores.roles.as_ref(), ns, &step, poll).await?
            }
            DependentClass::RoleBinding => {
                delete_and_await(stores.role_bindings.as_ref(), ns, &step, poll)
                    .await?
            }
            DependentClass::ServiceAccount
            | DependentClass::SnapshotServiceAccount => {
                let sa = stores.service_accounts.as_ref();
                delete_and_await(sa, ns, &step, poll).await?
            }
            DependentClass::LeaderLease => {
                delete_and_await(stores.leases.as_ref(), ns, &step, poll).await?
            }
        }
        debug!(class = %step.class, "dependents gone");
    }
    info!("all dependents removed");
    Ok(())
}

async fn remaining<K: StoreObject>(
    store: &dyn ObjectStore<K>,
    ns: &str,
    selection: &Selection,
) -> Result<Vec<ObjectKey>, ReconcileErr> {
    let keys = match selection {
        Selection::Labels(labels) => store
            .list(ns, labels)
            .await?
            .iter()
            .filter_map(ObjectKey::of)
            .collect(),
        Selection::Named(name) => {
            let key = ObjectKey::new(ns, name.clone());
            match store.get_opt(&key).await? {
                Some(_) => vec![key],
                None => vec![],
            }
        }
    };
    Ok(keys)
}

async fn delete_and_await<K: StoreObject>(
    store: &dyn ObjectStore<K>,
    ns: &str,
    step: &CleanupStep,
    poll: PollSettings,
) -> Result<(), ReconcileErr> {
    for key in remaining(store, ns, &step.selection).await? {
        store.delete_if_exists(&key).await?;
    }
    let wait = async {
        loop {
            let left = remaining(store, ns, &step.selection).await?;
            if left.is_empty() {
                return Ok::<_, ReconcileErr>(());
            }
            debug!(
                class = %step.class,
                left = left.len(),
                "waiting for dependents to go away"
            );
            tokio::time::sleep(poll.interval).await;
        }
    };
    match tokio::time::timeout(poll.timeout, wait).await {
        Ok(res) => res,
        Err(_) => Err(ReconcileErr::Timeout {
            step: step.class.to_string(),
            after: poll.timeout,
        }),
    }
}
