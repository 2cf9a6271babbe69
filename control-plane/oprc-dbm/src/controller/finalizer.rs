use kube::api::ObjectMeta;

pub const FINALIZER: &str = "db.oaas.io/finalizer";

/// Where an instance stands with respect to the finalizer gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Live, marker not yet added.
    Provisioning,
    /// Live, marker present.
    Active,
    /// Deletion requested, marker present: cleanup must run.
    Terminating,
    /// Deletion requested, marker gone: nothing left to do.
    Finalized,
}

pub fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == FINALIZER))
}

pub fn classify(meta: &ObjectMeta) -> Lifecycle {
    match (meta.deletion_timestamp.is_some(), has_finalizer(meta)) {
        (false, false) => Lifecycle::Provisioning,
        (false, true) => Lifecycle::Active,
        (true, true) => Lifecycle::Terminating,
        (true, false) => Lifecycle::Finalized,
    }
}

/// Transform adding the marker; other finalizers are left alone.
pub fn add_finalizer<K: kube::Resource>(mut obj: K) -> K {
    if !has_finalizer(obj.meta()) {
        obj.meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(FINALIZER.to_string());
    }
    obj
}

/// Transform removing the marker; other finalizers are left alone.
pub fn remove_finalizer<K: kube::Resource>(mut obj: K) -> K {
    let meta = obj.meta_mut();
    if let Some(f) = meta.finalizers.as_mut() {
        f.retain(|x| x != FINALIZER);
        if f.is_empty() {
            meta.finalizers = None;
        }
    }
    obj
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;
    use crate::crd::postgres::{Postgres, PostgresSpec};

    fn meta(deleting: bool, finalizers: &[&str]) -> ObjectMeta {
        ObjectMeta {
            deletion_timestamp: deleting.then(|| Time(chrono::Utc::now())),
            finalizers: (!finalizers.is_empty())
                .then(|| finalizers.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn classify_covers_all_states() {
        assert_eq!(classify(&meta(false, &[])), Lifecycle::Provisioning);
        assert_eq!(classify(&meta(false, &[FINALIZER])), Lifecycle::Active);
        assert_eq!(classify(&meta(true, &[FINALIZER])), Lifecycle::Terminating);
        assert_eq!(classify(&meta(true, &["other/x"])), Lifecycle::Finalized);
    }

    #[test]
    fn transforms_are_idempotent_and_keep_foreign_markers() {
        let mut pg = Postgres::new("pg1", PostgresSpec::default());
        pg.metadata.finalizers = Some(vec!["other/x".into()]);
        let pg = add_finalizer(add_finalizer(pg));
        assert_eq!(
            pg.metadata.finalizers.as_deref(),
            Some(&["other/x".to_string(), FINALIZER.to_string()][..])
        );
        let pg = remove_finalizer(remove_finalizer(pg));
        assert_eq!(pg.metadata.finalizers, Some(vec!["other/x".to_string()]));
        let pg = remove_finalizer(add_finalizer(Postgres::new(
            "pg2",
            PostgresSpec::default(),
        )));
        assert_eq!(pg.metadata.finalizers, None);
    }
}
