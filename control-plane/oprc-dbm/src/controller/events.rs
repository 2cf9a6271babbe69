use std::sync::Mutex;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

use crate::crd::postgres::Postgres;
use crate::store::ObjectKey;

pub const REASON_SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
pub const REASON_FAILED_TO_CREATE: &str = "FailedToCreate";
pub const REASON_FAILED_TO_DELETE: &str = "FailedToDelete";
pub const REASON_SUCCESSFUL_WIPE_OUT: &str = "SuccessfulWipeOut";
pub const REASON_RETRIES_EXHAUSTED: &str = "RetriesExhausted";

pub const NOTE_WAL_NOT_PURGED: &str =
    "archived WAL data was not purged: no storage backend configured";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

impl From<Severity> for EventType {
    fn from(s: Severity) -> Self {
        match s {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        }
    }
}

pub fn build_obj_ref(key: &ObjectKey, uid: Option<&str>) -> ObjectReference {
    ObjectReference {
        api_version: Some("db.oaas.io/v1alpha1".into()),
        kind: Some("Postgres".into()),
        name: Some(key.name.clone()),
        namespace: Some(key.namespace.clone()),
        uid: uid.map(|s| s.to_string()),
        ..Default::default()
    }
}

pub fn obj_ref_of(pg: &Postgres) -> Option<ObjectReference> {
    let key = ObjectKey::of(pg)?;
    Some(build_obj_ref(&key, pg.metadata.uid.as_deref()))
}

/// Sink for events attached to a database instance. Publishing never fails
/// the caller.
#[async_trait::async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        target: &ObjectReference,
        severity: Severity,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: "oprc-dbm".into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        target: &ObjectReference,
        severity: Severity,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let ev = Event {
            type_: severity.into(),
            reason: reason.into(),
            note,
            action: action.into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&ev, target).await {
            warn!(error = %e, reason, "failed to publish event");
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub namespace: String,
    pub name: String,
    pub severity: Severity,
    pub reason: String,
    pub note: Option<String>,
}

/// Keeps published events in memory, in order.
#[derive(Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.reason == reason)
            .collect()
    }
}

#[async_trait::async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn publish(
        &self,
        target: &ObjectReference,
        severity: Severity,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push(RecordedEvent {
                namespace: target.namespace.clone().unwrap_or_default(),
                name: target.name.clone().unwrap_or_default(),
                severity,
                reason: reason.to_string(),
                note,
            });
        }
    }
}
