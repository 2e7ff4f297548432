use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, Recorder, Reporter};
use tracing::info;

// Audit event reason codes.
pub const REASON_SCALING_UP: &str = "ScalingUp";
pub const REASON_SCALING_DOWN: &str = "ScalingDown";
pub const REASON_DECOMMISSIONING: &str = "Decommissioning";
pub const REASON_CREATED_RESOURCE: &str = "CreatedResource";
pub const REASON_UNHEALTHY: &str = "Unhealthy";
pub const REASON_DELETING_STUCK_POD: &str = "DeletingStuckPod";
pub const REASON_RECONCILE_FAILED: &str = "ReconcileFailed";

/// Capability to publish audit events about an entity. The reconciliation
/// context only talks to this, so tests can capture events in memory.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(
        &self,
        event: Event,
        reference: &ObjectReference,
    ) -> anyhow::Result<()>;
}

/// Sink backed by the cluster's event API.
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: "memcached-operator".into(),
            instance: None,
        };
        KubeEventSink {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(
        &self,
        event: Event,
        reference: &ObjectReference,
    ) -> anyhow::Result<()> {
        self.recorder.publish(&event, reference).await?;
        Ok(())
    }
}

/// Decorator that writes every emitted event to the structured log before
/// delegating to the wrapped sink.
pub struct LoggingRecorder {
    inner: Arc<dyn EventSink>,
}

impl LoggingRecorder {
    pub fn new(inner: Arc<dyn EventSink>) -> Self {
        LoggingRecorder { inner }
    }
}

#[async_trait]
impl EventSink for LoggingRecorder {
    async fn publish(
        &self,
        event: Event,
        reference: &ObjectReference,
    ) -> anyhow::Result<()> {
        info!(
            reason = %event.reason,
            action = %event.action,
            event_type = ?event.type_,
            note = event.note.as_deref().unwrap_or(""),
            object = reference.name.as_deref().unwrap_or(""),
            "event"
        );
        self.inner.publish(event, reference).await
    }
}

pub fn build_obj_ref(
    ns: &str,
    name: &str,
    uid: Option<&str>,
) -> ObjectReference {
    ObjectReference {
        api_version: Some("cache.mko.io/v1".into()),
        kind: Some("Memcached".into()),
        namespace: Some(ns.into()),
        name: Some(name.into()),
        uid: uid.map(Into::into),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::runtime::events::EventType;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        reasons: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventSink for MemorySink {
        async fn publish(
            &self,
            event: Event,
            _reference: &ObjectReference,
        ) -> anyhow::Result<()> {
            self.reasons.lock().unwrap().push(event.reason);
            Ok(())
        }
    }

    #[tokio::test]
    async fn logging_recorder_delegates_to_inner_sink() {
        let sink = Arc::new(MemorySink::default());
        let recorder = LoggingRecorder::new(sink.clone());
        recorder
            .publish(
                Event {
                    type_: EventType::Normal,
                    reason: REASON_CREATED_RESOURCE.into(),
                    note: Some("Created Deployment cache-a".into()),
                    action: "Create".into(),
                    secondary: None,
                },
                &build_obj_ref("default", "cache-a", None),
            )
            .await
            .unwrap();
        assert_eq!(
            sink.reasons.lock().unwrap().as_slice(),
            [REASON_CREATED_RESOURCE.to_string()]
        );
    }

    #[test]
    fn object_reference_identifies_the_entity() {
        let r = build_obj_ref("default", "cache-a", Some("uid-1"));
        assert_eq!(r.api_version.as_deref(), Some("cache.mko.io/v1"));
        assert_eq!(r.kind.as_deref(), Some("Memcached"));
        assert_eq!(r.name.as_deref(), Some("cache-a"));
        assert_eq!(r.uid.as_deref(), Some("uid-1"));
    }
}
