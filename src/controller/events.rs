//! Kubernetes Event recording
//!
//! Events are an audit trail only. Publishing never fails from the caller's
//! point of view: errors are logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio::sync::Mutex;
use tracing::warn;

use crate::controller::action::ActionContext;
use crate::crd::ManagedResource;

/// Component name reported on every event
pub const REPORTING_COMPONENT: &str = "sigstore-operator";

/// Event severity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Fire-and-forget event sink
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    );
}

/// Record an event about a managed resource
pub async fn record<K: ManagedResource>(
    ctx: &ActionContext,
    obj: &K,
    event_type: EventType,
    reason: &str,
    message: &str,
) {
    ctx.recorder
        .publish(&obj.object_ref(&()), event_type, reason, message)
        .await;
}

/// Publishes core/v1 Events through the API server
pub struct KubeEventRecorder {
    client: Client,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        let namespace = regarding
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!(
                    "{}-",
                    regarding.name.as_deref().unwrap_or("sigstore")
                )),
                ..Default::default()
            },
            type_: Some(event_type.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: regarding.clone(),
            source: Some(EventSource {
                component: Some(REPORTING_COMPONENT.to_string()),
                ..Default::default()
            }),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        if let Err(e) = events.create(&PostParams::default(), &event).await {
            warn!("Failed to publish event {}: {:?}", reason, e);
        }
    }
}

/// An event captured by [`MemoryEventRecorder`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub name: Option<String>,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Keeps published events in memory; used by tests and dry runs
#[derive(Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far
    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        self.events.lock().await.push(RecordedEvent {
            name: regarding.name.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}
