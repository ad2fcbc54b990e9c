//! Kubernetes Event recording for searchop controllers.
//!
//! Two layers:
//! - [`EventRecorder`] is the in-memory queue a reconcile pass fills. Nothing
//!   leaves it until the pass is done.
//! - [`EventPublisher`] abstracts `kube::runtime::events::Recorder` so the
//!   queue can be flushed as standard Kubernetes Events.
//!
//! Publishing is **fire-and-forget**: failures are logged as warnings and
//! never propagate. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Recorder, Reporter};
use kube::Client;
use tracing::warn;

pub use kube::runtime::events::EventType;

/// One event queued during a reconcile pass
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Normal or Warning
    pub type_: EventType,
    /// Machine-readable reason (see [`reasons`])
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

impl Event {
    /// Create a Normal event
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Create a Warning event
    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Append-only event queue scoped to one reconcile pass
#[derive(Clone, Debug, Default)]
pub struct EventRecorder {
    events: Vec<Event>,
}

impl EventRecorder {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event
    pub fn add_event(
        &mut self,
        type_: EventType,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.events.push(Event {
            type_,
            reason: reason.into(),
            message: message.into(),
        });
    }

    /// All events queued so far, in enqueue order
    pub fn events(&self) -> Vec<Event> {
        self.events.clone()
    }
}

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "Validation")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "searchop-config-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Publish the events of a finished pass, in the order they were queued.
pub async fn flush_events(
    publisher: &dyn EventPublisher,
    resource_ref: &ObjectReference,
    events: &[Event],
) {
    for event in events {
        publisher
            .publish(
                resource_ref,
                event.type_,
                &event.reason,
                actions::RECONCILE,
                Some(event.message.clone()),
            )
            .await;
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Topology change waits for shards to move off departing nodes
    pub const DELAYED: &str = "Delayed";
    /// Node shutdown is not making progress
    pub const STALLED: &str = "Stalled";
    /// Declared spec is invalid
    pub const VALIDATION: &str = "Validation";
    /// Cluster health or availability degraded
    pub const UNHEALTHY: &str = "Unhealthy";
    /// Referenced cluster could not be resolved
    pub const ASSOCIATION_ERROR: &str = "AssociationError";
    /// Controller-version compatibility could not be decided
    pub const COMPAT_CHECK_ERROR: &str = "CompatibilityCheckError";
    /// A declared configuration operation failed
    pub const OPERATION_FAILED: &str = "OperationFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}
