//! Per-pass SearchCluster status tracker
//!
//! A [`ReconcileState`] is built from the resource at the start of a pass.
//! The controller moves it between phases with the `mark_*` helpers, then
//! calls [`ReconcileState::apply`] once to learn whether anything must be
//! written back and which events to publish.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{info_span, warn, Span};

use searchop_common::crd::{ClusterPhase, Health, SearchCluster, SearchClusterStatus};
use searchop_common::events::{reasons, Event, EventRecorder, EventType};
use searchop_common::hints::{OrchestrationHints, HINTS_ANNOTATION};
use searchop_common::version::Version;
use searchop_common::Error;

use crate::observer::{available_nodes, ObservedState, ResourcesState};

/// Event message for a topology change waiting on data migration
pub const MIGRATION_DELAY_MESSAGE: &str =
    "Requested topology change delayed by data migration. Ensure index settings allow node removal.";

/// Prefix of the event message for a stalled node shutdown
pub const SHUTDOWN_STALLED_MESSAGE: &str =
    "Requested topology change is stalled. User intervention may be required if this condition persists.";

/// Event message for a degraded status
pub const HEALTH_DEGRADED_MESSAGE: &str = "Search cluster health degraded";

/// Status, hints and events accumulated during one reconcile pass
#[derive(Debug)]
pub struct ReconcileState {
    cluster: SearchCluster,
    status: SearchClusterStatus,
    hints: OrchestrationHints,
    persisted_hints: OrchestrationHints,
    recorder: EventRecorder,
    span: Span,
}

impl ReconcileState {
    /// Start tracking `cluster`. Fails if its hints annotation does not parse.
    pub fn new(cluster: SearchCluster) -> Result<Self, Error> {
        let hints = OrchestrationHints::from_annotations(Some(cluster.annotations()))?;
        let span = info_span!(
            "cluster_state",
            namespace = %cluster.namespace().unwrap_or_default(),
            cluster = %cluster.name_any(),
        );
        Ok(Self {
            status: cluster.status.clone().unwrap_or_default(),
            persisted_hints: hints.clone(),
            hints,
            recorder: EventRecorder::new(),
            span,
            cluster,
        })
    }

    fn update_with_phase(
        &mut self,
        phase: ClusterPhase,
        resources: &ResourcesState,
        observed: &ObservedState,
    ) -> &mut Self {
        self.status.available_nodes = resources.available_nodes();
        self.status.phase = phase;

        if let Some(lowest) = self.min_running_version(resources) {
            self.status.version = lowest.to_string();
        }

        self.status.health = observed
            .cluster_health
            .as_ref()
            .filter(|h| !h.status.is_empty())
            .map(|h| Health::from_observed(&h.status))
            .unwrap_or(Health::Unknown);
        self
    }

    /// Lowest of the pod and StatefulSet versions. A side whose labels do
    /// not parse is logged and left out.
    fn min_running_version(&self, resources: &ResourcesState) -> Option<Version> {
        let _enter = self.span.enter();
        let pods = resources.min_pod_version().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to parse running pods version");
            None
        });
        let sets = resources.min_stateful_set_version().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to parse StatefulSet template version");
            None
        });
        match (pods, sets) {
            (Some(p), Some(s)) => Some(p.min(s)),
            (p, s) => p.or(s),
        }
    }

    /// Refresh observations, keeping the current phase.
    ///
    /// `Invalid` and `NodeShutdownStalled` only hold for the pass that set
    /// them; once their cause is gone the cluster is applying changes.
    pub fn update_state(
        &mut self,
        resources: &ResourcesState,
        observed: &ObservedState,
    ) -> &mut Self {
        match self.status.phase {
            ClusterPhase::Invalid | ClusterPhase::NodeShutdownStalled => {
                self.mark_applying_changes(&resources.current_pods)
            }
            phase => self.update_with_phase(phase, resources, observed),
        }
    }

    /// All declared nodes are available
    pub fn mark_ready(&mut self, resources: &ResourcesState, observed: &ObservedState) -> &mut Self {
        self.update_with_phase(ClusterPhase::Ready, resources, observed)
    }

    /// Changes are being rolled out. Health is forced to red without
    /// consulting the cluster, and the version is left as is.
    pub fn mark_applying_changes(&mut self, pods: &[Pod]) -> &mut Self {
        self.status.available_nodes = available_nodes(pods);
        self.status.phase = ClusterPhase::ApplyingChanges;
        self.status.health = Health::Red;
        self
    }

    /// A topology change waits for data to move off departing nodes
    pub fn mark_migrating_data(
        &mut self,
        resources: &ResourcesState,
        observed: &ObservedState,
    ) -> &mut Self {
        self.recorder
            .add_event(EventType::Normal, reasons::DELAYED, MIGRATION_DELAY_MESSAGE);
        self.update_with_phase(ClusterPhase::MigratingData, resources, observed)
    }

    /// A node shutdown is not making progress
    pub fn mark_shutdown_stalled(
        &mut self,
        resources: &ResourcesState,
        observed: &ObservedState,
        detail: &str,
    ) -> &mut Self {
        self.recorder.add_event(
            EventType::Warning,
            reasons::STALLED,
            format!("{SHUTDOWN_STALLED_MESSAGE} {detail}"),
        );
        self.update_with_phase(ClusterPhase::NodeShutdownStalled, resources, observed)
    }

    /// The declared spec is invalid. Only the phase changes.
    pub fn mark_invalid(&mut self, err: &Error) -> &mut Self {
        self.status.phase = ClusterPhase::Invalid;
        self.recorder
            .add_event(EventType::Warning, reasons::VALIDATION, err.to_string());
        self
    }

    /// Whether the tracked phase is Ready
    pub fn is_ready(&self) -> bool {
        self.status.phase == ClusterPhase::Ready
    }

    /// Merge `incoming` into the hints of this pass
    pub fn update_orchestration_hints(&mut self, incoming: &OrchestrationHints) {
        self.hints = self.hints.merge(incoming);
    }

    /// Hints as maintained in this pass, possibly ahead of the stored ones
    pub fn orchestration_hints(&self) -> &OrchestrationHints {
        &self.hints
    }

    /// In-progress status
    pub fn status(&self) -> &SearchClusterStatus {
        &self.status
    }

    /// Resource as it was loaded, with any status applied so far
    pub fn cluster(&self) -> &SearchCluster {
        &self.cluster
    }

    /// Compare the in-progress status and hints with the stored ones.
    ///
    /// Returns the events of the pass and, if anything changed, the resource
    /// carrying the new status and hints annotation. A degraded status adds
    /// a `Warning/Unhealthy` event. Applying twice without changes in between
    /// yields no update the second time.
    pub fn apply(&mut self) -> (Vec<Event>, Option<SearchCluster>) {
        let previous = self.cluster.status.clone().unwrap_or_default();
        let status_changed = previous != self.status;
        let hints_changed = self.persisted_hints != self.hints;

        if !status_changed && !hints_changed {
            return (self.recorder.events(), None);
        }

        if status_changed && self.status.is_degraded(&previous) {
            self.recorder
                .add_event(EventType::Warning, reasons::UNHEALTHY, HEALTH_DEGRADED_MESSAGE);
        }

        self.cluster.status = Some(self.status.clone());
        if hints_changed {
            match self.hints.to_annotation_value() {
                Ok(value) => {
                    self.cluster
                        .annotations_mut()
                        .insert(HINTS_ANNOTATION.to_string(), value);
                    self.persisted_hints = self.hints.clone();
                }
                Err(e) => {
                    let _enter = self.span.enter();
                    warn!(error = %e, "Failed to serialize orchestration hints");
                }
            }
        }

        (self.recorder.events(), Some(self.cluster.clone()))
    }
}
