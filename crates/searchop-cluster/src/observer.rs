//! Observations feeding a SearchCluster reconcile pass
//!
//! [`ResourcesState`] is what Kubernetes reports (pods and node-group
//! StatefulSets), [`ObservedState`] is what the cluster itself reports. Both
//! are gathered once at the start of a pass.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::debug;

use searchop_common::kube_utils::{
    is_pod_ready, is_pod_terminating, pod_version, stateful_set_template_version,
};
use searchop_common::search_client::{Method, SearchClient};
use searchop_common::version::{min_version, Version};
use searchop_common::Error;

/// Path of the cluster health API
pub const CLUSTER_HEALTH_PATH: &str = "/_cluster/health";

/// Pods and StatefulSets of one cluster
#[derive(Clone, Debug, Default)]
pub struct ResourcesState {
    /// Pods not being shut down
    pub current_pods: Vec<Pod>,
    /// Every pod, including terminating ones
    pub all_pods: Vec<Pod>,
    /// Node-group StatefulSets
    pub stateful_sets: Vec<StatefulSet>,
}

impl ResourcesState {
    /// Split listed pods into current and all
    pub fn new(pods: Vec<Pod>, stateful_sets: Vec<StatefulSet>) -> Self {
        let current_pods = pods
            .iter()
            .filter(|p| !is_pod_terminating(p))
            .cloned()
            .collect();
        Self {
            current_pods,
            all_pods: pods,
            stateful_sets,
        }
    }

    /// Number of ready pods among the current ones
    pub fn available_nodes(&self) -> i32 {
        available_nodes(&self.current_pods)
    }

    /// StatefulSet with the given name
    pub fn stateful_set(&self, name: &str) -> Option<&StatefulSet> {
        self.stateful_sets.iter().find(|s| s.name_any() == name)
    }

    /// First pod terminating for longer than `threshold`
    pub fn stalled_pod(&self, now: DateTime<Utc>, threshold: Duration) -> Option<&Pod> {
        let threshold = chrono::Duration::from_std(threshold).ok()?;
        self.all_pods.iter().find(|p| {
            p.metadata
                .deletion_timestamp
                .as_ref()
                .map(|t| now.signed_duration_since(t.0) > threshold)
                .unwrap_or(false)
        })
    }

    /// Lowest version label across all pods. Fails on the first malformed label.
    pub fn min_pod_version(&self) -> Result<Option<Version>, Error> {
        min_version(self.all_pods.iter().filter_map(pod_version))
    }

    /// Lowest template version label across StatefulSets. Fails on the first malformed label.
    pub fn min_stateful_set_version(&self) -> Result<Option<Version>, Error> {
        min_version(
            self.stateful_sets
                .iter()
                .filter_map(stateful_set_template_version),
        )
    }
}

/// Count the ready pods in `pods`
pub fn available_nodes(pods: &[Pod]) -> i32 {
    pods.iter().filter(|p| is_pod_ready(p)).count() as i32
}

/// Subset of the cluster health API response
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ClusterHealth {
    /// "green", "yellow" or "red"
    #[serde(default)]
    pub status: String,
}

/// What the cluster reports about itself
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedState {
    /// None when the cluster could not be reached
    pub cluster_health: Option<ClusterHealth>,
}

impl ObservedState {
    /// Observation carrying a health status
    pub fn with_health(status: impl Into<String>) -> Self {
        Self {
            cluster_health: Some(ClusterHealth {
                status: status.into(),
            }),
        }
    }
}

/// Fetch cluster health. Any failure degrades to an empty observation.
pub async fn observe_cluster(client: &dyn SearchClient, timeout: Duration) -> ObservedState {
    let response =
        match tokio::time::timeout(timeout, client.request(Method::GET, CLUSTER_HEALTH_PATH, None))
            .await
        {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                debug!(error = %e, "Cluster health unavailable");
                return ObservedState::default();
            }
            Err(_) => {
                debug!(timeout = ?timeout, "Cluster health request timed out");
                return ObservedState::default();
            }
        };

    if !response.is_success() {
        debug!(status = response.status, "Cluster health request rejected");
        return ObservedState::default();
    }

    match serde_json::from_slice::<ClusterHealth>(&response.body) {
        Ok(health) => ObservedState {
            cluster_health: Some(health),
        },
        Err(e) => {
            debug!(error = %e, "Cluster health response unreadable");
            ObservedState::default()
        }
    }
}
