//! Shared status types for searchop CRDs

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a SearchCluster
///
/// Exactly one phase is active at a time. Only the status tracker moves a
/// cluster between phases.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Topology or version changes are being rolled out
    #[default]
    ApplyingChanges,
    /// A topology change waits for data to move off departing nodes
    MigratingData,
    /// All declared nodes are available
    Ready,
    /// A node shutdown is not making progress
    NodeShutdownStalled,
    /// The declared spec is invalid
    Invalid,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApplyingChanges => write!(f, "ApplyingChanges"),
            Self::MigratingData => write!(f, "MigratingData"),
            Self::Ready => write!(f, "Ready"),
            Self::NodeShutdownStalled => write!(f, "NodeShutdownStalled"),
            Self::Invalid => write!(f, "Invalid"),
        }
    }
}

/// Aggregate health reported by the cluster itself
///
/// Variants are declared worst first so the derived order is
/// `Red < Yellow < Unknown < Green`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// At least one primary shard is unassigned
    Red,
    /// All primaries assigned, some replicas are not
    Yellow,
    /// No observation available
    #[default]
    Unknown,
    /// All shards assigned
    Green,
}

impl Health {
    /// Parse the status string of a cluster health response.
    ///
    /// Empty or unrecognized values map to `Unknown`.
    pub fn from_observed(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "red" => Self::Red,
            "yellow" => Self::Yellow,
            "green" => Self::Green,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Red => write!(f, "red"),
            Self::Yellow => write!(f, "yellow"),
            Self::Unknown => write!(f, "unknown"),
            Self::Green => write!(f, "green"),
        }
    }
}

/// Status for a SearchCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchClusterStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Health reported by the cluster
    #[serde(default)]
    pub health: Health,

    /// Number of ready nodes
    #[serde(default)]
    pub available_nodes: i32,

    /// Lowest version running or about to run in the cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl SearchClusterStatus {
    /// Whether this status is a degradation of `previous`.
    ///
    /// Fewer available nodes is always a degradation. Lower health is one
    /// too, except while applying changes: that phase forces `Red` without
    /// the cluster having reported it.
    pub fn is_degraded(&self, previous: &SearchClusterStatus) -> bool {
        if self.available_nodes < previous.available_nodes {
            return true;
        }
        self.phase != ClusterPhase::ApplyingChanges && self.health < previous.health
    }
}
