//! SearchCluster Custom Resource Definition
//!
//! A SearchCluster declares a multi-node search cluster: the version it runs
//! and the node groups (node sets) it is made of. Each node set is backed by
//! one StatefulSet.

use std::collections::HashSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::SearchClusterStatus;
use crate::version::Version;

/// Specification for a SearchCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "searchop.dev",
    version = "v1alpha1",
    kind = "SearchCluster",
    plural = "searchclusters",
    shortname = "sc",
    status = "SearchClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Health","type":"string","jsonPath":".status.health"}"#,
    printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".status.availableNodes"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SearchClusterSpec {
    /// Version of the search engine to run
    pub version: String,

    /// Node groups making up the cluster
    pub node_sets: Vec<NodeSetSpec>,
}

/// One group of identically configured nodes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetSpec {
    /// Name of the node set, unique within the cluster
    pub name: String,

    /// Number of nodes in the set
    pub count: i32,
}

impl SearchClusterSpec {
    /// Total number of declared nodes
    pub fn node_count(&self) -> i32 {
        self.node_sets.iter().map(|ns| ns.count).sum()
    }

    /// Validate version and node sets
    pub fn validate(&self) -> Result<(), crate::Error> {
        Version::parse(&self.version).map_err(|e| {
            crate::Error::validation_for_field(
                crate::error::UNKNOWN_CONTEXT,
                "spec.version",
                e.to_string(),
            )
        })?;

        if self.node_sets.is_empty() {
            return Err(crate::Error::validation_for_field(
                crate::error::UNKNOWN_CONTEXT,
                "spec.nodeSets",
                "at least one node set is required",
            ));
        }

        let mut seen = HashSet::new();
        for (i, ns) in self.node_sets.iter().enumerate() {
            let field = format!("spec.nodeSets[{i}]");
            if ns.name.is_empty() {
                return Err(crate::Error::validation_for_field(
                    crate::error::UNKNOWN_CONTEXT,
                    format!("{field}.name"),
                    "node set name cannot be empty",
                ));
            }
            if !seen.insert(ns.name.as_str()) {
                return Err(crate::Error::validation_for_field(
                    crate::error::UNKNOWN_CONTEXT,
                    format!("{field}.name"),
                    format!("duplicate node set name '{}'", ns.name),
                ));
            }
            if ns.count < 1 {
                return Err(crate::Error::validation_for_field(
                    crate::error::UNKNOWN_CONTEXT,
                    format!("{field}.count"),
                    "node set count must be at least 1",
                ));
            }
        }

        Ok(())
    }
}

/// Name of the StatefulSet backing a node set
pub fn node_set_stateful_set_name(cluster: &str, node_set: &str) -> String {
    format!("{cluster}-search-{node_set}")
}
