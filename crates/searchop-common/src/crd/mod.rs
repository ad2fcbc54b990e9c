//! Custom Resource Definitions for searchop
//!
//! This module contains all CRD definitions used by the searchop operator.

mod cluster;
mod config;
mod types;

pub use cluster::{node_set_stateful_set_name, NodeSetSpec, SearchCluster, SearchClusterSpec};
pub use config::{
    ClusterRef, ConfigOperation, ConfigPhase, SearchConfig, SearchConfigSpec, SearchConfigStatus,
};
pub use types::{ClusterPhase, Health, SearchClusterStatus};
