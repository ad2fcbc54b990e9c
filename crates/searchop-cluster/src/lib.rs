//! SearchCluster status tracking and reconciliation
//!
//! - [`observer`] gathers pods, node-group StatefulSets and cluster health
//! - [`state`] is the per-pass status tracker
//! - [`controller`] drives both from a kube-rs `Controller`

#![deny(missing_docs)]

pub mod controller;
pub mod observer;
pub mod state;

pub use controller::{error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl};

pub use searchop_common::{Error, Result};
pub use state::ReconcileState;
