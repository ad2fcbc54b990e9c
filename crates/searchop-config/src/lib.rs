//! SearchConfig convergence
//!
//! [`diff`] decides whether an observed document already satisfies a
//! declared one, [`converge`] applies declared operations against a cluster
//! and [`controller`] runs that for every SearchConfig resource.

#![deny(missing_docs)]

pub mod controller;
pub mod converge;
pub mod diff;

pub use controller::{error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl};
pub use converge::{ConfigConverger, ConvergeReport};

pub use searchop_common::{Error, Result};
