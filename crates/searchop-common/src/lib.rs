//! Common types for searchop: CRDs, errors, versions, hints and events

#![deny(missing_docs)]

pub mod compat;
pub mod crd;
pub mod error;
pub mod events;
pub mod hints;
pub mod kube_utils;
pub mod search_client;
pub mod telemetry;
pub mod version;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every patch the operator issues
pub const FIELD_MANAGER: &str = "searchop-controller";

/// Default deadline for a single request to a managed cluster
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 180;

/// Build version of this operator, the controller version recorded on resources
pub const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");
