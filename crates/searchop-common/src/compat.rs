//! Controller-version compatibility
//!
//! Every resource reconciled by searchop records the build version of the
//! controller that last reconciled it. A controller only takes over a
//! resource if its own version is the recorded one or a valid upgrade of it,
//! so an older operator left running during a rollout never fights a newer one.

use crate::version::{is_valid_upgrade_path, Version};
use crate::Error;

/// Outcome of a compatibility check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compatibility {
    /// The recorded version matches this controller
    Compatible,
    /// Compatible, and the recorded version must be updated to this controller's
    Stamp,
    /// The resource belongs to a controller this one must not override
    Incompatible {
        /// Version recorded on the resource
        recorded: String,
    },
}

impl Compatibility {
    /// Whether reconciliation may proceed
    pub fn may_reconcile(&self) -> bool {
        !matches!(self, Compatibility::Incompatible { .. })
    }
}

/// Decide whether the controller at `current` may reconcile a resource that
/// records `recorded` as its controller version.
pub fn check_compatibility(recorded: Option<&str>, current: &str) -> Result<Compatibility, Error> {
    let current_version = Version::parse(current)?;
    let recorded = match recorded.map(str::trim) {
        None | Some("") => return Ok(Compatibility::Stamp),
        Some(r) => r,
    };
    let recorded_version = Version::parse(recorded)?;

    if recorded_version == current_version {
        return Ok(Compatibility::Compatible);
    }
    if is_valid_upgrade_path(&recorded_version, &current_version) {
        return Ok(Compatibility::Stamp);
    }
    Ok(Compatibility::Incompatible {
        recorded: recorded.to_string(),
    })
}
