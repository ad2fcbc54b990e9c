//! Orchestration hints
//!
//! Hints are facts about a cluster that cannot be re-derived from the current
//! observation alone (for example "a rolling upgrade was started"). They live
//! as a flat JSON object under a single annotation on the resource, are loaded
//! at the start of a reconcile pass and written back with that pass's update.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Annotation holding the serialized hints
pub const HINTS_ANNOTATION: &str = "searchop.dev/orchestration-hints";

/// Version the cluster was first reconciled at. Set once.
pub const CREATED_AT_VERSION: &str = "createdAtVersion";

/// A version change is being rolled out across node groups
pub const ROLLING_UPGRADE_IN_PROGRESS: &str = "rollingUpgradeInProgress";

/// Named facts persisted across reconcile passes
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrchestrationHints(BTreeMap<String, Value>);

impl OrchestrationHints {
    /// Load hints from resource annotations.
    ///
    /// A missing or empty annotation yields empty hints.
    pub fn from_annotations(annotations: Option<&BTreeMap<String, String>>) -> Result<Self, Error> {
        let raw = match annotations.and_then(|a| a.get(HINTS_ANNOTATION)) {
            Some(raw) if !raw.trim().is_empty() => raw,
            _ => return Ok(Self::default()),
        };
        serde_json::from_str(raw).map_err(|e| {
            Error::serialization_for_kind(
                HINTS_ANNOTATION,
                format!("failed to parse orchestration hints: {e}"),
            )
        })
    }

    /// Serialize into the annotation value
    pub fn to_annotation_value(&self) -> Result<String, Error> {
        serde_json::to_string(&self.0).map_err(|e| {
            Error::serialization_for_kind(
                HINTS_ANNOTATION,
                format!("failed to serialize orchestration hints: {e}"),
            )
        })
    }

    /// Combine with `incoming`: same-named hints are overwritten, unrelated
    /// existing hints are kept.
    pub fn merge(&self, incoming: &OrchestrationHints) -> OrchestrationHints {
        let mut merged = self.0.clone();
        merged.extend(incoming.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        OrchestrationHints(merged)
    }

    /// Set a hint, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Set a hint only if it has never been set. Returns true if it was inserted.
    pub fn set_once(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if self.0.contains_key(&key) {
            return false;
        }
        self.0.insert(key, value.into());
        true
    }

    /// Raw value of a hint
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Boolean hint, false when absent or not a boolean
    pub fn flag(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// String hint
    pub fn string(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Number of hints
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no hints are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for OrchestrationHints {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        OrchestrationHints(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
