//! SearchConfig Custom Resource Definition
//!
//! A SearchConfig declares REST-addressable settings (index templates,
//! lifecycle policies, cluster settings...) that must exist on a referenced
//! SearchCluster. Each operation names an API path and the JSON body that
//! path must at least contain.

use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::UNKNOWN_CONTEXT;
use crate::Error;

/// Base used to check that operation URLs resolve to a path on the cluster
const VALIDATION_BASE_URL: &str = "https://cluster.invalid:9200";

/// Specification for a SearchConfig
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "searchop.dev",
    version = "v1alpha1",
    kind = "SearchConfig",
    plural = "searchconfigs",
    shortname = "scfg",
    status = "SearchConfigStatus",
    namespaced,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterRef.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Applied","type":"integer","jsonPath":".status.appliedOperations"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SearchConfigSpec {
    /// Cluster the operations are applied to
    pub cluster_ref: ClusterRef,

    /// Operations, applied in order
    #[serde(default)]
    pub operations: Vec<ConfigOperation>,
}

/// Reference to a SearchCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRef {
    /// Name of the SearchCluster
    pub name: String,

    /// Namespace of the SearchCluster, defaults to the SearchConfig's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ClusterRef {
    /// Namespace to look the cluster up in
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

/// One declared setting: the body `url` must at least contain
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOperation {
    /// API path on the cluster, e.g. `/_ilm/policy/logs`
    pub url: String,

    /// Desired JSON body. Empty means `{}`.
    #[serde(default)]
    pub body: String,
}

impl ConfigOperation {
    /// Desired body as JSON
    pub fn desired_json(&self) -> Result<serde_json::Value, Error> {
        if self.body.trim().is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        serde_json::from_str(&self.body).map_err(|e| {
            Error::serialization_for_kind(
                "ConfigOperation",
                format!("invalid body for {}: {e}", self.url),
            )
        })
    }

    /// Desired body as bytes to send with a write
    pub fn desired_bytes(&self) -> Vec<u8> {
        if self.body.trim().is_empty() {
            b"{}".to_vec()
        } else {
            self.body.as_bytes().to_vec()
        }
    }
}

impl SearchConfigSpec {
    /// Validate the declared cluster reference and operations
    pub fn validate(&self) -> Result<(), Error> {
        if self.cluster_ref.name.trim().is_empty() {
            return Err(Error::validation_for_field(
                UNKNOWN_CONTEXT,
                "spec.clusterRef.name",
                "cluster reference name cannot be empty",
            ));
        }

        let base = Url::parse(VALIDATION_BASE_URL)
            .map_err(|e| Error::internal_with_context("validate", e.to_string()))?;

        for (i, op) in self.operations.iter().enumerate() {
            let field = format!("spec.operations[{i}]");
            if !op.url.starts_with('/') {
                return Err(Error::validation_for_field(
                    UNKNOWN_CONTEXT,
                    format!("{field}.url"),
                    format!("url '{}' must be an absolute path", op.url),
                ));
            }
            if let Err(e) = base.join(&op.url) {
                return Err(Error::validation_for_field(
                    UNKNOWN_CONTEXT,
                    format!("{field}.url"),
                    format!("url '{}' does not parse: {e}", op.url),
                ));
            }
            if let Err(e) = op.desired_json() {
                return Err(Error::validation_for_field(
                    UNKNOWN_CONTEXT,
                    format!("{field}.body"),
                    e.to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Lifecycle phase of a SearchConfig
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConfigPhase {
    /// Not reconciled yet
    #[default]
    Pending,
    /// Every operation converged
    Applied,
    /// Declared operations are invalid
    Invalid,
    /// An operation failed, will be retried
    Failed,
}

impl fmt::Display for ConfigPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Applied => write!(f, "Applied"),
            Self::Invalid => write!(f, "Invalid"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status for a SearchConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchConfigStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ConfigPhase,

    /// Human-readable detail for the phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Number of operations converged in the last successful pass
    #[serde(default)]
    pub applied_operations: u32,

    /// Generation the status was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn spec_with(ops: Vec<ConfigOperation>) -> SearchConfigSpec {
        SearchConfigSpec {
            cluster_ref: ClusterRef {
                name: "logs".to_string(),
                namespace: None,
            },
            operations: ops,
        }
    }

    fn op(url: &str, body: &str) -> ConfigOperation {
        ConfigOperation {
            url: url.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn valid_spec_passes() {
        let spec = spec_with(vec![
            op("/_ilm/policy/logs", r#"{"policy":{"phases":{}}}"#),
            op("/_cluster/settings", ""),
        ]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn empty_cluster_name_fails() {
        let mut spec = spec_with(vec![]);
        spec.cluster_ref.name = " ".to_string();
        assert!(matches!(
            spec.validate(),
            Err(Error::Validation { field: Some(f), .. }) if f == "spec.clusterRef.name"
        ));
    }

    #[rstest]
    #[case::relative("_ilm/policy/logs")]
    #[case::absolute_url("https://elsewhere:9200/_ilm")]
    #[case::empty("")]
    fn non_path_urls_fail(#[case] url: &str) {
        let err = spec_with(vec![op(url, "{}")]).validate().unwrap_err();
        assert!(err.to_string().contains("absolute path"));
    }

    #[test]
    fn invalid_json_body_fails() {
        let err = spec_with(vec![op("/_template/a", "{not json")])
            .validate()
            .unwrap_err();
        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.operations[0].body"))
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn empty_body_is_empty_object() {
        let o = op("/_cluster/settings", "  ");
        assert_eq!(o.desired_json().unwrap(), serde_json::json!({}));
        assert_eq!(o.desired_bytes(), b"{}".to_vec());
    }

    #[test]
    fn cluster_ref_defaults_to_local_namespace() {
        let r = ClusterRef {
            name: "logs".to_string(),
            namespace: None,
        };
        assert_eq!(r.namespace_or("team-a"), "team-a");
        let r = ClusterRef {
            name: "logs".to_string(),
            namespace: Some("shared".to_string()),
        };
        assert_eq!(r.namespace_or("team-a"), "shared");
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = SearchConfigStatus {
            phase: ConfigPhase::Applied,
            message: None,
            applied_operations: 2,
            observed_generation: Some(4),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Applied");
        assert_eq!(json["appliedOperations"], 2);
        assert_eq!(json["observedGeneration"], 4);
        assert!(json.get("message").is_none());
    }
}
