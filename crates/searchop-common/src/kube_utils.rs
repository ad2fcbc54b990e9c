//! Shared Kubernetes helpers for searchop controllers
//!
//! Label and annotation conventions, pod readiness, version labels and the
//! status/annotation merge patches both controllers apply.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::warn;

use crate::Error;

/// Label carrying the owning cluster name on pods and StatefulSets
pub const LABEL_CLUSTER_NAME: &str = "searchop.dev/cluster-name";
/// Label carrying the search engine version a pod or template runs
pub const LABEL_VERSION: &str = "searchop.dev/version";
/// Label carrying the node set a pod or StatefulSet belongs to
pub const LABEL_NODE_SET: &str = "searchop.dev/node-set";

/// Annotation that pauses reconciliation when set to "false"
pub const ANNOTATION_MANAGED: &str = "searchop.dev/managed";
/// Annotation recording the build version of the last reconciling controller
pub const ANNOTATION_CONTROLLER_VERSION: &str = "searchop.dev/controller-version";

// Kubernetes condition constants
/// The "Ready" pod condition type
pub const CONDITION_READY: &str = "Ready";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Whether the resource opted out of reconciliation
pub fn is_unmanaged(annotations: Option<&BTreeMap<String, String>>) -> bool {
    annotations
        .and_then(|a| a.get(ANNOTATION_MANAGED))
        .map(|v| v.trim().eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

/// Controller version recorded on a resource, if any
pub fn recorded_controller_version(annotations: Option<&BTreeMap<String, String>>) -> Option<&str> {
    annotations
        .and_then(|a| a.get(ANNOTATION_CONTROLLER_VERSION))
        .map(String::as_str)
}

/// Label selector matching every object of a cluster
pub fn cluster_selector(cluster: &str) -> String {
    format!("{LABEL_CLUSTER_NAME}={cluster}")
}

/// Whether a pod is running with its Ready condition true
pub fn is_pod_ready(pod: &Pod) -> bool {
    if is_pod_terminating(pod) {
        return false;
    }
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_ref()
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == CONDITION_READY && c.status == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Whether a pod has been asked to shut down
pub fn is_pod_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Version label of a pod
pub fn pod_version(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_VERSION))
        .map(String::as_str)
}

/// Version label of a StatefulSet's pod template
pub fn stateful_set_template_version(sts: &StatefulSet) -> Option<&str> {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.as_ref())
        .and_then(|l| l.get(LABEL_VERSION))
        .map(String::as_str)
}

/// Patch the status sub-resource of a namespaced resource with a merge patch.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Merge annotations into a namespaced resource's metadata.
pub async fn patch_resource_annotations<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    annotations: &BTreeMap<String, String>,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Read one key of a Secret. A missing Secret or key yields `None`.
pub async fn get_secret_data(
    client: &Client,
    name: &str,
    namespace: &str,
    key: &str,
) -> Result<Option<Vec<u8>>, Error> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = match secrets.get_opt(name).await {
        Ok(Some(s)) => s,
        Ok(None) => return Ok(None),
        Err(e) => {
            warn!(secret = %name, namespace = %namespace, error = %e, "Failed to read secret");
            return Err(e.into());
        }
    };
    Ok(secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.clone()))
}
