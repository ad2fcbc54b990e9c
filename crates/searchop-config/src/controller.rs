//! SearchConfig controller
//!
//! Makes the settings a SearchConfig declares exist on the SearchCluster it
//! references, writing only what is missing or different.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use searchop_common::compat::{check_compatibility, Compatibility};
use searchop_common::crd::{ConfigPhase, SearchCluster, SearchConfig, SearchConfigStatus};
use searchop_common::events::{actions, reasons, EventPublisher, EventType, KubeEventPublisher};
use searchop_common::kube_utils::{
    is_unmanaged, patch_resource_annotations, patch_resource_status, recorded_controller_version,
    ANNOTATION_CONTROLLER_VERSION,
};
use searchop_common::search_client::{ClusterClientFactory, KubeClusterClientFactory};
use searchop_common::{Error, DEFAULT_REQUEST_TIMEOUT_SECS, FIELD_MANAGER, OPERATOR_VERSION};

use crate::converge::ConfigConverger;

/// Name reported on published events
pub const CONTROLLER_NAME: &str = "searchop-config-controller";

/// Requeue interval after a retryable error
pub const REQUEUE_ERROR_SECS: u64 = 5;

/// Trait abstracting Kubernetes client operations for SearchConfig
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a SearchConfig by name
    async fn get_config(&self, name: &str, namespace: &str) -> Result<Option<SearchConfig>, Error>;

    /// Get the SearchCluster a config references
    async fn get_cluster(&self, name: &str, namespace: &str)
        -> Result<Option<SearchCluster>, Error>;

    /// Patch the status of a SearchConfig
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &SearchConfigStatus,
    ) -> Result<(), Error>;

    /// Merge annotations into a SearchConfig
    async fn patch_annotations(
        &self,
        name: &str,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_config(&self, name: &str, namespace: &str) -> Result<Option<SearchConfig>, Error> {
        let api: Api<SearchConfig> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_cluster(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<SearchCluster>, Error> {
        let api: Api<SearchCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &SearchConfigStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<SearchConfig>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn patch_annotations(
        &self,
        name: &str,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        patch_resource_annotations::<SearchConfig>(
            &self.client,
            name,
            namespace,
            annotations,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }
}

/// Controller context shared by all SearchConfig reconciles
pub struct Context {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn KubeClient>,
    /// Resolves HTTP clients for referenced clusters
    pub clients: Arc<dyn ClusterClientFactory>,
    /// Publishes Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Build version recorded on reconciled resources
    pub controller_version: String,
    /// Deadline for each request to a cluster
    pub request_timeout: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        clients: Arc<dyn ClusterClientFactory>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            clients,
            events,
            controller_version: "1.3.0".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    clients: Option<Arc<dyn ClusterClientFactory>>,
    events: Option<Arc<dyn EventPublisher>>,
    controller_version: String,
    request_timeout: Duration,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            clients: None,
            events: None,
            controller_version: OPERATOR_VERSION.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the cluster client factory
    pub fn cluster_clients(mut self, clients: Arc<dyn ClusterClientFactory>) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the controller version recorded on resources
    pub fn controller_version(mut self, version: impl Into<String>) -> Self {
        self.controller_version = version.into();
        self
    }

    /// Set the deadline for requests to clusters
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            clients: self
                .clients
                .unwrap_or_else(|| Arc::new(KubeClusterClientFactory::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
            }),
            controller_version: self.controller_version,
            request_timeout: self.request_timeout,
        }
    }
}

/// Reconcile a SearchConfig resource
#[instrument(
    skip(config, ctx),
    fields(config = %config.name_any(), namespace = %config.namespace().unwrap_or_default())
)]
pub async fn reconcile(config: Arc<SearchConfig>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = config.name_any();
    let namespace = config.namespace().unwrap_or_default();

    let Some(latest) = ctx.kube.get_config(&name, &namespace).await? else {
        debug!("config no longer exists");
        return Ok(Action::await_change());
    };

    if is_unmanaged(latest.metadata.annotations.as_ref()) {
        info!("config is unmanaged, skipping");
        return Ok(Action::await_change());
    }

    let object_ref = latest.object_ref(&());

    let recorded = recorded_controller_version(latest.metadata.annotations.as_ref());
    let stamp = match check_compatibility(recorded, &ctx.controller_version) {
        Ok(Compatibility::Compatible) => false,
        Ok(Compatibility::Stamp) => true,
        Ok(Compatibility::Incompatible { recorded }) => {
            info!(
                recorded = %recorded,
                current = %ctx.controller_version,
                "config belongs to an incompatible controller, skipping"
            );
            return Ok(Action::await_change());
        }
        Err(e) => {
            warn!(error = %e, "compatibility check failed");
            publish_warning(&ctx, &object_ref, reasons::COMPAT_CHECK_ERROR, e.to_string()).await;
            return Err(e);
        }
    };

    if let Err(e) = latest.spec.validate() {
        let e = e.with_resource(&name);
        warn!(error = %e, "config validation failed");
        let next = next_status(&latest, ConfigPhase::Invalid, Some(e.to_string()), 0);
        if update_status(&ctx, &latest, next).await? {
            publish_warning(&ctx, &object_ref, reasons::VALIDATION, e.to_string()).await;
        }
        return Ok(Action::await_change());
    }

    // Only a config this controller will act on gets stamped.
    if stamp {
        let annotations = BTreeMap::from([(
            ANNOTATION_CONTROLLER_VERSION.to_string(),
            ctx.controller_version.clone(),
        )]);
        ctx.kube
            .patch_annotations(&name, &namespace, &annotations)
            .await?;
        debug!(version = %ctx.controller_version, "controller version recorded");
    }

    let cluster_name = latest.spec.cluster_ref.name.clone();
    let cluster_namespace = latest.spec.cluster_ref.namespace_or(&namespace).to_string();
    if ctx
        .kube
        .get_cluster(&cluster_name, &cluster_namespace)
        .await?
        .is_none()
    {
        let e = Error::not_found("SearchCluster", &cluster_namespace, &cluster_name);
        warn!(error = %e, "referenced cluster not found");
        publish_warning(&ctx, &object_ref, reasons::ASSOCIATION_ERROR, e.to_string()).await;
        return Err(e);
    }

    let client = ctx
        .clients
        .client_for(&cluster_namespace, &cluster_name)
        .await?;
    let converger = ConfigConverger::new(client.as_ref(), ctx.request_timeout);

    match converger.converge(&latest.spec.operations).await {
        Ok(report) => {
            let next = next_status(&latest, ConfigPhase::Applied, None, report.applied());
            update_status(&ctx, &latest, next).await?;
            info!(
                applied = report.applied(),
                writes = report.writes(),
                cluster = %cluster_name,
                "config converged"
            );
            Ok(Action::await_change())
        }
        Err(e) => {
            warn!(error = %e, cluster = %cluster_name, "config operation failed");
            let applied = latest
                .status
                .as_ref()
                .map(|s| s.applied_operations)
                .unwrap_or(0);
            let next = next_status(&latest, ConfigPhase::Failed, Some(e.to_string()), applied);
            if update_status(&ctx, &latest, next).await? {
                publish_warning(&ctx, &object_ref, reasons::OPERATION_FAILED, e.to_string()).await;
            }
            Err(e)
        }
    }
}

fn next_status(
    config: &SearchConfig,
    phase: ConfigPhase,
    message: Option<String>,
    applied_operations: u32,
) -> SearchConfigStatus {
    SearchConfigStatus {
        phase,
        message,
        applied_operations,
        observed_generation: config.metadata.generation,
    }
}

/// Patch the status unless it is already current. Returns whether it changed.
async fn update_status(
    ctx: &Context,
    config: &SearchConfig,
    next: SearchConfigStatus,
) -> Result<bool, Error> {
    if config.status.as_ref() == Some(&next) {
        debug!(phase = %next.phase, "status unchanged, skipping update");
        return Ok(false);
    }

    let name = config.name_any();
    let namespace = config.namespace().unwrap_or_default();
    ctx.kube.patch_status(&name, &namespace, &next).await?;
    Ok(true)
}

async fn publish_warning(
    ctx: &Context,
    object_ref: &ObjectReference,
    reason: &str,
    message: String,
) {
    ctx.events
        .publish(
            object_ref,
            EventType::Warning,
            reason,
            actions::RECONCILE,
            Some(message),
        )
        .await;
}

/// Error policy for the controller
///
/// Operation failures and missing clusters are retried after a short delay;
/// problems with the declared intent wait for a spec change.
pub fn error_policy(config: Arc<SearchConfig>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        config = %config.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
    } else {
        Action::await_change()
    }
}
