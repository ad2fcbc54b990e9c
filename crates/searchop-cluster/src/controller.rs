//! SearchCluster status controller
//!
//! Each pass observes the pods and node-group StatefulSets of a cluster plus
//! the health the cluster reports, decides which lifecycle phase the cluster
//! is in, and writes status and orchestration hints back at most once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use searchop_common::crd::{node_set_stateful_set_name, SearchCluster, SearchClusterStatus};
use searchop_common::events::{flush_events, EventPublisher, KubeEventPublisher};
use searchop_common::hints::{
    OrchestrationHints, CREATED_AT_VERSION, HINTS_ANNOTATION, ROLLING_UPGRADE_IN_PROGRESS,
};
use searchop_common::kube_utils::{
    cluster_selector, is_unmanaged, patch_resource_annotations, patch_resource_status,
    stateful_set_template_version,
};
use searchop_common::search_client::{ClusterClientFactory, KubeClusterClientFactory};
use searchop_common::version::{is_valid_upgrade_path, Version};
use searchop_common::{Error, DEFAULT_REQUEST_TIMEOUT_SECS, FIELD_MANAGER};

use crate::observer::{observe_cluster, ObservedState, ResourcesState};
use crate::state::ReconcileState;

/// Name reported on published events
pub const CONTROLLER_NAME: &str = "searchop-cluster-controller";

/// How long a pod may be terminating before the shutdown counts as stalled
pub const SHUTDOWN_STALL_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Requeue interval once the cluster is ready
pub const REQUEUE_READY_SECS: u64 = 60;

/// Requeue interval while the cluster is converging
pub const REQUEUE_PROGRESS_SECS: u64 = 10;

/// Requeue interval after a retryable error
pub const REQUEUE_ERROR_SECS: u64 = 5;

/// Trait abstracting Kubernetes client operations for SearchCluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a SearchCluster by name
    async fn get_cluster(&self, name: &str, namespace: &str)
        -> Result<Option<SearchCluster>, Error>;

    /// List the pods of a cluster
    async fn list_pods(&self, name: &str, namespace: &str) -> Result<Vec<Pod>, Error>;

    /// List the node-group StatefulSets of a cluster
    async fn list_stateful_sets(&self, name: &str, namespace: &str)
        -> Result<Vec<StatefulSet>, Error>;

    /// Patch the status of a SearchCluster
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &SearchClusterStatus,
    ) -> Result<(), Error>;

    /// Merge annotations into a SearchCluster
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
    async fn get_cluster(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<SearchCluster>, Error> {
        let api: Api<SearchCluster> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cluster) => Ok(Some(cluster)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self, name: &str, namespace: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(&cluster_selector(name)))
            .await?;
        Ok(pods.items)
    }

    async fn list_stateful_sets(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Vec<StatefulSet>, Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let sets = api
            .list(&ListParams::default().labels(&cluster_selector(name)))
            .await?;
        Ok(sets.items)
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &SearchClusterStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<SearchCluster>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn patch_annotations(
        &self,
        name: &str,
        namespace: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        patch_resource_annotations::<SearchCluster>(
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

/// Controller context shared by all SearchCluster reconciles
///
/// Use [`ContextBuilder`] to construct instances.
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Resolves HTTP clients for managed clusters
    pub clients: Arc<dyn ClusterClientFactory>,
    /// Publishes Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Deadline for the cluster health request
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
    request_timeout: Duration,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            clients: None,
            events: None,
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

    /// Set the deadline for requests to managed clusters
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
            request_timeout: self.request_timeout,
        }
    }
}

/// Phase a pass settles on, decided from observations alone
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhaseDecision {
    /// A pod has been terminating past the stall threshold
    ShutdownStalled {
        /// Human-readable description of the stuck pod
        detail: String,
    },
    /// A node group runs more replicas than declared
    MigratingData,
    /// Declared node groups are missing, resized or on another version
    ApplyingChanges,
    /// Every declared node is available
    Ready,
    /// Nothing to decide, keep the current phase
    Unchanged,
}

/// Decide the phase of `cluster` from its observed resources.
///
/// Checks run in priority order: stalled shutdown, data migration, pending
/// changes, readiness.
pub fn determine_phase(
    cluster: &SearchCluster,
    resources: &ResourcesState,
    now: DateTime<Utc>,
) -> PhaseDecision {
    if let Some(pod) = resources.stalled_pod(now, SHUTDOWN_STALL_THRESHOLD) {
        return PhaseDecision::ShutdownStalled {
            detail: format!(
                "Pod {} has been terminating for more than {}s.",
                pod.name_any(),
                SHUTDOWN_STALL_THRESHOLD.as_secs()
            ),
        };
    }

    let name = cluster.name_any();
    let mut changes_pending = false;
    for node_set in &cluster.spec.node_sets {
        let Some(sts) = resources.stateful_set(&node_set_stateful_set_name(&name, &node_set.name))
        else {
            changes_pending = true;
            continue;
        };
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        if replicas > node_set.count {
            return PhaseDecision::MigratingData;
        }
        if replicas != node_set.count
            || stateful_set_template_version(sts) != Some(cluster.spec.version.as_str())
        {
            changes_pending = true;
        }
    }

    if changes_pending {
        PhaseDecision::ApplyingChanges
    } else if resources.available_nodes() >= cluster.spec.node_count() {
        PhaseDecision::Ready
    } else {
        PhaseDecision::Unchanged
    }
}

/// Whether any node group template still runs another version than declared
fn rolling_upgrade_in_progress(cluster: &SearchCluster, resources: &ResourcesState) -> bool {
    resources.stateful_sets.iter().any(|sts| {
        stateful_set_template_version(sts)
            .map(|v| v != cluster.spec.version)
            .unwrap_or(false)
    })
}

/// Check the declared version is reachable from the last reported one
fn check_upgrade(cluster: &SearchCluster, hints: &OrchestrationHints) -> Result<(), Error> {
    let reported = cluster
        .status
        .as_ref()
        .map(|s| s.version.as_str())
        .filter(|v| !v.is_empty())
        .or_else(|| hints.string(CREATED_AT_VERSION));
    let Some(reported) = reported else {
        return Ok(());
    };

    let from = Version::parse(reported)?;
    let to = Version::parse(&cluster.spec.version)?;
    if from == to || is_valid_upgrade_path(&from, &to) {
        return Ok(());
    }
    Err(Error::validation_for_field(
        cluster.name_any(),
        "spec.version",
        format!("unsupported version change from {from} to {to}"),
    ))
}

/// Reconcile a SearchCluster resource
///
/// Computes the cluster's phase and health, persists them together with
/// orchestration hints, and publishes the events of the pass.
#[instrument(
    skip(cluster, ctx),
    fields(cluster = %cluster.name_any(), namespace = %cluster.namespace().unwrap_or_default())
)]
pub async fn reconcile(cluster: Arc<SearchCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    let Some(latest) = ctx.kube.get_cluster(&name, &namespace).await? else {
        debug!("cluster no longer exists");
        return Ok(Action::await_change());
    };

    if is_unmanaged(latest.metadata.annotations.as_ref()) {
        info!("cluster is unmanaged, skipping");
        return Ok(Action::await_change());
    }

    let mut state = ReconcileState::new(latest.clone())?;

    if let Err(e) = latest.spec.validate() {
        let e = e.with_resource(&name);
        warn!(error = %e, "cluster validation failed");
        state.mark_invalid(&e);
        finish_pass(&ctx, &latest, &mut state).await?;
        return Ok(Action::await_change());
    }

    if let Err(e) = check_upgrade(&latest, state.orchestration_hints()) {
        warn!(error = %e, "version change rejected");
        state.mark_invalid(&e);
        finish_pass(&ctx, &latest, &mut state).await?;
        return Ok(Action::await_change());
    }

    let pods = ctx.kube.list_pods(&name, &namespace).await?;
    let stateful_sets = ctx.kube.list_stateful_sets(&name, &namespace).await?;
    let resources = ResourcesState::new(pods, stateful_sets);
    let observed = match ctx.clients.client_for(&namespace, &name).await {
        Ok(client) => observe_cluster(client.as_ref(), ctx.request_timeout).await,
        Err(e) => {
            debug!(error = %e, "no client for cluster, skipping health observation");
            ObservedState::default()
        }
    };

    match determine_phase(&latest, &resources, Utc::now()) {
        PhaseDecision::ShutdownStalled { detail } => {
            state.mark_shutdown_stalled(&resources, &observed, &detail);
        }
        PhaseDecision::MigratingData => {
            state.mark_migrating_data(&resources, &observed);
        }
        PhaseDecision::ApplyingChanges => {
            state.mark_applying_changes(&resources.current_pods);
        }
        PhaseDecision::Ready => {
            state.mark_ready(&resources, &observed);
        }
        PhaseDecision::Unchanged => {
            state.update_state(&resources, &observed);
        }
    }

    let mut hints = state.orchestration_hints().clone();
    hints.set_once(CREATED_AT_VERSION, latest.spec.version.clone());
    hints.set(
        ROLLING_UPGRADE_IN_PROGRESS,
        rolling_upgrade_in_progress(&latest, &resources),
    );
    state.update_orchestration_hints(&hints);

    let ready = state.is_ready();
    finish_pass(&ctx, &latest, &mut state).await?;

    info!(
        phase = %state.status().phase,
        health = %state.status().health,
        available_nodes = state.status().available_nodes,
        "cluster reconciled"
    );

    let requeue = if ready {
        REQUEUE_READY_SECS
    } else {
        REQUEUE_PROGRESS_SECS
    };
    Ok(Action::requeue(Duration::from_secs(requeue)))
}

/// Apply the tracker, persist what changed and publish the pass's events.
///
/// Events are published even when persisting fails.
async fn finish_pass(
    ctx: &Context,
    loaded: &SearchCluster,
    state: &mut ReconcileState,
) -> Result<(), Error> {
    let (events, updated) = state.apply();

    let persisted = match updated {
        Some(updated) => persist(ctx, loaded, &updated).await,
        None => Ok(()),
    };

    flush_events(ctx.events.as_ref(), &loaded.object_ref(&()), &events).await;
    persisted
}

/// Write hints, then status.
///
/// A failed status write leaves the stored hints ahead of the stored status,
/// which the next pass recomputes and writes again.
async fn persist(ctx: &Context, loaded: &SearchCluster, updated: &SearchCluster) -> Result<(), Error> {
    let name = loaded.name_any();
    let namespace = loaded.namespace().unwrap_or_default();

    let hints = updated.annotations().get(HINTS_ANNOTATION);
    if hints.is_some() && hints != loaded.annotations().get(HINTS_ANNOTATION) {
        let patch: BTreeMap<String, String> = updated
            .annotations()
            .iter()
            .filter(|(k, _)| k.as_str() == HINTS_ANNOTATION)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        ctx.kube.patch_annotations(&name, &namespace, &patch).await?;
    }

    if updated.status != loaded.status {
        if let Some(status) = &updated.status {
            ctx.kube.patch_status(&name, &namespace, status).await?;
        }
    }

    debug!("cluster state persisted");
    Ok(())
}

/// Error policy for the controller
///
/// Retryable errors are retried after a short delay; problems with the
/// declared intent wait for a spec change.
pub fn error_policy(cluster: Arc<SearchCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::api::core::v1::{
        ObjectReference, PodCondition, PodStatus, PodTemplateSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use mockall::mock;
    use serde_json::json;
    use searchop_common::crd::{ClusterPhase, Health, NodeSetSpec, SearchClusterSpec};
    use searchop_common::events::{reasons, EventType};
    use searchop_common::kube_utils::{ANNOTATION_MANAGED, LABEL_NODE_SET, LABEL_VERSION};
    use searchop_common::search_client::{Method, SearchClient, SearchResponse};

    // Local mocks for traits defined in searchop-common
    mock! {
        pub Search {}

        #[async_trait]
        impl SearchClient for Search {
            async fn request(
                &self,
                method: Method,
                path: &str,
                body: Option<Vec<u8>>,
            ) -> Result<SearchResponse, Error>;
        }
    }

    mock! {
        pub Clients {}

        #[async_trait]
        impl ClusterClientFactory for Clients {
            async fn client_for(
                &self,
                namespace: &str,
                name: &str,
            ) -> Result<Arc<dyn SearchClient>, Error>;
        }
    }

    /// Records published events for verification
    #[derive(Clone, Default)]
    struct EventCapture {
        events: Arc<Mutex<Vec<(EventType, String, Option<String>)>>>,
    }

    impl EventCapture {
        fn reasons(&self) -> Vec<String> {
            self.events
                .lock()
                .expect("mutex should not be poisoned")
                .iter()
                .map(|(_, r, _)| r.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventPublisher for EventCapture {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            _action: &str,
            note: Option<String>,
        ) {
            self.events
                .lock()
                .expect("mutex should not be poisoned")
                .push((type_, reason.to_string(), note));
        }
    }

    /// Captured status updates for verification
    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<SearchClusterStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: SearchClusterStatus) {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .push(status);
        }

        fn last(&self) -> Option<SearchClusterStatus> {
            self.updates
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .cloned()
        }

        fn was_updated(&self) -> bool {
            !self
                .updates
                .lock()
                .expect("mutex should not be poisoned")
                .is_empty()
        }
    }

    const NS: &str = "team-a";

    fn sample_cluster(version: &str, count: i32) -> SearchCluster {
        let mut c = SearchCluster::new(
            "logs",
            SearchClusterSpec {
                version: version.to_string(),
                node_sets: vec![NodeSetSpec {
                    name: "data".to_string(),
                    count,
                }],
            },
        );
        c.metadata.namespace = Some(NS.to_string());
        c
    }

    fn labels(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn ready_pod(name: &str, version: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: labels(&[(LABEL_VERSION, version)]),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn data_sts(replicas: i32, version: &str) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some(node_set_stateful_set_name("logs", "data")),
                labels: labels(&[(LABEL_NODE_SET, "data")]),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: labels(&[(LABEL_VERSION, version)]),
                        ..Default::default()
                    }),
                    spec: None,
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn healthy_clients(status: &'static str) -> Arc<MockClients> {
        let mut clients = MockClients::new();
        clients.expect_client_for().returning(move |_, _| {
            let mut search = MockSearch::new();
            search.expect_request().returning(move |_, _, _| {
                Ok(SearchResponse::new(
                    200,
                    format!(r#"{{"status":"{status}"}}"#),
                ))
            });
            Ok(Arc::new(search) as Arc<dyn SearchClient>)
        });
        Arc::new(clients)
    }

    struct Fixture {
        ctx: Arc<Context>,
        statuses: StatusCapture,
        events: EventCapture,
        annotations: Arc<Mutex<Vec<BTreeMap<String, String>>>>,
    }

    fn fixture(stored: SearchCluster, pods: Vec<Pod>, sets: Vec<StatefulSet>) -> Fixture {
        let statuses = StatusCapture::default();
        let events = EventCapture::default();
        let annotations = Arc::new(Mutex::new(Vec::new()));

        let mut mock = MockKubeClient::new();
        mock.expect_get_cluster()
            .returning(move |_, _| Ok(Some(stored.clone())));
        mock.expect_list_pods()
            .returning(move |_, _| Ok(pods.clone()));
        mock.expect_list_stateful_sets()
            .returning(move |_, _| Ok(sets.clone()));
        let capture = statuses.clone();
        mock.expect_patch_status().returning(move |_, _, status| {
            capture.record(status.clone());
            Ok(())
        });
        let annotation_capture = annotations.clone();
        mock.expect_patch_annotations()
            .returning(move |_, _, patch| {
                annotation_capture
                    .lock()
                    .expect("mutex should not be poisoned")
                    .push(patch.clone());
                Ok(())
            });

        Fixture {
            ctx: Arc::new(Context::for_testing(
                Arc::new(mock),
                healthy_clients("green"),
                Arc::new(events.clone()),
            )),
            statuses,
            events,
            annotations,
        }
    }

    mod phase_decisions {
        use super::*;

        fn decide(cluster: &SearchCluster, pods: Vec<Pod>, sets: Vec<StatefulSet>) -> PhaseDecision {
            determine_phase(cluster, &ResourcesState::new(pods, sets), Utc::now())
        }

        #[test]
        fn all_nodes_available_is_ready() {
            let c = sample_cluster("7.10.0", 2);
            let decision = decide(
                &c,
                vec![ready_pod("a", "7.10.0"), ready_pod("b", "7.10.0")],
                vec![data_sts(2, "7.10.0")],
            );
            assert_eq!(decision, PhaseDecision::Ready);
        }

        #[test]
        fn missing_node_group_is_applying_changes() {
            let c = sample_cluster("7.10.0", 2);
            assert_eq!(decide(&c, vec![], vec![]), PhaseDecision::ApplyingChanges);
        }

        #[test]
        fn scale_up_is_applying_changes() {
            let c = sample_cluster("7.10.0", 3);
            let decision = decide(&c, vec![], vec![data_sts(2, "7.10.0")]);
            assert_eq!(decision, PhaseDecision::ApplyingChanges);
        }

        #[test]
        fn version_change_is_applying_changes() {
            let c = sample_cluster("7.10.0", 1);
            let decision = decide(
                &c,
                vec![ready_pod("a", "7.9.1")],
                vec![data_sts(1, "7.9.1")],
            );
            assert_eq!(decision, PhaseDecision::ApplyingChanges);
        }

        #[test]
        fn scale_down_is_migrating_data() {
            let c = sample_cluster("7.10.0", 1);
            let decision = decide(&c, vec![], vec![data_sts(3, "7.10.0")]);
            assert_eq!(decision, PhaseDecision::MigratingData);
        }

        #[test]
        fn unready_nodes_keep_phase() {
            let c = sample_cluster("7.10.0", 2);
            let decision = decide(
                &c,
                vec![ready_pod("a", "7.10.0")],
                vec![data_sts(2, "7.10.0")],
            );
            assert_eq!(decision, PhaseDecision::Unchanged);
        }

        #[test]
        fn long_termination_is_stalled_before_anything_else() {
            let c = sample_cluster("7.10.0", 1);
            let mut stuck = ready_pod("logs-search-data-2", "7.10.0");
            stuck.metadata.deletion_timestamp =
                Some(Time(Utc::now() - chrono::Duration::minutes(10)));

            let decision = decide(&c, vec![stuck], vec![data_sts(3, "7.10.0")]);

            match decision {
                PhaseDecision::ShutdownStalled { detail } => {
                    assert!(detail.contains("logs-search-data-2"))
                }
                other => panic!("expected ShutdownStalled, got {other:?}"),
            }
        }
    }

    mod upgrade_gate {
        use super::*;

        fn with_reported(version: &str, reported: &str) -> SearchCluster {
            let mut c = sample_cluster(version, 1);
            c.status = Some(SearchClusterStatus {
                version: reported.to_string(),
                ..Default::default()
            });
            c
        }

        #[test]
        fn same_or_upgrade_is_accepted() {
            let hints = OrchestrationHints::default();
            assert!(check_upgrade(&with_reported("7.10.0", "7.10.0"), &hints).is_ok());
            assert!(check_upgrade(&with_reported("7.10.0", "7.9.1"), &hints).is_ok());
            assert!(check_upgrade(&with_reported("8.0.0", "7.17.0"), &hints).is_ok());
        }

        #[test]
        fn downgrade_is_rejected() {
            let err = check_upgrade(&with_reported("7.9.0", "7.10.0"), &Default::default())
                .unwrap_err();
            assert!(err.to_string().contains("unsupported version change"));
        }

        #[test]
        fn created_at_version_used_before_first_report() {
            let c = sample_cluster("9.0.0", 1);
            let hints: OrchestrationHints =
                [(CREATED_AT_VERSION, json!("7.10.0"))].into_iter().collect();
            assert!(check_upgrade(&c, &hints).is_err());
            assert!(check_upgrade(&c, &OrchestrationHints::default()).is_ok());
        }
    }

    mod reconcile_flow {
        use super::*;

        /// Story: a freshly created cluster whose nodes all came up is marked
        /// ready, healthy and gets its creation version recorded.
        #[tokio::test]
        async fn story_new_cluster_becomes_ready() {
            let f = fixture(
                sample_cluster("7.10.0", 2),
                vec![ready_pod("a", "7.10.0"), ready_pod("b", "7.10.0")],
                vec![data_sts(2, "7.10.0")],
            );

            let action = reconcile(Arc::new(sample_cluster("7.10.0", 2)), f.ctx.clone())
                .await
                .expect("reconcile should succeed");

            assert_eq!(action, Action::requeue(Duration::from_secs(REQUEUE_READY_SECS)));
            let status = f.statuses.last().expect("status should be patched");
            assert_eq!(status.phase, ClusterPhase::Ready);
            assert_eq!(status.health, Health::Green);
            assert_eq!(status.available_nodes, 2);
            assert_eq!(status.version, "7.10.0");

            let patches = f.annotations.lock().expect("mutex should not be poisoned");
            let hints =
                OrchestrationHints::from_annotations(patches.last()).expect("hints should parse");
            assert_eq!(hints.string(CREATED_AT_VERSION), Some("7.10.0"));
            assert!(!hints.flag(ROLLING_UPGRADE_IN_PROGRESS));
        }

        /// Story: a steady cluster produces no writes at all
        #[tokio::test]
        async fn story_steady_cluster_is_not_rewritten() {
            let mut stored = sample_cluster("7.10.0", 1);
            stored.status = Some(SearchClusterStatus {
                phase: ClusterPhase::Ready,
                health: Health::Green,
                available_nodes: 1,
                version: "7.10.0".to_string(),
            });
            stored.annotations_mut().insert(
                HINTS_ANNOTATION.to_string(),
                r#"{"createdAtVersion":"7.10.0","rollingUpgradeInProgress":false}"#.to_string(),
            );
            let f = fixture(
                stored.clone(),
                vec![ready_pod("a", "7.10.0")],
                vec![data_sts(1, "7.10.0")],
            );

            reconcile(Arc::new(stored), f.ctx.clone())
                .await
                .expect("reconcile should succeed");

            assert!(!f.statuses.was_updated());
            assert!(f.annotations.lock().expect("mutex should not be poisoned").is_empty());
            assert!(f.events.reasons().is_empty());
        }

        /// Story: a version bump rolls out with forced red health and the
        /// rolling-upgrade hint set, without an Unhealthy warning.
        #[tokio::test]
        async fn story_upgrade_is_applying_changes() {
            let mut stored = sample_cluster("7.10.0", 1);
            stored.status = Some(SearchClusterStatus {
                phase: ClusterPhase::Ready,
                health: Health::Green,
                available_nodes: 1,
                version: "7.9.1".to_string(),
            });
            let f = fixture(
                stored.clone(),
                vec![ready_pod("a", "7.9.1")],
                vec![data_sts(1, "7.9.1")],
            );

            let action = reconcile(Arc::new(stored), f.ctx.clone())
                .await
                .expect("reconcile should succeed");

            assert_eq!(
                action,
                Action::requeue(Duration::from_secs(REQUEUE_PROGRESS_SECS))
            );
            let status = f.statuses.last().expect("status should be patched");
            assert_eq!(status.phase, ClusterPhase::ApplyingChanges);
            assert_eq!(status.health, Health::Red);
            assert!(!f.events.reasons().contains(&reasons::UNHEALTHY.to_string()));

            let patches = f.annotations.lock().expect("mutex should not be poisoned");
            let hints =
                OrchestrationHints::from_annotations(patches.last()).expect("hints should parse");
            assert!(hints.flag(ROLLING_UPGRADE_IN_PROGRESS));
        }

        /// Story: an invalid spec is reported once and waits for a fix
        #[tokio::test]
        async fn story_invalid_spec_awaits_change() {
            let stored = sample_cluster("7.10.0", 0);
            let f = fixture(stored.clone(), vec![], vec![]);

            let action = reconcile(Arc::new(stored), f.ctx.clone())
                .await
                .expect("reconcile should succeed");

            assert_eq!(action, Action::await_change());
            assert_eq!(
                f.statuses.last().map(|s| s.phase),
                Some(ClusterPhase::Invalid)
            );
            assert_eq!(f.events.reasons(), vec![reasons::VALIDATION.to_string()]);
        }

        /// Story: a downgrade request is refused instead of rolled out
        #[tokio::test]
        async fn story_downgrade_is_invalid() {
            let mut stored = sample_cluster("7.9.0", 1);
            stored.status = Some(SearchClusterStatus {
                phase: ClusterPhase::Ready,
                health: Health::Green,
                available_nodes: 1,
                version: "7.10.0".to_string(),
            });
            let f = fixture(stored.clone(), vec![], vec![]);

            let action = reconcile(Arc::new(stored), f.ctx.clone())
                .await
                .expect("reconcile should succeed");

            assert_eq!(action, Action::await_change());
            let status = f.statuses.last().expect("status should be patched");
            assert_eq!(status.phase, ClusterPhase::Invalid);
            assert_eq!(status.version, "7.10.0");
        }

        /// Story: a deleted cluster is a no-op
        #[tokio::test]
        async fn story_deleted_cluster_is_ignored() {
            let mut mock = MockKubeClient::new();
            mock.expect_get_cluster().returning(|_, _| Ok(None));
            let ctx = Arc::new(Context::for_testing(
                Arc::new(mock),
                Arc::new(MockClients::new()),
                Arc::new(EventCapture::default()),
            ));

            let action = reconcile(Arc::new(sample_cluster("7.10.0", 1)), ctx)
                .await
                .expect("reconcile should succeed");

            assert_eq!(action, Action::await_change());
        }

        /// Story: an unmanaged cluster is left alone
        #[tokio::test]
        async fn story_unmanaged_cluster_is_skipped() {
            let mut stored = sample_cluster("7.10.0", 1);
            stored
                .annotations_mut()
                .insert(ANNOTATION_MANAGED.to_string(), "false".to_string());
            let mut mock = MockKubeClient::new();
            mock.expect_get_cluster()
                .returning(move |_, _| Ok(Some(stored.clone())));
            mock.expect_list_pods().never();
            mock.expect_patch_status().never();
            let ctx = Arc::new(Context::for_testing(
                Arc::new(mock),
                Arc::new(MockClients::new()),
                Arc::new(EventCapture::default()),
            ));

            let action = reconcile(Arc::new(sample_cluster("7.10.0", 1)), ctx)
                .await
                .expect("reconcile should succeed");

            assert_eq!(action, Action::await_change());
        }

        /// Story: an unreachable cluster still gets its status tracked, with
        /// unknown health.
        #[tokio::test]
        async fn story_unreachable_cluster_has_unknown_health() {
            let stored = sample_cluster("7.10.0", 1);
            let mut mock = MockKubeClient::new();
            let s = stored.clone();
            mock.expect_get_cluster()
                .returning(move |_, _| Ok(Some(s.clone())));
            mock.expect_list_pods()
                .returning(|_, _| Ok(vec![ready_pod("a", "7.10.0")]));
            mock.expect_list_stateful_sets()
                .returning(|_, _| Ok(vec![data_sts(1, "7.10.0")]));
            let statuses = StatusCapture::default();
            let capture = statuses.clone();
            mock.expect_patch_status().returning(move |_, _, status| {
                capture.record(status.clone());
                Ok(())
            });
            mock.expect_patch_annotations().returning(|_, _, _| Ok(()));

            let mut clients = MockClients::new();
            clients
                .expect_client_for()
                .returning(|ns, name| Err(Error::not_found("Secret", ns, name)));

            let ctx = Arc::new(Context::for_testing(
                Arc::new(mock),
                Arc::new(clients),
                Arc::new(EventCapture::default()),
            ));

            reconcile(Arc::new(stored), ctx)
                .await
                .expect("reconcile should succeed");

            let status = statuses.last().expect("status should be patched");
            assert_eq!(status.phase, ClusterPhase::Ready);
            assert_eq!(status.health, Health::Unknown);
        }

        /// Story: when the status write fails the pass fails so it is retried,
        /// and queued events are still published.
        #[tokio::test]
        async fn story_status_write_failure_propagates() {
            let stored = sample_cluster("7.10.0", 0);
            let mut mock = MockKubeClient::new();
            let s = stored.clone();
            mock.expect_get_cluster()
                .returning(move |_, _| Ok(Some(s.clone())));
            mock.expect_patch_status()
                .returning(|_, _, _| Err(Error::internal("connection refused")));
            let events = EventCapture::default();
            let ctx = Arc::new(Context::for_testing(
                Arc::new(mock),
                Arc::new(MockClients::new()),
                Arc::new(events.clone()),
            ));

            let result = reconcile(Arc::new(stored), ctx).await;

            assert!(result.unwrap_err().to_string().contains("connection refused"));
            assert_eq!(events.reasons(), vec![reasons::VALIDATION.to_string()]);
        }

        /// Story: a spec that was rejected is fixed while nodes are still
        /// coming up; the cluster leaves Invalid instead of waiting for
        /// every node to be ready.
        #[tokio::test]
        async fn story_fixed_spec_leaves_invalid() {
            let mut stored = sample_cluster("7.10.0", 2);
            stored.status = Some(SearchClusterStatus {
                phase: ClusterPhase::Invalid,
                health: Health::Green,
                available_nodes: 2,
                version: "7.10.0".to_string(),
            });
            let mut unready = ready_pod("b", "7.10.0");
            if let Some(status) = unready.status.as_mut() {
                status.conditions = Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "False".to_string(),
                    ..Default::default()
                }]);
            }
            let f = fixture(
                stored.clone(),
                vec![ready_pod("a", "7.10.0"), unready],
                vec![data_sts(2, "7.10.0")],
            );

            reconcile(Arc::new(stored), f.ctx.clone())
                .await
                .expect("reconcile should succeed");

            let status = f.statuses.last().expect("status should be patched");
            assert_eq!(status.phase, ClusterPhase::ApplyingChanges);
            assert_eq!(status.available_nodes, 1);
        }

        /// Story: a stalled shutdown that resolved itself does not keep the
        /// cluster reported as stalled.
        #[tokio::test]
        async fn story_resolved_stall_is_not_kept() {
            let mut stored = sample_cluster("7.10.0", 2);
            stored.status = Some(SearchClusterStatus {
                phase: ClusterPhase::NodeShutdownStalled,
                health: Health::Yellow,
                available_nodes: 1,
                version: "7.10.0".to_string(),
            });
            let f = fixture(
                stored.clone(),
                vec![ready_pod("a", "7.10.0")],
                vec![data_sts(2, "7.10.0")],
            );

            reconcile(Arc::new(stored), f.ctx.clone())
                .await
                .expect("reconcile should succeed");

            let status = f.statuses.last().expect("status should be patched");
            assert_eq!(status.phase, ClusterPhase::ApplyingChanges);
        }

        /// Story: hints are written before status, so a failed hints write
        /// leaves the stored status untouched for the retry.
        #[tokio::test]
        async fn story_hints_written_before_status() {
            let stored = sample_cluster("7.10.0", 1);
            let mut mock = MockKubeClient::new();
            let s = stored.clone();
            mock.expect_get_cluster()
                .returning(move |_, _| Ok(Some(s.clone())));
            mock.expect_list_pods()
                .returning(|_, _| Ok(vec![ready_pod("a", "7.10.0")]));
            mock.expect_list_stateful_sets()
                .returning(|_, _| Ok(vec![data_sts(1, "7.10.0")]));
            mock.expect_patch_annotations()
                .times(1)
                .returning(|_, _, _| Err(Error::internal("connection refused")));
            mock.expect_patch_status().never();

            let ctx = Arc::new(Context::for_testing(
                Arc::new(mock),
                healthy_clients("green"),
                Arc::new(EventCapture::default()),
            ));

            let result = reconcile(Arc::new(stored), ctx).await;

            assert!(result.is_err());
        }
    }

    mod error_policy_tests {
        use super::*;
        use rstest::rstest;

        fn ctx() -> Arc<Context> {
            Arc::new(Context::for_testing(
                Arc::new(MockKubeClient::new()),
                Arc::new(MockClients::new()),
                Arc::new(EventCapture::default()),
            ))
        }

        #[rstest]
        #[case::internal(Error::internal("boom"))]
        #[case::not_found(Error::not_found("Pod", "ns", "p"))]
        #[case::transport(Error::transport("/_cluster/health", "reset"))]
        fn retryable_errors_requeue(#[case] error: Error) {
            let action = error_policy(Arc::new(sample_cluster("7.10.0", 1)), &error, ctx());
            assert_eq!(action, Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS)));
        }

        #[rstest]
        #[case::validation(Error::validation("bad"))]
        #[case::hints(Error::serialization("bad hints"))]
        fn intent_errors_await_change(#[case] error: Error) {
            let action = error_policy(Arc::new(sample_cluster("7.10.0", 1)), &error, ctx());
            assert_eq!(action, Action::await_change());
        }
    }
}
