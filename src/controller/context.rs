//! Shared controller context and client trait seams.
//!
//! The reconciler depends on two capability traits: [`KubeApi`] for child
//! object operations and [`crate::admin::AdminClient`] for the coordinator.
//! Both are mocked in tests; the context also carries the in-memory
//! first-seen tracking for orphaned placement ids and per-key failure
//! counts for backoff.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::core::Resource;
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;

#[cfg(test)]
use mockall::automock;

use crate::admin::{AdminClient, AdminClientImpl};
use crate::crd::{M3DBCluster, M3DBClusterStatus};
use crate::events::{EventPublisher, KubeEventPublisher};
use crate::resources::coordinator_service_name;
use crate::{Error, Result, CLUSTER_FINALIZER, PORT_COORDINATOR};

const FIELD_MANAGER: &str = "m3db-operator";

/// Default grace period before an orphaned placement id becomes a
/// removal candidate
pub const DEFAULT_IDENTITY_GRACE: Duration = Duration::from_secs(300);

/// Helper to get a resource by name, returning None on 404
async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(resource) => Ok(Some(resource)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Trait abstracting Kubernetes operations on a cluster's child objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// Patch the status subresource of a cluster
    async fn patch_status(
        &self,
        cluster: &M3DBCluster,
        status: &M3DBClusterStatus,
    ) -> Result<()>;

    /// Add the operator finalizer to a cluster
    async fn add_finalizer(&self, cluster: &M3DBCluster) -> Result<()>;

    /// Remove the operator finalizer from a cluster
    async fn remove_finalizer(&self, cluster: &M3DBCluster) -> Result<()>;

    /// Get a StatefulSet by name
    async fn get_stateful_set(&self, namespace: &str, name: &str)
        -> Result<Option<StatefulSet>>;

    /// Server-side apply a StatefulSet
    async fn apply_stateful_set(&self, sts: &StatefulSet) -> Result<()>;

    /// Patch only a StatefulSet's replica count
    async fn scale_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<()>;

    /// Get a Service by name
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Server-side apply a Service
    async fn apply_service(&self, service: &Service) -> Result<()>;

    /// Get a ConfigMap by name
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Server-side apply a ConfigMap
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// Get a PodDisruptionBudget by name
    async fn get_pod_disruption_budget(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodDisruptionBudget>>;

    /// Server-side apply a PodDisruptionBudget
    async fn apply_pod_disruption_budget(&self, pdb: &PodDisruptionBudget) -> Result<()>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Get a Node by name
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;
}

/// Real Kubernetes client implementation
pub struct KubeApiImpl {
    client: Client,
}

impl KubeApiImpl {
    /// Create a new KubeApiImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn clusters(&self, cluster: &M3DBCluster) -> Api<M3DBCluster> {
        match cluster.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }

    async fn apply<K>(&self, api: Api<K>, name: &str, resource: &K) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + serde::Serialize + std::fmt::Debug,
    {
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(resource),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KubeApi for KubeApiImpl {
    async fn patch_status(
        &self,
        cluster: &M3DBCluster,
        status: &M3DBClusterStatus,
    ) -> Result<()> {
        let api = self.clusters(cluster);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(
            &cluster.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn add_finalizer(&self, cluster: &M3DBCluster) -> Result<()> {
        let api = self.clusters(cluster);
        let mut finalizers = cluster.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == CLUSTER_FINALIZER) {
            return Ok(());
        }
        finalizers.push(CLUSTER_FINALIZER.to_string());
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(
            &cluster.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, cluster: &M3DBCluster) -> Result<()> {
        let api = self.clusters(cluster);
        let finalizers: Vec<String> = cluster
            .metadata
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != CLUSTER_FINALIZER)
            .collect();
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(
            &cluster.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn get_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }

    async fn apply_stateful_set(&self, sts: &StatefulSet) -> Result<()> {
        let namespace = sts
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::internal("statefulset without namespace"))?;
        let name = sts
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("statefulset without name"))?;
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        self.apply(api, name, sts).await
    }

    async fn scale_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }

    async fn apply_service(&self, service: &Service) -> Result<()> {
        let namespace = service
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::internal("service without namespace"))?;
        let name = service
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("service without name"))?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        self.apply(api, name, service).await
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let namespace = config_map
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::internal("configmap without namespace"))?;
        let name = config_map
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("configmap without name"))?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        self.apply(api, name, config_map).await
    }

    async fn get_pod_disruption_budget(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodDisruptionBudget>> {
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }

    async fn apply_pod_disruption_budget(&self, pdb: &PodDisruptionBudget) -> Result<()> {
        let namespace = pdb
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::internal("pdb without namespace"))?;
        let name = pdb
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("pdb without name"))?;
        let api: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        self.apply(api, name, pdb).await
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(selector);
        Ok(api.list(&params).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        get_optional(&api, name).await
    }
}

/// Builds an admin client for a given cluster's coordinator
pub trait AdminClientFactory: Send + Sync {
    /// Client bound to the cluster's coordinator endpoint and environment
    fn for_cluster(&self, cluster: &M3DBCluster) -> Arc<dyn AdminClient>;
}

/// Factory resolving the in-cluster coordinator service DNS name
pub struct CoordinatorAdminFactory {
    /// Override for every cluster's coordinator URL (development use)
    pub url_override: Option<String>,
}

impl AdminClientFactory for CoordinatorAdminFactory {
    fn for_cluster(&self, cluster: &M3DBCluster) -> Arc<dyn AdminClient> {
        let url = self.url_override.clone().unwrap_or_else(|| {
            format!(
                "http://{}.{}.svc.cluster.local:{}",
                coordinator_service_name(&cluster.name_any()),
                cluster.namespace().unwrap_or_default(),
                PORT_COORDINATOR
            )
        });
        let mut client = AdminClientImpl::new(url);
        if let Some(environment) = &cluster.spec.environment {
            client = client.with_environment(environment);
        }
        Arc::new(client)
    }
}

/// Factory handing out one fixed client; used by tests
pub struct FixedAdminFactory {
    client: Arc<dyn AdminClient>,
}

impl FixedAdminFactory {
    /// Wrap a client (typically a mock) for every cluster
    pub fn new(client: Arc<dyn AdminClient>) -> Self {
        Self { client }
    }
}

impl AdminClientFactory for FixedAdminFactory {
    fn for_cluster(&self, _cluster: &M3DBCluster) -> Arc<dyn AdminClient> {
        Arc::clone(&self.client)
    }
}

/// Controller context shared across all reconciliation passes
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn KubeApi>,
    /// Admin client factory, one client per cluster coordinator
    pub admin: Arc<dyn AdminClientFactory>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Grace period before an orphaned placement id may be removed
    pub identity_grace: Duration,
    orphans: Mutex<HashMap<String, HashMap<String, Instant>>>,
    failures: Mutex<HashMap<String, u32>>,
}

impl Context {
    /// Create a production context from a kube client
    pub fn new(client: Client, url_override: Option<String>, identity_grace: Duration) -> Self {
        Self {
            kube: Arc::new(KubeApiImpl::new(client.clone())),
            admin: Arc::new(CoordinatorAdminFactory { url_override }),
            events: Arc::new(KubeEventPublisher::new(client, "m3db-operator")),
            identity_grace,
            orphans: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Create a context with custom client implementations, for tests
    pub fn with_clients(
        kube: Arc<dyn KubeApi>,
        admin: Arc<dyn AdminClientFactory>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            admin,
            events,
            identity_grace: DEFAULT_IDENTITY_GRACE,
            orphans: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record the currently observed orphaned placement ids for a cluster
    /// and return the subset whose grace period has expired.
    ///
    /// Ids that disappeared since the last pass are forgotten, so a pod
    /// coming back re-arms the grace window.
    pub fn expired_orphans(&self, cluster_key: &str, current: &[String]) -> HashSet<String> {
        let mut map = self.orphans.lock().expect("orphan lock poisoned");
        let entry = map.entry(cluster_key.to_string()).or_default();

        entry.retain(|id, _| current.iter().any(|c| c == id));
        let now = Instant::now();
        for id in current {
            entry.entry(id.clone()).or_insert(now);
        }

        entry
            .iter()
            .filter(|(_, first_seen)| now.duration_since(**first_seen) >= self.identity_grace)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drop all orphan tracking state for a cluster
    pub fn forget_cluster(&self, cluster_key: &str) {
        self.orphans
            .lock()
            .expect("orphan lock poisoned")
            .remove(cluster_key);
        self.failures
            .lock()
            .expect("failure lock poisoned")
            .remove(cluster_key);
    }

    /// Increment and return the consecutive failure count for a cluster
    pub fn record_failure(&self, cluster_key: &str) -> u32 {
        let mut map = self.failures.lock().expect("failure lock poisoned");
        let count = map.entry(cluster_key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Current consecutive failure count for a cluster
    pub fn failure_count(&self, cluster_key: &str) -> u32 {
        self.failures
            .lock()
            .expect("failure lock poisoned")
            .get(cluster_key)
            .copied()
            .unwrap_or(0)
    }

    /// Reset the failure count after a successful pass
    pub fn reset_failures(&self, cluster_key: &str) {
        self.failures
            .lock()
            .expect("failure lock poisoned")
            .remove(cluster_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::MockAdminClient;
    use crate::events::NoopEventPublisher;

    fn test_context(grace: Duration) -> Context {
        let mut ctx = Context::with_clients(
            Arc::new(MockKubeApi::new()),
            Arc::new(FixedAdminFactory::new(Arc::new(MockAdminClient::new()))),
            Arc::new(NoopEventPublisher),
        );
        ctx.identity_grace = grace;
        ctx
    }

    #[test]
    fn orphans_expire_only_after_grace() {
        let ctx = test_context(Duration::from_secs(3600));
        let expired = ctx.expired_orphans("ns/c", &["stale-id".to_string()]);
        assert!(expired.is_empty());

        // zero grace expires immediately
        let ctx = test_context(Duration::ZERO);
        let expired = ctx.expired_orphans("ns/c", &["stale-id".to_string()]);
        assert!(expired.contains("stale-id"));
    }

    #[test]
    fn vanished_orphans_rearm_the_grace_window() {
        let ctx = test_context(Duration::from_secs(3600));
        ctx.expired_orphans("ns/c", &["stale-id".to_string()]);
        // id disappears for a pass, tracking is dropped
        let expired = ctx.expired_orphans("ns/c", &[]);
        assert!(expired.is_empty());
        let map = ctx.orphans.lock().unwrap();
        assert!(map.get("ns/c").unwrap().is_empty());
    }

    #[test]
    fn failure_counts_accumulate_and_reset() {
        let ctx = test_context(Duration::ZERO);
        assert_eq!(ctx.record_failure("ns/c"), 1);
        assert_eq!(ctx.record_failure("ns/c"), 2);
        assert_eq!(ctx.failure_count("ns/c"), 2);
        ctx.reset_failures("ns/c");
        assert_eq!(ctx.failure_count("ns/c"), 0);
    }
}
