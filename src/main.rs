//! M3DB Operator - Kubernetes operator for M3DB cluster lifecycle management

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use m3db_operator::controller::{error_policy, reconcile, Context};
use m3db_operator::crd::M3DBCluster;
use m3db_operator::leader::{LeaderElection, Leadership};

/// M3DB Operator - drives M3DB clusters toward their declared topology
#[derive(Parser, Debug)]
#[command(name = "m3db-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Namespace holding the leader-election lease
    #[arg(long, env = "LEASE_NAMESPACE", default_value = "default")]
    lease_namespace: String,

    /// Identity for leader election; defaults to the pod name
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,

    /// Disable leader election (single-replica deployments)
    #[arg(long)]
    no_leader_election: bool,

    /// Grace period in seconds before an orphaned placement identity
    /// becomes a removal candidate
    #[arg(long, env = "IDENTITY_GRACE_SECS", default_value = "300")]
    identity_grace_secs: u64,

    /// Override the coordinator admin URL for every cluster (development)
    #[arg(long, env = "ADMIN_URL")]
    admin_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&M3DBCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let ctx = Arc::new(Context::new(
        client.clone(),
        cli.admin_url.clone(),
        Duration::from_secs(cli.identity_grace_secs),
    ));

    let clusters: Api<M3DBCluster> = match &cli.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let stateful_sets: Api<StatefulSet> = match &cli.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let services: Api<Service> = match &cli.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let config_maps: Api<ConfigMap> = match &cli.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let pods: Api<Pod> = match &cli.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    tracing::info!("Starting M3DBCluster controller...");

    // Child events enqueue the owning cluster: directly-owned kinds via
    // owner references, pods (owned by their StatefulSet) via the cluster
    // label carried on every database pod
    let controller = Controller::new(clusters, WatcherConfig::default())
        .owns(stateful_sets, WatcherConfig::default())
        .owns(services, WatcherConfig::default())
        .owns(config_maps, WatcherConfig::default())
        .watches(pods, WatcherConfig::default(), |pod: Pod| {
            let namespace = pod.metadata.namespace.clone()?;
            let cluster = pod
                .metadata
                .labels
                .as_ref()?
                .get(m3db_operator::LABEL_CLUSTER)?
                .clone();
            Some(ObjectRef::<M3DBCluster>::new(&cluster).within(&namespace))
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, action)) => {
                    tracing::debug!(cluster = %object.name, ?action, "Reconciliation completed");
                }
                Err(e) => {
                    tracing::debug!(error = ?e, "Reconciliation error");
                }
            }
        });

    if cli.no_leader_election {
        controller.await;
    } else {
        // Only the lease holder polls the queue; the controller future is
        // not started until the lease is won
        let identity = cli
            .identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "m3db-operator".to_string());
        let election = LeaderElection::new(client.clone(), &cli.lease_namespace, &identity);
        match election.lead(controller).await {
            Leadership::Completed(()) => {}
            Leadership::Lost => {
                tracing::error!(
                    "coordination lease lost; exiting before issuing further placement writes"
                );
                std::process::exit(1);
            }
        }
    }

    tracing::info!("M3DB operator shutting down");
    Ok(())
}
