//! searchop - Kubernetes operator reconciling search clusters and their settings

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, Resource};

use searchop_common::crd::{SearchCluster, SearchConfig};
use searchop_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use searchop_common::{DEFAULT_REQUEST_TIMEOUT_SECS, OPERATOR_VERSION};

/// searchop - CRD-driven operator for search clusters
#[derive(Parser, Debug)]
#[command(name = "searchop", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    settings: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Only watch resources in this namespace (default: all namespaces)
    #[arg(long, env = "SEARCHOP_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Deadline in seconds for each request to a managed cluster
    #[arg(
        long,
        env = "SEARCHOP_REQUEST_TIMEOUT_SECS",
        default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS,
        global = true
    )]
    request_timeout_secs: u64,

    /// Log line format: json or text
    #[arg(long, env = "SEARCHOP_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the SearchCluster and SearchConfig controllers (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print_crds()?;
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.settings.log_format,
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controllers(cli.settings).await,
    }
}

fn print_crds() -> anyhow::Result<()> {
    let cluster = serde_yaml::to_string(&SearchCluster::crd())
        .map_err(|e| anyhow::anyhow!("Failed to serialize SearchCluster CRD: {}", e))?;
    let config = serde_yaml::to_string(&SearchConfig::crd())
        .map_err(|e| anyhow::anyhow!("Failed to serialize SearchConfig CRD: {}", e))?;
    println!("{cluster}---\n{config}");
    Ok(())
}

fn watched<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn run_controllers(settings: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let request_timeout = Duration::from_secs(settings.request_timeout_secs);
    tracing::info!(
        version = OPERATOR_VERSION,
        namespace = settings.namespace.as_deref().unwrap_or("*"),
        request_timeout_secs = settings.request_timeout_secs,
        "Starting searchop controllers"
    );

    let cluster_ctx = Arc::new(
        searchop_cluster::Context::builder(client.clone())
            .request_timeout(request_timeout)
            .build(),
    );
    let config_ctx = Arc::new(
        searchop_config::Context::builder(client.clone())
            .request_timeout(request_timeout)
            .build(),
    );

    let clusters: Api<SearchCluster> = watched(&client, settings.namespace.as_deref());
    let configs: Api<SearchConfig> = watched(&client, settings.namespace.as_deref());

    let cluster_controller = Controller::new(clusters, WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            searchop_cluster::reconcile,
            searchop_cluster::error_policy,
            cluster_ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "SearchCluster reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "SearchCluster reconciliation error");
                }
            }
        });

    let config_controller = Controller::new(configs, WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            searchop_config::reconcile,
            searchop_config::error_policy,
            config_ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "SearchConfig reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "SearchConfig reconciliation error");
                }
            }
        });

    tokio::select! {
        _ = cluster_controller => {
            tracing::info!("SearchCluster controller completed");
        }
        _ = config_controller => {
            tracing::info!("SearchConfig controller completed");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn controller_is_the_default_mode() {
        let cli = Cli::try_parse_from(["searchop"]).expect("cli should parse");
        assert!(cli.command.is_none());
        assert!(!cli.crd);
    }

    #[test]
    fn settings_are_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "searchop",
            "controller",
            "--namespace",
            "search",
            "--request-timeout-secs",
            "30",
            "--log-format",
            "text",
        ])
        .expect("cli should parse");
        assert!(matches!(cli.command, Some(Commands::Controller)));
        assert_eq!(cli.settings.namespace.as_deref(), Some("search"));
        assert_eq!(cli.settings.request_timeout_secs, 30);
        assert_eq!(cli.settings.log_format, LogFormat::Text);
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(Cli::try_parse_from(["searchop", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn crds_serialize() {
        assert!(print_crds().is_ok());
    }
}
