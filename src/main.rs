//! Fanout channel - controller and dispatcher for HTTP fan-out channels

use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fanout_channel::config::{ControllerConfig, DispatcherConfig};
use fanout_channel::controller::{run_channel_controller, Context};
use fanout_channel::crd::FanoutChannel;
use fanout_channel::dispatcher::run_dispatcher;
use fanout_channel::retry::{retry_with_backoff, RetryConfig};
use fanout_channel::{CONTROLLER_NAME, DISPATCHER_COMPONENT};

/// Fanout channel - Kubernetes control plane for HTTP fan-out channels
#[derive(Parser, Debug)]
#[command(name = "fanout-channel", version, about, long_about = None)]
struct Cli {
    /// Print the FanoutChannel CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the channel controller
    ///
    /// Checks the shared dispatcher, owns each channel's ExternalName
    /// Service and assigns channel addresses.
    Controller(ControllerConfig),

    /// Run a dispatcher replica
    ///
    /// Keeps the routing table in sync with ready channels and serves the
    /// HTTP ingress. The Lease holder also reports subscriber status.
    Dispatcher(DispatcherConfig),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&FanoutChannel::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(config)) => run_controller(config).await,
        Some(Commands::Dispatcher(config)) => run_dispatcher_process(config).await,
        None => Err(anyhow::anyhow!(
            "no command given, expected `controller` or `dispatcher` (or --crd)"
        )),
    }
}

/// Install or update the FanoutChannel CRD with server-side apply
///
/// Retried because the API server may still be coming up when the pod starts.
async fn ensure_crd_installed(client: &Client, field_manager: &str) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();
    let crd = FanoutChannel::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    tracing::info!(crd = %name, "Installing FanoutChannel CRD...");
    retry_with_backoff(
        &RetryConfig::with_max_attempts(5),
        "install FanoutChannel CRD",
        || async { crds.patch(&name, &params, &Patch::Apply(&crd)).await },
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install FanoutChannel CRD: {}", e))?;

    tracing::info!("FanoutChannel CRD installed/updated");
    Ok(())
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid controller configuration: {}", e))?;
    tracing::info!(
        image = config.dispatcher_image.as_deref().unwrap_or_default(),
        namespace = %config.system_namespace,
        "FanoutChannel controller starting..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client, CONTROLLER_NAME).await?;

    let ctx = Arc::new(
        Context::builder(client.clone())
            .system_namespace(config.system_namespace)
            .cluster_domain(config.cluster_domain)
            .build(),
    );

    run_channel_controller(client, ctx).await;
    tracing::info!("FanoutChannel controller stopped");
    Ok(())
}

async fn run_dispatcher_process(config: DispatcherConfig) -> anyhow::Result<()> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid dispatcher configuration: {}", e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client, DISPATCHER_COMPONENT).await?;

    run_dispatcher(client, config)
        .await
        .map_err(|e| anyhow::anyhow!("Dispatcher failed: {}", e))
}
