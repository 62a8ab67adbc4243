use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use sigstore_k8s::config::OperatorConfig;
use sigstore_k8s::controller::conditions::ready_reason;
use sigstore_k8s::controller::{self, ActionContext, KubeEventRecorder};
use sigstore_k8s::crd::{CTlog, ManagedResource, Rekor, Trillian};
use sigstore_k8s::store::KubeStore;
use sigstore_k8s::{leader_election, telemetry, Error};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the managed resources and their Ready state
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// TOML configuration file
    #[arg(long, env = "OPERATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Operator namespace (holds the leader election lease)
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    namespace: Option<String>,

    /// Only watch resources in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Consecutive errors absorbed before a resource is marked Failure
    #[arg(long, env = "RECOVERY_THRESHOLD")]
    recovery_threshold: Option<i64>,

    /// Image of the one-shot tree creation workload
    #[arg(long, env = "TREE_JOB_IMAGE")]
    tree_job_image: Option<String>,
}

impl RunArgs {
    /// File config (or defaults) with command line and environment overrides applied
    fn operator_config(&self) -> Result<OperatorConfig, Error> {
        let mut config = match &self.config {
            Some(path) => OperatorConfig::load(path)?,
            None => OperatorConfig::default(),
        };
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(watch) = &self.watch_namespace {
            config.watch_namespace = Some(watch.clone());
        }
        if let Some(threshold) = self.recovery_threshold {
            config.recovery_threshold = threshold;
        }
        if let Some(image) = &self.tree_job_image {
            config.images.create_tree = image.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace to inspect; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Sigstore-K8s Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn print_kind<K>(client: &kube::Client, namespace: Option<&str>) -> Result<(), Error>
where
    K: ManagedResource + kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
{
    let api: Api<K> = match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let items = api.list(&ListParams::default()).await?;
    println!("{} ({})", K::kind(&()), items.items.len());
    for obj in &items.items {
        let reason = ready_reason(obj)
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}/{}  {}",
            obj.namespace().unwrap_or_default(),
            obj.name_any(),
            reason
        );
    }
    Ok(())
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;
    let namespace = args.namespace.as_deref();
    print_kind::<Trillian>(&client, namespace).await?;
    print_kind::<Rekor>(&client, namespace).await?;
    print_kind::<CTlog>(&client, namespace).await?;
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    telemetry::init_telemetry(&telemetry::TelemetryConfig::from_env())?;

    let config = Arc::new(args.operator_config()?);
    info!(
        "Starting Sigstore-K8s Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let identity = leader_election::holder_identity();
    info!("Leader election using holder ID: {}", identity);

    let is_leader = Arc::new(AtomicBool::new(false));
    tokio::spawn(leader_election::run_leader_election(
        client.clone(),
        config.namespace.clone(),
        config.lease_name.clone(),
        identity,
        Arc::clone(&is_leader),
    ));

    let ctx = ActionContext::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(KubeEventRecorder::new(client.clone())),
        config.clone(),
    );
    let state = Arc::new(controller::ControllerState {
        client,
        config,
        is_leader,
        ctx,
    });

    let result = controller::run_controller(state).await;

    // Flush any remaining traces
    telemetry::shutdown_telemetry();

    result
}
