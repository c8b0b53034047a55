//! Trustee Operator - deploys the Trustee attestation services from KbsConfig resources

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Config, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trustee_operator::config::{
    Images, OperatorConfig, DEFAULT_AS_IMAGE, DEFAULT_KBS_IMAGE, DEFAULT_OPERATOR_NAMESPACE,
    DEFAULT_RVPS_IMAGE,
};
use trustee_operator::controller::{error_policy, reconcile, Context};
use trustee_operator::crd::KbsConfig;
use trustee_operator::filter::{affected_records, ChangeEvent, NamespacePredicate};

/// Server-side watch timeout, kept below the client read timeout so idle
/// watches are renewed instead of failing with "body read timed out".
const WATCH_TIMEOUT_SECS: u32 = 25;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Trustee Operator - reconciles KbsConfig resources into a running Trustee deployment
#[derive(Parser, Debug)]
#[command(name = "trustee-operator", version, about, long_about = None)]
struct Cli {
    /// Print the KbsConfig CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Namespace whose ConfigMap and Secret changes trigger reconciles
    #[arg(long, env = "POD_NAMESPACE", default_value = DEFAULT_OPERATOR_NAMESPACE)]
    namespace: String,

    /// Key broker service image
    #[arg(long, env = "KBS_IMAGE_NAME", default_value = DEFAULT_KBS_IMAGE)]
    kbs_image: String,

    /// Attestation service image
    #[arg(long, env = "AS_IMAGE_NAME", default_value = DEFAULT_AS_IMAGE)]
    as_image: String,

    /// Reference value provider service image
    #[arg(long, env = "RVPS_IMAGE_NAME", default_value = DEFAULT_RVPS_IMAGE)]
    rvps_image: String,

    /// Maximum number of KbsConfigs reconciled at the same time
    #[arg(long, default_value_t = 4)]
    concurrency: u16,
}

impl Cli {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig::default()
            .with_namespace(self.namespace.clone())
            .with_images(Images {
                kbs: self.kbs_image.clone(),
                attestation_service: self.as_image.clone(),
                rvps: self.rvps_image.clone(),
            })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&KbsConfig::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller(cli).await
}

/// Build a client from the ambient configuration with explicit timeouts
async fn create_client() -> anyhow::Result<Client> {
    let mut config = Config::infer()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to infer Kubernetes config: {}", e))?;
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    Client::try_from(config).map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let config = cli.operator_config();
    tracing::info!(
        namespace = %config.namespace,
        kbs_image = %config.images.kbs,
        concurrency = cli.concurrency,
        "Trustee operator starting"
    );

    let client = create_client().await?;
    let ctx = Arc::new(Context::builder(client.clone()).config(config.clone()).build());

    let kbs_configs: Api<KbsConfig> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());
    // Only artifacts in the operator namespace can wake a record, so there is
    // no point streaming the rest of the cluster.
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &config.namespace);
    let secrets: Api<Secret> = Api::namespaced(client, &config.namespace);

    let watcher_config = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let predicate = NamespacePredicate::new(config.namespace.clone());

    let controller = Controller::new(kbs_configs, watcher_config())
        .with_config(controller::Config::default().concurrency(cli.concurrency));
    let store = controller.store();

    let cm_store = store.clone();
    let cm_predicate = predicate.clone();
    let secret_store = store;
    let secret_predicate = predicate;

    controller
        .owns(deployments, watcher_config())
        .owns(services, watcher_config())
        .watches(config_maps, watcher_config(), move |cm| {
            affected_records(&cm_store, &cm_predicate, &ChangeEvent::Generic(&cm))
        })
        .watches(secrets, watcher_config(), move |secret| {
            affected_records(&secret_store, &secret_predicate, &ChangeEvent::Generic(&secret))
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("KbsConfig"))
        .await;

    tracing::info!("Trustee operator stopped");
    Ok(())
}
