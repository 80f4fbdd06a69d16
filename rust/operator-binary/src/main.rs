use std::time::Duration;

use clap::{crate_description, crate_version, Parser};
use stackable_operator::{
    cli::Command,
    client,
    kube::CustomResourceExt as _,
    logging,
    namespace::WatchNamespace,
    utils::{cluster_info::KubernetesClusterInfoOpts, print_startup_string},
};

use crate::crd::StrimziSchemaRegistry;

mod backoff;
mod bootstrap;
mod crd;
mod credentials;
mod format;
mod reconciler;
mod resources;
mod utils;
mod watch;

pub const OPERATOR_NAME: &str = "strimzi-registry-operator";
pub const APP_NAME: &str = "strimzi-registry-operator";
pub const ENV_VAR_LOGGING: &str = "STRIMZI_REGISTRY_OPERATOR_LOG";

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command<RegistryOperatorRun>,
}

#[derive(clap::Parser)]
struct RegistryOperatorRun {
    /// Namespace to watch for StrimziSchemaRegistry resources, all namespaces if empty
    #[arg(long, env, default_value = "")]
    watch_namespace: WatchNamespace,
    /// Name of the Strimzi Kafka cluster whose registries this instance manages
    #[arg(long, env)]
    kafka_cluster: String,
    /// Interval between full resyncs of every registry
    #[arg(long, env, default_value_t = 300)]
    resync_interval_seconds: u64,
    #[arg(long, env, default_value_t = 30)]
    api_timeout_seconds: u64,
    #[arg(long, env, default_value_t = 16)]
    max_concurrent_reconciles: u16,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: logging::TracingTarget,
    #[command(flatten)]
    pub cluster_info_opts: KubernetesClusterInfoOpts,
}

/// Settings of one operator process, fixed at startup.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    pub watch_namespace: WatchNamespace,
    pub kafka_cluster: String,
    pub resync_interval: Duration,
    pub api_timeout: Duration,
    pub max_concurrent_reconciles: u16,
}

impl From<&RegistryOperatorRun> for OperatorConfig {
    fn from(run: &RegistryOperatorRun) -> Self {
        Self {
            watch_namespace: run.watch_namespace.clone(),
            kafka_cluster: run.kafka_cluster.clone(),
            resync_interval: Duration::from_secs(run.resync_interval_seconds.max(1)),
            api_timeout: Duration::from_secs(run.api_timeout_seconds.max(1)),
            max_concurrent_reconciles: run.max_concurrent_reconciles,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&StrimziSchemaRegistry::crd())?);
        }
        Command::Run(run) => {
            logging::initialize_logging(ENV_VAR_LOGGING, APP_NAME, run.tracing_target);
            print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET,
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );

            let config = OperatorConfig::from(&run);
            let client =
                client::initialize_operator(Some(OPERATOR_NAME.to_string()), &run.cluster_info_opts)
                    .await?;
            watch::start(&client, config).await;
        }
    }
    Ok(())
}
