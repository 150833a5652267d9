use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, crate_description, crate_version};
use stackable_operator::{
    cli::Command,
    kube::{CustomResourceExt, runtime::controller},
    logging::TracingTarget,
    namespace::WatchNamespace,
    utils::cluster_info::KubernetesClusterInfoOpts,
};
use stackable_pki_client::{PkiConnector, RestConnector};

mod certificate_request_controller;
mod crd;
mod external_crd;
#[cfg(test)]
mod fake;
mod issuer;
mod issuer_controller;
mod status;
mod store;
mod utils;

pub const APP_NAME: &str = "pki-issuer";
pub const OPERATOR_NAME: &str = "pki.stackable.tech";
const ENV_VAR_LOGGING: &str = "PKI_ISSUER_OPERATOR_LOG";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command<PkiIssuerOperatorRun>,
}

#[derive(clap::Parser)]
struct PkiIssuerOperatorRun {
    /// Only reconcile objects in this namespace, all namespaces are watched if empty
    #[arg(long, env, default_value = "")]
    watch_namespace: WatchNamespace,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
    /// Maximum number of objects that each controller reconciles at the same time
    #[arg(long, env, default_value_t = 16)]
    max_concurrent_reconciles: u16,
    #[command(flatten)]
    pub cluster_info_opts: KubernetesClusterInfoOpts,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            for crd in [crd::Issuer::crd(), crd::ClusterIssuer::crd()] {
                let yaml = serde_yaml::to_string(&crd).context("failed to serialize CRD")?;
                print!("---\n{yaml}");
            }
        }
        Command::Run(PkiIssuerOperatorRun {
            watch_namespace,
            tracing_target,
            max_concurrent_reconciles,
            cluster_info_opts,
        }) => {
            stackable_operator::logging::initialize_logging(
                ENV_VAR_LOGGING,
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET,
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            let client = stackable_operator::client::initialize_operator(
                Some(OPERATOR_NAME.to_string()),
                &cluster_info_opts,
            )
            .await?;
            let connector: Arc<dyn PkiConnector> =
                Arc::new(RestConnector::new().context("failed to build PKI client")?);
            let config = controller::Config::default().concurrency(max_concurrent_reconciles);
            futures::future::join(
                certificate_request_controller::start(
                    &client,
                    &watch_namespace,
                    connector.clone(),
                    config.clone(),
                ),
                issuer_controller::start(&client, &watch_namespace, connector, config),
            )
            .await;
        }
    }
    Ok(())
}
