use std::{sync::Arc, time::Duration};

use clap::{crate_description, crate_version, Parser};
use opensearch_operator::{
    crd::Opensearch,
    metrics::Metrics,
    opensearch_controller,
    pki::{
        RenewalPolicy, DEFAULT_CERTIFICATE_VALIDITY, DEFAULT_KEY_BIT_SIZE,
        DEFAULT_RENEWAL_SLACK_RATIO,
    },
    tls::ReconcilerConfig,
    OPERATOR_NAME,
};
use stackable_operator::{
    kube::CustomResourceExt, logging::TracingTarget, namespace::WatchNamespace,
};
use tracing::info;

pub const APP_NAME: &str = "opensearch";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<OpensearchOperatorRun>,
}

#[derive(clap::Parser)]
struct OpensearchOperatorRun {
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,

    /// Namespace to watch, every namespace when empty
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// Lifetime of newly issued CA and leaf certificates
    #[arg(
        long,
        env,
        default_value_t = DEFAULT_CERTIFICATE_VALIDITY.whole_days(),
        value_parser = clap::value_parser!(i64).range(1..=MAX_CERTIFICATE_VALIDITY_DAYS),
    )]
    pub certificate_validity_days: i64,

    /// Certificates are renewed once their remaining lifetime drops below this share
    /// of the validity, between 0 and 1
    #[arg(long, env, default_value_t = DEFAULT_RENEWAL_SLACK_RATIO, value_parser = parse_ratio)]
    pub renewal_slack_ratio: f64,

    #[arg(
        long,
        env,
        default_value_t = DEFAULT_KEY_BIT_SIZE,
        value_parser = clap::value_parser!(u32).range(1024..=16384),
    )]
    pub key_bit_size: u32,

    /// Delay before looking again at a user provided secret that is not usable yet
    #[arg(long, env, default_value_t = 60)]
    pub requeue_seconds: u64,
}

/// A hundred years, well within what certificate times can represent.
const MAX_CERTIFICATE_VALIDITY_DAYS: i64 = 36_500;

fn parse_ratio(input: &str) -> Result<f64, String> {
    let ratio: f64 = input.parse().map_err(|err| format!("{err}"))?;
    if (0.0..=1.0).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(format!("{ratio} is not between 0 and 1"))
    }
}

impl OpensearchOperatorRun {
    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            policy: RenewalPolicy::with_slack_ratio(
                time::Duration::days(self.certificate_validity_days),
                self.renewal_slack_ratio,
                self.key_bit_size,
            ),
            requeue: Duration::from_secs(self.requeue_seconds),
        }
    }
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        stackable_operator::cli::Command::Crd => {
            print!("{}", serde_yaml::to_string(&Opensearch::crd())?);
        }
        stackable_operator::cli::Command::Run(run) => {
            stackable_operator::logging::initialize_logging(
                "OPENSEARCH_OPERATOR_LOG",
                APP_NAME,
                run.tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            let config = run.reconciler_config();
            info!(
                validity_days = run.certificate_validity_days,
                renewal_slack = %config.policy.slack,
                key_bit_size = config.policy.key_bit_size,
                "certificate policy"
            );
            let client =
                stackable_operator::client::create_client(Some(OPERATOR_NAME.to_string()))
                    .await?;
            opensearch_controller::start(
                &client,
                &run.watch_namespace,
                config,
                Arc::new(Metrics::new()),
            )
            .await;
        }
    }
    Ok(())
}
