mod config;

use clap::{Args, Parser};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use proxy::ProxyError;
use proxy::rule_store::StoreError;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "sitegate", about = "Rule-driven request router for static sites")]
enum CliCommand {
    /// Serve site traffic according to the configured proxy rules
    Proxy(ConfigArgs),
    /// Validate the config file, including every proxy rule, and exit
    CheckConfig(ConfigArgs),
    /// Print the cookie-to-bearer bindings the edge tier has to render
    EdgeContract(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config_file: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("config file has no proxy section")]
    MissingProxyConfig,
    #[error("invalid proxy config: {0}")]
    InvalidProxyConfig(#[from] proxy::config::ValidationError),
    #[error(transparent)]
    RuleStore(#[from] StoreError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("could not render edge contract: {0}")]
    Json(#[from] serde_json::Error),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
}

fn main() {
    let cli = CliCommand::parse();

    if let Err(e) = cli_main(cli) {
        eprintln!("sitegate: {e}");
        process::exit(1);
    }
}

fn cli_main(cli: CliCommand) -> Result<(), CliError> {
    match cli {
        CliCommand::Proxy(args) => {
            let config = Config::from_file(&args.config_file)?;
            let proxy_config = config.proxy.ok_or(CliError::MissingProxyConfig)?;
            proxy_config.validate()?;

            let _sentry = init_logging(config.common.logging.as_ref());
            if let Some(metrics) = &config.common.metrics {
                init_metrics(metrics)?;
            }

            tracing::info!(
                rule_sets = proxy_config.rule_sets.len(),
                hosts = proxy_config.hosts.len(),
                "Starting proxy"
            );
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(proxy::run(proxy_config))?;
        }
        CliCommand::CheckConfig(args) => {
            let config = Config::from_file(&args.config_file)?;
            let proxy_config = config.proxy.ok_or(CliError::MissingProxyConfig)?;
            proxy_config.validate()?;

            let store = proxy::build_rule_store(&proxy_config)?;
            let rule_sets = store.rule_sets();
            let rules: usize = rule_sets.iter().map(|r| r.rules().len()).sum();
            println!(
                "{}: ok ({} rule sets, {} rules, {} hosts)",
                args.config_file.display(),
                rule_sets.len(),
                rules,
                proxy_config.hosts.len()
            );
        }
        CliCommand::EdgeContract(args) => {
            let config = Config::from_file(&args.config_file)?;
            let proxy_config = config.proxy.ok_or(CliError::MissingProxyConfig)?;
            proxy_config.validate()?;

            let store = proxy::build_rule_store(&proxy_config)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&proxy::edge_contract(&store))?
            );
        }
    }
    Ok(())
}

/// Installs the tracing subscriber, forwarding events to Sentry when a DSN is set.
fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging.map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(guard.is_some().then(sentry::integrations::tracing::layer))
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some("sitegate"))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder)
        .map_err(|_| CliError::Metrics("a metrics recorder is already installed".into()))?;

    shared::metrics_defs::describe_all(proxy::metrics_defs::ALL_METRICS);
    Ok(())
}
