//! pcp-live - live metric poller for Performance Co-Pilot
//!
//! Connects to pmproxy (or pmwebd), polls the requested metrics and prints
//! their time series as JSON lines.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use pcp_live::{Context, DataStore, HttpTransport, LiveConfig, PmapiSrv, PollSrv, TimeRange, now_millis};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_URL: &str = "http://localhost:44322";

#[derive(Parser)]
#[command(name = "pcp-live")]
#[command(about = "Live metric poller for Performance Co-Pilot")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct ConnectArgs {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend URL, overrides the config file
    #[arg(long, env = "PCP_LIVE_URL")]
    url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll metrics and print their series after every poll
    Watch {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Stop after this many polls
        #[arg(long)]
        count: Option<u64>,

        /// Metric names
        #[arg(required = true)]
        metrics: Vec<String>,
    },

    /// Show metric metadata
    Metadata {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Metric names
        #[arg(required = true)]
        metrics: Vec<String>,
    },

    /// List the namespace below a prefix
    Children {
        #[command(flatten)]
        connect: ConnectArgs,

        /// Namespace prefix
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "pcp-live.json")]
        output: PathBuf,

        /// Backend URL
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(cli.log_json.then(|| fmt::layer().json()))
        .with((!cli.log_json).then(fmt::layer))
        .with(EnvFilter::from_default_env().add_directive("pcp_live=info".parse()?))
        .init();

    match cli.command {
        Commands::Watch {
            connect,
            count,
            metrics,
        } => {
            watch(&load_config(&connect)?, &metrics, count).await?;
        }

        Commands::Metadata { connect, metrics } => {
            let pmapi = connect_pmapi(&load_config(&connect)?)?;
            let metadatas = pmapi.get_metric_metadatas(&metrics).await?;
            for name in &metrics {
                match metadatas.get(name) {
                    Some(metadata) => println!("{}", serde_json::to_string_pretty(metadata)?),
                    None => println!("{name}: unknown metric"),
                }
            }
        }

        Commands::Children { connect, prefix } => {
            let pmapi = connect_pmapi(&load_config(&connect)?)?;
            let children = pmapi.get_children(&prefix).await?;
            for name in &children.nonleaf {
                println!("{name}.");
            }
            for name in &children.leaf {
                println!("{name}");
            }
        }

        Commands::InitConfig { output, url } => {
            let config = LiveConfig::new(url);
            config.validate()?;
            config.save(&output)?;
            println!("Config written to {}", output.display());
        }
    }

    Ok(())
}

/// Resolves the configuration from a file, a URL override or the default.
fn load_config(args: &ConnectArgs) -> anyhow::Result<LiveConfig> {
    let mut config = match &args.config {
        Some(path) => LiveConfig::from_file(path)?,
        None => LiveConfig::new(DEFAULT_URL),
    };
    if let Some(url) = &args.url {
        config.url.clone_from(url);
    }
    config.validate()?;
    Ok(config)
}

fn connect_pmapi(config: &LiveConfig) -> anyhow::Result<Arc<PmapiSrv>> {
    let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
    let context = Context::new(transport, config.context_config());
    Ok(Arc::new(PmapiSrv::new(context)))
}

async fn watch(config: &LiveConfig, metrics: &[String], count: Option<u64>) -> anyhow::Result<()> {
    info!(url = %config.url, metrics = ?metrics, "starting poller");

    let pmapi = connect_pmapi(config)?;
    let datastore = Arc::new(DataStore::new(pmapi.clone(), config.data_max_age()));
    let poll = PollSrv::new(pmapi, datastore.clone(), config.poll_max_age());
    let window = config.data_max_age().as_millis() as i64;

    let mut poll_tick = tokio::time::interval(config.poll_interval());
    let mut clean_tick = tokio::time::interval(config.poll_max_age());
    // the first tick completes immediately
    clean_tick.tick().await;

    let mut polls = 0;
    loop {
        tokio::select! {
            _ = poll_tick.tick() => {
                if let Err(e) = poll_once(&poll, metrics).await {
                    warn!(error = %e, "poll failed");
                    continue;
                }
                let range = TimeRange::since(now_millis() - window);
                let series = datastore.query_time_series(metrics, range);
                println!("{}", serde_json::to_string(&series)?);

                polls += 1;
                if count.is_some_and(|limit| polls >= limit) {
                    break;
                }
            }
            _ = clean_tick.tick() => {
                datastore.clean_expired_metrics();
                poll.clean_expired_metrics();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn poll_once(poll: &PollSrv, metrics: &[String]) -> pcp_live::Result<()> {
    poll.ensure_polling(metrics).await?;
    poll.poll().await
}
