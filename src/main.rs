use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod shared;
mod domain;
mod ports;
mod infrastructure;
mod services;

use domain::value_objects::NameFilter;
use infrastructure::git::Git2MirrorClient;
use infrastructure::hosting::RestHostingClient;
use services::scheduler::{BatchSettings, SyncOrchestrator};
use shared::config::{Config, EndpointConfig, FileConfig, MirrorConfig, SyncConfig};
use shared::error::MirrorError;
use shared::result::Result;


#[derive(Parser, Debug)]
#[clap(name = "orgmirror")]
#[clap(version = "0.1.0")]
#[clap(about = "Mirror every repository of an organization to another hosting instance")]
pub struct Args {
    /// Source instance URL, e.g. https://github.example.com
    #[clap(long, value_name = "URL")]
    source_url: String,

    /// Source access token
    #[clap(long, env = "ORGMIRROR_SOURCE_TOKEN", hide_env_values = true)]
    source_token: String,

    /// Source organization
    #[clap(long, value_name = "ORG")]
    source_org: String,

    /// Destination instance URL
    #[clap(long, value_name = "URL")]
    dest_url: String,

    /// Destination access token
    #[clap(long, env = "ORGMIRROR_DEST_TOKEN", hide_env_values = true)]
    dest_token: String,

    /// Destination organization
    #[clap(long, value_name = "ORG")]
    dest_org: String,

    /// Directory holding the local bare mirrors (one per repository)
    #[clap(long, value_parser, value_name = "PATH")]
    cache_path: PathBuf,

    /// Comma-separated allow-list of repository names
    #[clap(long, value_name = "NAMES")]
    repos: Option<NameFilter>,

    /// Source API root, derived from --source-url when omitted
    #[clap(long, value_name = "URL")]
    source_api_url: Option<String>,

    /// Destination API root, derived from --dest-url when omitted
    #[clap(long, value_name = "URL")]
    dest_api_url: Option<String>,

    /// TOML file with [sync] tunables
    #[clap(short, long, value_parser, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Per-repository sync timeout in seconds
    #[clap(long)]
    repo_timeout_secs: Option<u64>,

    /// Delay between two batches in seconds
    #[clap(long)]
    cycle_delay_secs: Option<u64>,

    /// Number of repositories synced at once
    #[clap(long)]
    concurrency: Option<usize>,

    /// Emit logs as JSON lines
    #[clap(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.pretty().init();
    }
}

fn build_config(args: Args) -> Result<Config> {
    let file_config = match &args.config {
        Some(path) => FileConfig::from_file(path)?,
        None => FileConfig::default(),
    };
    let sync: SyncConfig = file_config.sync.with_overrides(
        args.repo_timeout_secs,
        args.cycle_delay_secs,
        args.concurrency,
    )?;

    Ok(Config {
        source: EndpointConfig::new(
            &args.source_url,
            args.source_api_url.as_deref(),
            args.source_token,
            args.source_org,
        )?,
        destination: EndpointConfig::new(
            &args.dest_url,
            args.dest_api_url.as_deref(),
            args.dest_token,
            args.dest_org,
        )?,
        mirror: MirrorConfig {
            cache_path: args.cache_path,
            repos: args.repos,
        },
        sync,
    })
}

/// Ctrl-C 或 SIGTERM 时触发关闭
fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Termination requested");
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    // 加载配置
    let config = build_config(args)?;
    info!("Configuration loaded: {:?}", config);

    let http = reqwest::Client::builder()
        .user_agent(concat!("orgmirror/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(MirrorError::Http)?;

    // 源端和目标端各用一个独立的客户端，配置在启动后不再变化
    let source = Arc::new(RestHostingClient::new(http.clone(), config.source.clone()));
    let destination = Arc::new(RestHostingClient::new(http, config.destination.clone()));
    let git = Arc::new(Git2MirrorClient::new(Some(config.source.token.clone())));

    let orchestrator = Arc::new(SyncOrchestrator::new(
        BatchSettings::from_config(&config),
        source,
        destination,
        git,
    ));

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    orchestrator
        .run_forever(Duration::from_secs(config.sync.cycle_delay_secs), shutdown)
        .await;

    Ok(())
}
