//! SitePulse: replay recorded behavioral events through the collection
//! pipeline and deliver them to a collection endpoint.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use sitepulse_core::{CollectorConfig, EventKind};
use sitepulse_web_sdk::{
    Beacon, EventFields, FlushOutcome, HttpBeacon, HttpIngestClient, MemorySessionStore,
    PageContext, Tracker,
};

#[derive(Parser, Debug)]
#[command(name = "sitepulse")]
#[command(about = "Client-side behavioral event collector")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables still apply on top)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Site identifier (overrides config)
    #[arg(long, global = true, env = "SITEPULSE__SITE_ID")]
    site_id: Option<String>,

    /// Collection endpoint URL (overrides config)
    #[arg(long, global = true, env = "SITEPULSE__COLLECTION_ENDPOINT")]
    endpoint: Option<String>,

    /// Events per size-triggered batch (overrides config)
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Track every event of an NDJSON file, then flush and tear down
    Replay {
        /// Input file, or `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Grant tracking consent before replaying
        #[arg(long, default_value_t = false)]
        consent: bool,

        /// Page URL the events are attributed to
        #[arg(long)]
        page_url: Option<String>,

        /// Deliver the teardown batch through a detached beacon request,
        /// waiting up to `teardown_timeout_ms` for it before exiting
        #[arg(long, default_value_t = false)]
        beacon: bool,
    },

    /// Load and validate the effective configuration
    CheckConfig,
}

/// One NDJSON input line.
#[derive(Debug, Deserialize)]
struct ReplayLine {
    kind: EventKind,
    #[serde(flatten)]
    fields: EventFields,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sitepulse=info,sitepulse_web_sdk=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    info!(
        site_id = %config.site_id,
        endpoint = %config.collection_endpoint,
        batch_size = config.batch_size,
        flush_interval_ms = config.flush_interval_ms,
        retry_max_attempts = config.retry_max_attempts,
        "Configuration loaded"
    );

    match cli.command {
        Commands::CheckConfig => {
            if !config.has_site() {
                warn!("site_id is not set; every event would be dropped");
            }
            Ok(())
        }
        Commands::Replay {
            input,
            consent,
            page_url,
            beacon,
        } => replay(config, &input, consent, page_url, beacon).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<CollectorConfig> {
    let mut config = CollectorConfig::load_from(cli.config.as_deref())?;

    if let Some(site_id) = &cli.site_id {
        config.site_id = site_id.clone();
    }
    if let Some(endpoint) = &cli.endpoint {
        config.collection_endpoint = endpoint.clone();
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    config.validate()?;
    Ok(config)
}

async fn replay(
    config: CollectorConfig,
    input: &str,
    consent: bool,
    page_url: Option<String>,
    beacon: bool,
) -> anyhow::Result<()> {
    let drain_timeout = Duration::from_millis(config.teardown_timeout_ms);
    let beacon = beacon.then(|| Arc::new(HttpBeacon::new()));

    let mut builder = Tracker::builder(HttpIngestClient::new())
        .with_session_store(Arc::new(MemorySessionStore::new()));
    if let Some(url) = page_url {
        builder = builder.with_page(PageContext::new(url));
    }
    if let Some(beacon) = &beacon {
        builder = builder.with_beacon(Arc::clone(beacon) as Arc<dyn Beacon>);
    }
    let tracker = builder.build();
    tracker.configure(config)?;
    if consent {
        tracker.grant_consent();
    }

    let tracked = if input == "-" {
        track_lines(&tracker, BufReader::new(tokio::io::stdin())).await?
    } else {
        let file = tokio::fs::File::open(input).await?;
        track_lines(&tracker, BufReader::new(file)).await?
    };
    info!(tracked, queued = tracker.queue_len(), "Input replayed");

    match tracker.flush_now().await {
        FlushOutcome::Requeued { events } => {
            warn!(events, "Delivery failed, sending remaining events best-effort");
        }
        outcome => info!(?outcome, "Final flush finished"),
    }

    let outcome = tracker.teardown().await;
    info!(?outcome, "Collector torn down");

    // The runtime cancels detached beacon requests once main returns.
    if let Some(beacon) = beacon {
        let finished = beacon.drain(drain_timeout).await;
        info!(finished, "Beacon requests drained");
    }
    Ok(())
}

/// Track each well-formed line; malformed lines are logged and skipped.
async fn track_lines<R>(tracker: &Tracker<HttpIngestClient>, reader: R) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut tracked = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ReplayLine>(&line) {
            Ok(entry) => {
                tracker.track(entry.kind, entry.fields);
                tracked += 1;
            }
            Err(e) => warn!(line = line_no, error = %e, "Skipping malformed event line"),
        }
    }
    Ok(tracked)
}
