mod cli;
mod config;
mod error;

use std::process;
use std::sync::Arc;

use clap::Parser;
use hlswarm_engine::fleet::{FileResumeStore, StatsSink};
use hlswarm_engine::{
    FleetManager, InfluxStatsSink, LogStatsSink, ReqwestTransport, UrlSource, read_resume_state,
};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::Args;
use crate::config::{AppConfig, UrlInput, merge_args};
use crate::error::{AppError, Result};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    init_logging(args.verbose, args.quiet)?;

    let app_config = AppConfig::load(args.config.as_deref())?;
    let (swarm, input) = merge_args(app_config.swarm, &args)?;

    let mut skip = args.skip_urls;
    let (resume, resume_writer) = match &args.resume_state {
        Some(path) => {
            skip += read_resume_state(path).await;
            let (store, writer) = FileResumeStore::spawn(path);
            (Some(Arc::new(store)), Some(writer))
        }
        None => (None, None),
    };

    let source = match &input {
        UrlInput::File(path) => {
            let text = tokio::fs::read_to_string(path).await.map_err(|e| {
                AppError::InvalidInput(format!("cannot read URL file {}: {e}", path.display()))
            })?;
            info!(file = %path.display(), skip, "Reading stream URLs");
            UrlSource::from_lines(&text, skip)
        }
        UrlInput::Stream(url) => UrlSource::fixed(url.clone()),
    }
    .with_transport(&swarm.transport);

    let stats_sink: Arc<dyn StatsSink> = match (&args.influx_tag, app_config.influx) {
        (Some(tag), Some(influx)) => Arc::new(InfluxStatsSink::new(
            influx,
            tag.clone(),
            swarm.transport.stream_host.as_deref(),
        )?),
        (Some(_), None) => {
            warn!("influx not configured, logging statistics instead");
            Arc::new(LogStatsSink)
        }
        (None, _) => Arc::new(LogStatsSink),
    };

    let transport = Arc::new(ReqwestTransport::new(&swarm.transport)?);
    let mut fleet = FleetManager::new(swarm, transport, source)?.with_stats_sink(stats_sink);
    if let Some(store) = resume {
        fleet = fleet.with_resume_store(store);
    }

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping the fleet");
            shutdown.cancel();
        }
    });

    let summary = fleet.run(token).await?;
    // The fleet dropped the store; let the writer flush the last watermark.
    if let Some(writer) = resume_writer
        && let Err(e) = writer.await
    {
        warn!(error = %e, "Resume state writer failed");
    }
    info!(
        started = summary.started,
        attached = summary.attached,
        terminated = summary.terminated,
        killed = summary.killed,
        aborted = summary.aborted,
        redirected = summary.redirected,
        max_streams = summary.max_streams,
        "Run complete"
    );
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_level(verbose))
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))
}
