use std::path::{Path, PathBuf};

use hlswarm_engine::{InfluxConfig, StartPosition, SwarmConfig};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::cli::Args;
use crate::error::{AppError, Result};

const DEFAULT_CONFIG_FILE: &str = "hlswarm.json";

/// Contents of the optional configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// InfluxDB credentials, needed for `--influx-tag`
    pub influx: Option<InfluxConfig>,
    /// Base settings that command-line flags override
    pub swarm: SwarmConfig,
}

/// Where stream URLs come from.
#[derive(Debug, Clone)]
pub enum UrlInput {
    File(PathBuf),
    Stream(String),
}

impl AppConfig {
    /// Loads `path`, or `hlswarm.json` from the working directory when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    debug!("No configuration file, using defaults");
                    return Ok(Self::default());
                }
                default
            }
        };
        let text = std::fs::read_to_string(&path).map_err(|e| {
            AppError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = serde_json::from_str(&text).map_err(|e| {
            AppError::Config(format!("invalid configuration in {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }
}

/// Applies command-line flags on top of the file settings.
pub fn merge_args(mut swarm: SwarmConfig, args: &Args) -> Result<(SwarmConfig, UrlInput)> {
    let transport = &mut swarm.transport;
    if let Some(protocol) = &args.protocol {
        transport.protocol = protocol.clone();
    }
    if let Some(host) = &args.stream_host {
        transport.stream_host = Some(host.clone());
    }
    if args.host_header.is_some() {
        transport.host_header = args.host_header.clone();
    }
    if args.bind.is_some() {
        transport.bind_address = args.bind;
    }
    transport.accept_invalid_certs |= args.ignore_cert_errors;

    let input = match (&args.url_file, &args.stream_url) {
        (Some(file), _) => UrlInput::File(file.clone()),
        (None, Some(stream)) => {
            // Protocol and host of a full stream URL also apply to the utilization probe.
            let url = Url::parse(stream)
                .map_err(|e| AppError::InvalidInput(format!("invalid stream URL {stream}: {e}")))?;
            transport.protocol = url.scheme().to_owned();
            if let Some(host) = url.host_str() {
                transport.stream_host = Some(match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_owned(),
                });
            }
            UrlInput::Stream(stream.clone())
        }
        (None, None) => {
            return Err(AppError::InvalidInput(
                "either --url-file or --stream-url is required".to_owned(),
            ));
        }
    };

    let admission = &mut swarm.admission;
    if let Some(max_streams) = args.max_streams {
        admission.max_streams = max_streams;
    }
    if let Some(delay) = args.startup_delay {
        admission.startup_delay_secs = delay;
    }
    if let Some(pct) = args.kill_percent {
        admission.kill_factor = f64::from(pct) / 100.0;
    }
    if let Some(pct) = args.immediate_percent {
        admission.immediate_factor = f64::from(pct) / 100.0;
    }
    admission.dynamic |= args.dynamic;
    admission.soft_start |= args.soft_start;

    let playback = &mut swarm.playback;
    if let Some(secs) = args.avg_session {
        playback.avg_session_secs = secs;
    }
    playback.pester_slow_server |= args.pester_slow_server;
    if args.random_startpoint {
        playback.start_position = StartPosition::Random;
    }

    if let Some(selection) = args.bitrate {
        swarm.quality.selection = selection;
    }
    swarm.quality.skip_audio_only |= args.skip_audio_only;

    swarm.utilization.enabled |= args.utilization;
    if let Some(umax) = args.umax {
        swarm.utilization.max_percent = umax;
    }
    if args.seed.is_some() {
        swarm.seed = args.seed;
    }

    swarm.validate()?;
    Ok((swarm, input))
}
