use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use hlswarm_engine::BitrateSelection;

/// Simulate one or more HLS stream clients
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Read stream URLs from FILE, one per line
    #[arg(short = 'f', long = "url-file", value_name = "FILE")]
    pub url_file: Option<PathBuf>,

    /// Use this URL for every client instead of reading from a file
    #[arg(long, value_name = "URL", conflicts_with = "url_file")]
    pub stream_url: Option<String>,

    /// Fetch path-only URLs (and utilization) from HOST
    #[arg(long = "host", value_name = "HOST")]
    pub stream_host: Option<String>,

    /// Send HOST in the Host header
    #[arg(short = 'H', long, value_name = "HOST")]
    pub host_header: Option<String>,

    /// Protocol for path-only URLs (http or https)
    #[arg(short, long, value_parser = ["http", "https"])]
    pub protocol: Option<String>,

    /// Connect from a specific local IP
    #[arg(short, long = "bind", value_name = "IP")]
    pub bind: Option<IpAddr>,

    /// Ignore TLS certificate problems
    #[arg(short = 'i', long)]
    pub ignore_cert_errors: bool,

    /// Run up to NUM clients in parallel (the starting ceiling with --dynamic)
    #[arg(short = 'n', long, value_name = "NUM")]
    pub max_streams: Option<usize>,

    /// Average session length in seconds
    #[arg(short = 's', long, value_name = "SECS")]
    pub avg_session: Option<u64>,

    /// Spread client startup over a random delay of up to SECS seconds
    #[arg(short = 'd', long, value_name = "SECS")]
    pub startup_delay: Option<u64>,

    /// Quality selection: random, best or biased
    #[arg(long = "bw", value_name = "MODE")]
    pub bitrate: Option<BitrateSelection>,

    /// Dynamically approach the maximum sustainable load
    #[arg(long)]
    pub dynamic: bool,

    /// Percentage of clients to kill when the server is overloaded
    #[arg(short = 'k', long = "kill", value_name = "PCT", value_parser = clap::value_parser!(u8).range(0..=100))]
    pub kill_percent: Option<u8>,

    /// Percentage of clients to start right away with --dynamic
    #[arg(long = "immediate", value_name = "PCT", value_parser = clap::value_parser!(u8).range(0..=100))]
    pub immediate_percent: Option<u8>,

    /// Ramp up extra slowly while nothing is attached
    #[arg(long)]
    pub soft_start: bool,

    /// Keep re-requesting segments from a slow server
    #[arg(long)]
    pub pester_slow_server: bool,

    /// Start playback at a random point in the stream
    #[arg(long)]
    pub random_startpoint: bool,

    /// Abort clients whose stream is audio only
    #[arg(long)]
    pub skip_audio_only: bool,

    /// Skip the first NUM URLs of the file
    #[arg(long, value_name = "NUM", default_value_t = 0)]
    pub skip_urls: u64,

    /// Read the resume watermark from FILE at startup and keep it updated
    #[arg(long, value_name = "FILE")]
    pub resume_state: Option<PathBuf>,

    /// Poll /utilization.json on the stream host and pause spawning when busy
    #[arg(short = 'u', long)]
    pub utilization: bool,

    /// Stop spawning while utilization is at or above PCT
    #[arg(long, value_name = "PCT")]
    pub umax: Option<f64>,

    /// Send statistics to InfluxDB tagged with TAG (e.g. node id)
    #[arg(long, value_name = "TAG")]
    pub influx_tag: Option<String>,

    /// Seed for all random decisions
    #[arg(long)]
    pub seed: Option<u64>,

    /// Configuration file (JSON)
    #[arg(short, long, value_name = "FILE", env = "HLSWARM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}
