use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SwarmError;

/// Upper bound for every configured delay or interval (ten years).
const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

pub const DEFAULT_USER_AGENT: &str = concat!("hlswarm/", env!("CARGO_PKG_VERSION"));

/// How a client picks one variant out of a quality list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitrateSelection {
    /// Uniformly random variant
    #[default]
    Random,
    /// Highest advertised bandwidth
    Best,
    /// Highest bandwidth most of the time, otherwise random
    Biased,
}

impl FromStr for BitrateSelection {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "best" => Ok(Self::Best),
            "biased" => Ok(Self::Biased),
            other => Err(SwarmError::configuration(format!(
                "unknown bitrate selection `{other}` (expected random, best or biased)"
            ))),
        }
    }
}

/// Where playback starts inside the first manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    /// Beginning for VOD, live edge for live streams
    #[default]
    Auto,
    Beginning,
    End,
    /// Uniformly random offset inside the manifest
    Random,
}

/// Per-client playback behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Number of segments a client tries to keep buffered
    pub buffer_size: usize,

    /// Consecutive manifest fetch failures tolerated before giving up
    pub max_retries: u32,

    /// Mean session length; actual lengths are uniform in [0, 2 * mean)
    pub avg_session_secs: u64,

    pub start_position: StartPosition,

    /// Re-request segments that are still outstanding after a refresh cycle
    pub pester_slow_server: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            buffer_size: 5,
            max_retries: 10,
            avg_session_secs: 24 * 60 * 60,
            start_position: StartPosition::Auto,
            pester_slow_server: false,
        }
    }
}

impl PlaybackConfig {
    pub fn avg_session(&self) -> Duration {
        Duration::from_secs(self.avg_session_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub selection: BitrateSelection,

    /// Percentage of biased picks that take the best variant
    pub biased_best_percent: u32,

    /// Abort clients whose best variant is below `audio_only_threshold`
    pub skip_audio_only: bool,

    /// Bandwidth (bits/s) under which a quality list is treated as audio only
    pub audio_only_threshold: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            selection: BitrateSelection::Random,
            biased_best_percent: 70,
            skip_audio_only: false,
            audio_only_threshold: 200_000,
        }
    }
}

/// Fleet sizing and load-shedding policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Ceiling on attached + unattached sessions. In dynamic mode this is the starting ceiling.
    pub max_streams: usize,

    /// Probe for the maximum sustainable load instead of holding a fixed count
    pub dynamic: bool,

    /// Share of attached sessions killed per overload sweep
    pub kill_factor: f64,

    /// Share of `max_streams` started right away in dynamic mode
    pub immediate_factor: f64,

    /// Ramp up ten times slower while no session is attached
    pub soft_start: bool,

    /// Fixed mode spreads initial starts over [0, startup_delay)
    pub startup_delay_secs: u64,

    /// Base spawn interval while the server looks healthy
    pub ramp_interval_secs: u64,

    /// Base spawn interval after slowness or overload was seen
    pub backoff_interval_secs: u64,

    pub ceiling_cooloff: u32,
    pub kill_cooloff: u32,
    pub slowness_cooloff: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_streams: 3,
            dynamic: false,
            kill_factor: 0.25,
            immediate_factor: 0.0,
            soft_start: false,
            startup_delay_secs: 0,
            ramp_interval_secs: 10,
            backoff_interval_secs: 25,
            ceiling_cooloff: 3,
            kill_cooloff: 2,
            slowness_cooloff: 2,
        }
    }
}

impl AdmissionConfig {
    pub fn ramp_interval(&self) -> Duration {
        Duration::from_secs(self.ramp_interval_secs)
    }

    pub fn backoff_interval(&self) -> Duration {
        Duration::from_secs(self.backoff_interval_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Server-side utilization gate for new sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UtilizationConfig {
    pub enabled: bool,
    /// New sessions are refused while reported utilization is at or above this percentage
    pub max_percent: f64,
    pub poll_interval_secs: u64,
}

impl Default for UtilizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_percent: 100.0,
            poll_interval_secs: 5,
        }
    }
}

impl UtilizationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Scheme used for path-only stream URLs and the utilization probe
    pub protocol: String,

    /// Server that path-only stream URLs are resolved against
    pub stream_host: Option<String>,

    /// Value sent in the `Host` header instead of the URL host
    pub host_header: Option<String>,

    /// Local address outgoing connections bind to
    pub bind_address: Option<IpAddr>,

    pub accept_invalid_certs: bool,

    pub user_agent: String,

    pub connect_timeout_secs: u64,

    /// Overall limit for a single request, body included
    pub request_timeout_secs: u64,

    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: "https".to_owned(),
            stream_host: None,
            host_header: None,
            bind_address: None,
            accept_invalid_certs: false,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            pool_max_idle_per_host: 64,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Complete configuration for one fleet run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub playback: PlaybackConfig,
    pub quality: QualityConfig,
    pub admission: AdmissionConfig,
    pub stats: StatsConfig,
    pub utilization: UtilizationConfig,
    pub transport: TransportConfig,

    /// Seed for every randomized decision; random when unset
    pub seed: Option<u64>,
}

impl SwarmConfig {
    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.playback.buffer_size == 0 {
            return Err(SwarmError::configuration("buffer size must be at least 1"));
        }
        let intervals = [
            ("average session length", self.playback.avg_session_secs),
            ("startup delay", self.admission.startup_delay_secs),
            ("ramp interval", self.admission.ramp_interval_secs),
            ("backoff interval", self.admission.backoff_interval_secs),
            ("stats interval", self.stats.interval_secs),
            ("utilization poll interval", self.utilization.poll_interval_secs),
        ];
        if let Some((name, secs)) = intervals.iter().find(|(_, secs)| *secs > MAX_INTERVAL_SECS) {
            return Err(SwarmError::configuration(format!(
                "{name} of {secs}s exceeds the maximum of {MAX_INTERVAL_SECS}s"
            )));
        }
        if !(0.0..=1.0).contains(&self.admission.kill_factor) {
            return Err(SwarmError::configuration(format!(
                "kill factor {} is outside [0, 1]",
                self.admission.kill_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.admission.immediate_factor) {
            return Err(SwarmError::configuration(format!(
                "immediate factor {} is outside [0, 1]",
                self.admission.immediate_factor
            )));
        }
        if self.quality.biased_best_percent > 100 {
            return Err(SwarmError::configuration(
                "biased best percentage must be at most 100",
            ));
        }
        if !matches!(self.transport.protocol.as_str(), "http" | "https") {
            return Err(SwarmError::configuration(format!(
                "unsupported protocol `{}`",
                self.transport.protocol
            )));
        }
        if self.utilization.enabled {
            if self.transport.stream_host.is_none() {
                return Err(SwarmError::configuration(
                    "utilization probing needs a stream host",
                ));
            }
            if self.utilization.max_percent <= 0.0 {
                return Err(SwarmError::configuration(
                    "maximum utilization must be positive",
                ));
            }
        }
        Ok(())
    }

    /// URL of the server's utilization report, when a stream host is configured.
    pub fn utilization_url(&self) -> Option<String> {
        self.transport.stream_host.as_ref().map(|host| {
            format!("{}://{}/utilization.json", self.transport.protocol, host)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SwarmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.playback.buffer_size, 5);
        assert_eq!(config.playback.max_retries, 10);
        assert_eq!(config.admission.max_streams, 3);
        assert_eq!(config.admission.kill_factor, 0.25);
    }

    #[test]
    fn rejects_out_of_range_factors() {
        let mut config = SwarmConfig::default();
        config.admission.kill_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::default();
        config.playback.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::default();
        config.utilization.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_intervals_beyond_ten_years() {
        let mut config = SwarmConfig::default();
        config.playback.avg_session_secs = 10_000_000_000_000_000_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("average session length"), "{err}");

        let mut config = SwarmConfig::default();
        config.admission.ramp_interval_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::default();
        config.playback.avg_session_secs = MAX_INTERVAL_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SwarmConfig = serde_json::from_str(
            r#"{ "admission": { "max_streams": 40, "dynamic": true }, "quality": { "selection": "biased" } }"#,
        )
        .unwrap();
        assert_eq!(config.admission.max_streams, 40);
        assert!(config.admission.dynamic);
        assert_eq!(config.admission.kill_cooloff, 2);
        assert_eq!(config.quality.selection, BitrateSelection::Biased);
        assert_eq!(config.playback.buffer_size, 5);
    }

    #[test]
    fn parses_selection_names() {
        assert_eq!("BEST".parse::<BitrateSelection>().unwrap(), BitrateSelection::Best);
        assert!("fastest".parse::<BitrateSelection>().is_err());
    }

    #[test]
    fn utilization_url_uses_protocol_and_host() {
        let mut config = SwarmConfig::default();
        assert_eq!(config.utilization_url(), None);
        config.transport.protocol = "http".into();
        config.transport.stream_host = Some("edge-1.example".into());
        assert_eq!(
            config.utilization_url().as_deref(),
            Some("http://edge-1.example/utilization.json")
        );
    }
}
