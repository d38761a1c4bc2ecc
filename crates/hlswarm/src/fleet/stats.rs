//! Periodic service-quality statistics.
//!
//! Clients report bad service, very bad service and slow servers as events.
//! The collector remembers which sessions saw each condition during the
//! current interval; a report counts sessions, not events, and the counters
//! start over after every report.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::SessionId;
use crate::error::SwarmError;

const INFLUX_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    BadService,
    VeryBadService,
    SlowServer,
}

#[derive(Debug, Default, Clone, Copy)]
struct SessionFlags {
    bad: bool,
    very_bad: bool,
    slow: bool,
}

#[derive(Debug, Default)]
pub struct StatsCollector {
    sessions: HashMap<SessionId, SessionFlags>,
}

/// One interval's worth of counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    pub streams: usize,
    pub unattached: usize,
    pub max_streams: usize,
    pub bad_service: usize,
    pub very_bad_service: usize,
    pub slow_server: usize,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, session: SessionId, observation: Observation) {
        let flags = self.sessions.entry(session).or_default();
        match observation {
            Observation::BadService => flags.bad = true,
            Observation::VeryBadService => flags.very_bad = true,
            Observation::SlowServer => flags.slow = true,
        }
    }

    pub fn report(&self, streams: usize, unattached: usize, max_streams: usize) -> StatsReport {
        let count = |pick: fn(&SessionFlags) -> bool| self.sessions.values().filter(|f| pick(f)).count();
        StatsReport {
            streams,
            unattached,
            max_streams,
            bad_service: count(|f| f.bad),
            very_bad_service: count(|f| f.very_bad),
            slow_server: count(|f| f.slow),
        }
    }

    pub fn reset(&mut self) {
        self.sessions.clear();
    }
}

/// Destination for periodic reports.
#[async_trait]
pub trait StatsSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, report: StatsReport) -> Result<(), SwarmError>;
}

/// Writes reports to the log.
#[derive(Debug, Default)]
pub struct LogStatsSink;

#[async_trait]
impl StatsSink for LogStatsSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn publish(&self, report: StatsReport) -> Result<(), SwarmError> {
        info!(
            streams = report.streams,
            unattached = report.unattached,
            max_streams = report.max_streams,
            bad_service = report.bad_service,
            very_bad_service = report.very_bad_service,
            slow_server = report.slow_server,
            "Fleet statistics"
        );
        Ok(())
    }
}

/// Credentials and addressing for the InfluxDB sink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfluxConfig {
    /// Host (and optional port) of the InfluxDB server
    pub influx_host: String,
    /// Database written to
    pub organization: String,
    pub influx_user: String,
    pub influx_pw: String,
}

/// Posts reports to InfluxDB using the line protocol.
pub struct InfluxStatsSink {
    client: Client,
    write_url: String,
    config: InfluxConfig,
    tag: String,
    stream_host: String,
    pid: u32,
}

impl InfluxStatsSink {
    pub fn new(
        config: InfluxConfig,
        tag: impl Into<String>,
        stream_host: Option<&str>,
    ) -> Result<Self, SwarmError> {
        if config.influx_host.is_empty() {
            return Err(SwarmError::configuration("influx_host is not configured"));
        }
        let write_url = format!(
            "https://{}/write?db={}",
            config.influx_host,
            url::form_urlencoded::byte_serialize(config.organization.as_bytes()).collect::<String>()
        );
        let client = Client::builder().timeout(INFLUX_TIMEOUT).build()?;
        Ok(Self {
            client,
            write_url,
            config,
            tag: tag.into(),
            stream_host: stream_host.unwrap_or("unknown").to_owned(),
            pid: std::process::id(),
        })
    }

    /// One line per metric, all sharing the node/host/pid tags.
    pub fn line_protocol(&self, report: &StatsReport) -> String {
        let prefix = format!(
            "scs,hcdn_node_id={},hostname={},scs_pid={}",
            self.tag, self.stream_host, self.pid
        );
        [
            ("nStreams", report.streams),
            ("nVeryBadService", report.very_bad_service),
            ("nBadService", report.bad_service),
            ("nSlowServerSeen", report.slow_server),
        ]
        .iter()
        .map(|(key, value)| format!("{prefix} {key}={value}"))
        .collect::<Vec<_>>()
        .join("\n")
    }
}

#[async_trait]
impl StatsSink for InfluxStatsSink {
    fn name(&self) -> &'static str {
        "influx"
    }

    async fn publish(&self, report: StatsReport) -> Result<(), SwarmError> {
        let body = self.line_protocol(&report);
        debug!(url = %self.write_url, lines = %body, "Sending statistics to influx");

        let response = self
            .client
            .post(&self.write_url)
            .basic_auth(&self.config.influx_user, Some(&self.config.influx_pw))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() > 299 {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, body = %text, "Influx rejected statistics");
            return Err(SwarmError::http_status(status, self.write_url.as_str()));
        }
        Ok(())
    }
}
