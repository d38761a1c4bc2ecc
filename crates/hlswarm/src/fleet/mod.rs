//! Fleet management.
//!
//! The [`FleetManager`] owns every session: it starts them, tracks which are
//! attached, reacts to their events and decides how many may run at once.
//!
//! Sessions never share state with the manager. Each runs as its own task,
//! reports through a single event channel and is controlled through its
//! [`ClientHandle`]. All bookkeeping happens on the manager task, one event
//! at a time.
//!
//! Two admission modes exist:
//! - fixed: `max_streams` sessions, started at random points in the startup
//!   delay, each replaced when it terminates
//! - dynamic: the ceiling creeps up while the fleet runs at capacity and is
//!   lowered, with a share of the sessions killed, when clients see very bad
//!   service

pub mod quality;
pub mod resume;
pub mod session;
pub mod source;
pub mod stats;
pub mod utilization;

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::client::{
    ClientContext, ClientEvent, ClientEventKind, ClientHandle, PlaybackSummary, SessionId,
};
use crate::config::SwarmConfig;
use crate::cooloff::Cooloff;
use crate::error::SwarmError;
use crate::schedule::{TimerQueue, sleep_until};
use crate::transport::Transport;

pub use quality::{Quality, QualityList, parse_quality_list, select_quality};
pub use resume::{FileResumeStore, MemoryResumeStore, ResumeStore, read_resume_state};
pub use session::{SessionFactory, run_session};
pub use source::{SourcedUrl, UrlSource};
pub use stats::{
    InfluxConfig, InfluxStatsSink, LogStatsSink, Observation, StatsCollector, StatsReport,
    StatsSink,
};
pub use utilization::UtilizationProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FleetTimer {
    StartStream,
    Ramp,
    ReportStats,
}

#[derive(Debug)]
struct UnattachedSession {
    handle: ClientHandle,
    line: u64,
}

#[derive(Debug)]
struct AttachedSession {
    handle: ClientHandle,
    line: u64,
    /// Killed by the fleet, terminal event not yet seen
    terminating: bool,
}

/// Counters for one fleet run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetSummary {
    pub started: u64,
    pub attached: u64,
    pub terminated: u64,
    pub killed: u64,
    pub aborted: u64,
    pub redirected: u64,
    pub max_streams: usize,
    pub skipped_lines: u64,
}

/// Point-in-time view of the fleet's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetSnapshot {
    pub attached: Vec<SessionId>,
    pub unattached: Vec<SessionId>,
    pub max_streams: usize,
    pub seen_slowness: bool,
    pub seen_overload: bool,
    pub watermark: Option<u64>,
}

enum Wake {
    Shutdown,
    Event(ClientEvent),
    Exited(Result<Option<PlaybackSummary>, JoinError>),
    Timer,
}

pub struct FleetManager {
    config: Arc<SwarmConfig>,
    transport: Arc<dyn Transport>,
    source: UrlSource,
    factory: SessionFactory,

    attached: BTreeMap<SessionId, AttachedSession>,
    unattached: BTreeMap<SessionId, UnattachedSession>,
    sessions: JoinSet<Option<PlaybackSummary>>,
    serial: u64,

    max_streams: usize,
    ceiling_cooloff: Cooloff,
    kill_cooloff: Cooloff,
    slowness_cooloff: Cooloff,
    seen_slowness: bool,
    seen_overload: bool,

    watermark: Option<u64>,
    resume: Option<Arc<dyn ResumeStore>>,

    stats: StatsCollector,
    stats_sink: Option<Arc<dyn StatsSink>>,
    publishing: JoinSet<()>,
    utilization: Option<watch::Receiver<bool>>,

    rng: StdRng,
    timers: TimerQueue<FleetTimer>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    summary: FleetSummary,
}

impl FleetManager {
    pub fn new(
        config: SwarmConfig,
        transport: Arc<dyn Transport>,
        source: UrlSource,
    ) -> Result<Self, SwarmError> {
        config.validate()?;
        let config = Arc::new(config);
        let (events_tx, events) = mpsc::unbounded_channel();
        let factory = SessionFactory {
            quality: Arc::new(config.quality.clone()),
            context: ClientContext {
                config: Arc::new(config.playback.clone()),
                transport: Arc::clone(&transport),
                events: events_tx,
            },
        };
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::random()),
        };
        let admission = &config.admission;

        Ok(Self {
            max_streams: admission.max_streams,
            ceiling_cooloff: Cooloff::new("max_streams", admission.ceiling_cooloff),
            kill_cooloff: Cooloff::new("kill_streams", admission.kill_cooloff),
            slowness_cooloff: Cooloff::new("slowness", admission.slowness_cooloff),
            config,
            transport,
            source,
            factory,
            attached: BTreeMap::new(),
            unattached: BTreeMap::new(),
            sessions: JoinSet::new(),
            serial: 0,
            seen_slowness: false,
            seen_overload: false,
            watermark: None,
            resume: None,
            stats: StatsCollector::new(),
            stats_sink: None,
            publishing: JoinSet::new(),
            utilization: None,
            rng,
            timers: TimerQueue::new(),
            events,
            summary: FleetSummary::default(),
        })
    }

    /// Publish statistics to `sink` every stats interval.
    pub fn with_stats_sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.stats_sink = Some(sink);
        self
    }

    /// Persist the resume watermark through `store`.
    pub fn with_resume_store(mut self, store: Arc<dyn ResumeStore>) -> Self {
        self.resume = Some(store);
        self
    }

    /// Gate new sessions on an external utilization signal instead of the
    /// built-in probe.
    pub fn with_utilization(mut self, ok: watch::Receiver<bool>) -> Self {
        self.utilization = Some(ok);
        self
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            attached: self.attached.keys().copied().collect(),
            unattached: self.unattached.keys().copied().collect(),
            max_streams: self.max_streams,
            seen_slowness: self.seen_slowness,
            seen_overload: self.seen_overload,
            watermark: self.watermark,
        }
    }

    /// Runs the fleet until `token` is cancelled, the URL source is used up
    /// with no sessions left, or bookkeeping breaks.
    pub async fn run(mut self, token: CancellationToken) -> Result<FleetSummary, SwarmError> {
        self.start(&token)?;
        let outcome = self.event_loop(&token).await;
        self.shutdown().await;

        if let Err(e) = &outcome {
            error!(error = %e, "Fleet stopped");
        }
        outcome?;
        self.summary.max_streams = self.max_streams;
        self.summary.skipped_lines = self.source.skipped();
        info!(summary = ?self.summary, "Fleet finished");
        Ok(self.summary)
    }

    fn start(&mut self, token: &CancellationToken) -> Result<(), SwarmError> {
        if self.config.utilization.enabled && self.utilization.is_none() {
            let url = self
                .config
                .utilization_url()
                .ok_or_else(|| SwarmError::configuration("utilization probing needs a stream host"))?;
            let url = Url::parse(&url).map_err(|e| SwarmError::invalid_url(url.clone(), e.to_string()))?;
            let probe = UtilizationProbe::new(
                url,
                self.config.utilization.max_percent,
                self.config.utilization.poll_interval(),
                Arc::clone(&self.transport),
            );
            self.utilization = Some(probe.spawn(&mut self.rng, token.child_token()));
        }

        if self.stats_sink.is_some() {
            let first = self.config.stats.interval().mul_f64(self.rng.random::<f64>());
            debug!(delay_secs = first.as_secs_f64(), "First statistics report scheduled");
            self.timers.schedule(first, FleetTimer::ReportStats);
        }

        let admission = &self.config.admission;
        if admission.dynamic {
            let immediate = (admission.max_streams as f64 * admission.immediate_factor).round() as usize;
            let ramp = admission.ramp_interval();
            info!(max_streams = self.max_streams, immediate, "Starting fleet in dynamic mode");
            for _ in 0..immediate {
                let delay = ramp.mul_f64(self.rng.random::<f64>());
                debug!(delay_secs = delay.as_secs_f64(), "Starting a client");
                self.timers.schedule(delay, FleetTimer::StartStream);
            }
            self.ramp_step();
        } else {
            let spread = admission.startup_delay();
            info!(max_streams = self.max_streams, spread_secs = spread.as_secs(), "Starting fleet");
            for _ in 0..self.max_streams {
                let delay = spread.mul_f64(self.rng.random::<f64>());
                self.timers.schedule(delay, FleetTimer::StartStream);
            }
        }
        Ok(())
    }

    async fn event_loop(&mut self, token: &CancellationToken) -> Result<(), SwarmError> {
        loop {
            if self.is_drained() {
                info!("No stream URLs and no sessions left");
                return Ok(());
            }

            let deadline = self.timers.next_deadline();
            let wake = tokio::select! {
                biased;
                _ = token.cancelled() => Wake::Shutdown,
                Some(event) = self.events.recv() => Wake::Event(event),
                Some(exited) = self.sessions.join_next(), if !self.sessions.is_empty() => {
                    Wake::Exited(exited)
                }
                _ = sleep_until(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Shutdown => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                Wake::Event(event) => self.handle_event(event)?,
                Wake::Exited(Ok(Some(summary))) => debug!(
                    session = %summary.session,
                    played = summary.segments_played,
                    stream_secs = summary.stream_time.as_secs_f64(),
                    "Session task finished"
                ),
                Wake::Exited(Ok(None)) => {}
                Wake::Exited(Err(e)) => error!(error = %e, "Session task failed"),
                Wake::Timer => {
                    if let Some(timer) = self.timers.pop_due(Instant::now()) {
                        self.on_timer(timer);
                    }
                }
            }
        }
    }

    /// Closes every command channel and waits for the session tasks to stop.
    async fn shutdown(&mut self) {
        self.timers.clear();
        let open = self.attached.len() + self.unattached.len();
        self.attached.clear();
        self.unattached.clear();
        if open > 0 {
            info!(sessions = open, "Stopping sessions");
        }
        while let Some(exited) = self.sessions.join_next().await {
            if let Err(e) = exited {
                warn!(error = %e, "Session task failed during shutdown");
            }
        }
        if !self.publishing.is_empty() {
            debug!(pending = self.publishing.len(), "Waiting for statistics to be published");
        }
        while self.publishing.join_next().await.is_some() {}
    }

    fn is_drained(&self) -> bool {
        self.attached.is_empty() && self.unattached.is_empty() && self.source.is_exhausted()
    }

    fn on_timer(&mut self, timer: FleetTimer) {
        match timer {
            FleetTimer::StartStream => {
                self.start_stream();
            }
            FleetTimer::Ramp => {
                info!(
                    streams = self.attached.len(),
                    unattached = self.unattached.len(),
                    max_streams = self.max_streams,
                    "Ramp tick"
                );
                self.start_stream();
                self.ramp_step();
            }
            FleetTimer::ReportStats => {
                self.report_stats();
                self.timers
                    .schedule(self.config.stats.interval(), FleetTimer::ReportStats);
            }
        }
    }

    // --- events ---

    fn handle_event(&mut self, event: ClientEvent) -> Result<(), SwarmError> {
        let ClientEvent { session, kind } = event;
        match kind {
            ClientEventKind::Attached => {
                let Some(pending) = self.unattached.remove(&session) else {
                    return Err(SwarmError::bookkeeping(format!(
                        "session {session} attached but was never started"
                    )));
                };
                self.attached.insert(
                    session,
                    AttachedSession {
                        handle: pending.handle,
                        line: pending.line,
                        terminating: false,
                    },
                );
                self.summary.attached += 1;
                debug!(
                    %session,
                    streams = self.attached.len(),
                    unattached = self.unattached.len(),
                    max_streams = self.max_streams,
                    "Session attached"
                );
            }
            ClientEventKind::Terminated(reason) => {
                info!(%session, ?reason, "Session terminated");
                self.remove_attached(session)?;
                self.summary.terminated += 1;
                self.start_stream();
            }
            ClientEventKind::Killed => {
                info!(%session, "Session killed");
                self.remove_attached(session)?;
                self.summary.killed += 1;
            }
            ClientEventKind::Aborted(reason) => {
                info!(%session, %reason, "Session aborted");
                self.remove_unattached(session);
                self.summary.aborted += 1;
                self.start_stream();
            }
            // The server is shedding load; the session is not replaced.
            ClientEventKind::Redirected { attached } => {
                info!(%session, attached, "Session redirected away");
                if attached {
                    self.remove_attached(session)?;
                } else {
                    self.remove_unattached(session);
                }
                self.summary.redirected += 1;
            }
            ClientEventKind::BadService => {
                if !self.is_terminating(session) {
                    self.observe(session, Observation::BadService);
                }
            }
            ClientEventKind::VeryBadService => {
                if !self.is_terminating(session) {
                    self.observe(session, Observation::VeryBadService);
                    self.kill_some_streams();
                }
            }
            ClientEventKind::SlowServer => {
                self.observe(session, Observation::SlowServer);
                self.seen_slowness = true;
            }
        }
        Ok(())
    }

    fn remove_attached(&mut self, session: SessionId) -> Result<(), SwarmError> {
        if self.attached.remove(&session).is_none() {
            return Err(SwarmError::bookkeeping(format!(
                "session {session} ended but is not attached"
            )));
        }
        self.update_resume_state();
        info!(
            %session,
            streams = self.attached.len(),
            unattached = self.unattached.len(),
            max_streams = self.max_streams,
            "Session removed"
        );
        Ok(())
    }

    fn remove_unattached(&mut self, session: SessionId) {
        if self.unattached.remove(&session).is_none() {
            warn!(%session, "Attempt to remove unknown unattached session");
        }
    }

    fn is_terminating(&self, session: SessionId) -> bool {
        self.attached
            .get(&session)
            .is_some_and(|attached| attached.terminating)
    }

    /// Persists the source line of the oldest attached session when it moved forward.
    fn update_resume_state(&mut self) {
        let Some((oldest, attached)) = self.attached.first_key_value() else {
            debug!("No attached sessions, resume state unchanged");
            return;
        };
        let line = attached.line;
        if self.watermark.is_some_and(|watermark| line <= watermark) {
            debug!(oldest = %oldest, line, "Oldest living session unchanged");
            return;
        }
        info!(oldest = %oldest, line, "New oldest living session");
        self.watermark = Some(line);
        if let Some(store) = &self.resume {
            store.record(line);
        }
    }

    // --- admission ---

    /// Starts one session if there is room. Returns whether one was started.
    fn start_stream(&mut self) -> bool {
        let active = self.attached.len() + self.unattached.len();
        if active >= self.max_streams {
            debug!(
                streams = self.attached.len(),
                unattached = self.unattached.len(),
                max_streams = self.max_streams,
                "No room for more streams"
            );
            return false;
        }
        if self.utilization.as_ref().is_some_and(|ok| !*ok.borrow()) {
            info!("Server is overloaded, not starting a new stream now");
            return false;
        }
        let Some(SourcedUrl { url, line }) = self.source.next_url() else {
            debug!("No more stream URLs");
            return false;
        };

        self.serial += 1;
        let session = SessionId(self.serial);
        let (handle, commands) = ClientHandle::new(session);
        self.unattached.insert(session, UnattachedSession { handle, line });
        self.summary.started += 1;
        info!(%session, line, url = %url, "Starting stream");

        let rng = StdRng::seed_from_u64(self.rng.random());
        self.sessions
            .spawn(run_session(session, url, self.factory.clone(), commands, rng));
        true
    }

    /// One ramp-up step in dynamic mode: adjusts the ceiling and schedules
    /// the next start attempt.
    fn ramp_step(&mut self) {
        self.kill_cooloff.tick();
        self.adjust_max_streams();

        let admission = &self.config.admission;
        let base = if self.seen_overload || self.seen_slowness {
            admission.backoff_interval()
        } else {
            admission.ramp_interval()
        };
        let mut delay = base.mul_f64(self.rng.random::<f64>() * 2.0);
        if admission.soft_start && self.attached.is_empty() {
            delay = delay.saturating_mul(10);
        }
        debug!(
            delay_secs = delay.as_secs_f64(),
            seen_slowness = self.seen_slowness,
            seen_overload = self.seen_overload,
            "Next start attempt scheduled"
        );
        self.timers.schedule(delay, FleetTimer::Ramp);

        // After scheduling, so slowness seen during this delay slows the next one.
        self.adjust_ramp_rate();
    }

    fn adjust_max_streams(&mut self) {
        self.ceiling_cooloff.tick();
        if self.attached.len() == self.max_streams && self.ceiling_cooloff.fire() {
            self.max_streams += 1;
            info!(max_streams = self.max_streams, "Raised stream ceiling");
        }
    }

    fn adjust_ramp_rate(&mut self) {
        self.slowness_cooloff.tick();
        if self.slowness_cooloff.fire() && self.seen_slowness {
            debug!("Clearing slowness");
            self.seen_slowness = false;
        }
    }

    /// Kills a share of the attached sessions and lowers the ceiling.
    fn kill_some_streams(&mut self) {
        if !self.config.admission.dynamic {
            debug!("Fixed load, not killing streams");
            return;
        }
        let to_kill = (self.attached.len() as f64 * self.config.admission.kill_factor).floor() as usize;

        if self.max_streams == 0 {
            info!("No streams left to kill, only recording overload");
            self.react_to_overload();
            return;
        }
        if !self.kill_cooloff.fire() {
            info!("Recently killed streams, skipping");
            return;
        }

        let mut candidates: Vec<SessionId> = self
            .attached
            .iter()
            .filter(|(_, attached)| !attached.terminating)
            .map(|(id, _)| *id)
            .collect();
        let mut victims = Vec::with_capacity(to_kill);
        while victims.len() < to_kill && !candidates.is_empty() {
            let pick = self.rng.random_range(0..candidates.len());
            victims.push(candidates.swap_remove(pick));
        }

        for session in &victims {
            if let Some(attached) = self.attached.get_mut(session) {
                attached.terminating = true;
                if !attached.handle.kill() {
                    warn!(session = %attached.handle.session(), "Session already gone, cannot kill");
                }
            }
        }
        self.react_to_overload();
        warn!(
            killed = victims.len(),
            max_streams = self.max_streams,
            "Server overloaded, killed streams"
        );
    }

    fn react_to_overload(&mut self) {
        self.seen_slowness = true;
        self.seen_overload = true;
        self.max_streams = self.max_streams.saturating_sub(1);
    }

    fn report_stats(&mut self) {
        let report = self.stats.report(
            self.attached.len(),
            self.unattached.len(),
            self.max_streams,
        );
        self.stats.reset();
        let Some(sink) = self.stats_sink.clone() else {
            return;
        };
        while self.publishing.try_join_next().is_some() {}
        self.publishing.spawn(async move {
            if let Err(e) = sink.publish(report).await {
                warn!(sink = sink.name(), error = %e, "Failed to publish statistics");
            }
        });
    }

    /// Counts are only kept while someone collects them.
    fn observe(&mut self, session: SessionId, observation: Observation) {
        if self.stats_sink.is_some() {
            self.stats.record(session, observation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientCommand, EndReason};
    use crate::config::{AdmissionConfig, StatsConfig};
    use crate::testing::{Reply, ScriptedTransport, media_playlist};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn urls(n: usize) -> String {
        (0..n)
            .map(|i| format!("https://edge.example/s{i}/index.m3u8\n"))
            .collect()
    }

    fn config(admission: AdmissionConfig) -> SwarmConfig {
        SwarmConfig {
            admission,
            seed: Some(42),
            ..Default::default()
        }
    }

    fn dynamic(max_streams: usize) -> SwarmConfig {
        config(AdmissionConfig {
            max_streams,
            dynamic: true,
            kill_factor: 0.5,
            ..Default::default()
        })
    }

    fn fleet(config: SwarmConfig, transport: Arc<ScriptedTransport>, list: &str) -> FleetManager {
        FleetManager::new(config, transport, UrlSource::from_lines(list, 0)).unwrap()
    }

    fn idle_fleet(config: SwarmConfig) -> FleetManager {
        fleet(config, Arc::new(ScriptedTransport::new()), "")
    }

    /// Registers an attached session directly and returns its command receiver.
    fn attach(
        fleet: &mut FleetManager,
        id: u64,
        line: u64,
    ) -> mpsc::UnboundedReceiver<ClientCommand> {
        let (handle, commands) = ClientHandle::new(SessionId(id));
        fleet.attached.insert(
            SessionId(id),
            AttachedSession {
                handle,
                line,
                terminating: false,
            },
        );
        commands
    }

    fn event(id: u64, kind: ClientEventKind) -> ClientEvent {
        ClientEvent {
            session: SessionId(id),
            kind,
        }
    }

    fn kills(receivers: &mut [mpsc::UnboundedReceiver<ClientCommand>]) -> usize {
        receivers
            .iter_mut()
            .map(|rx| matches!(rx.try_recv(), Ok(ClientCommand::Kill)))
            .filter(|killed| *killed)
            .count()
    }

    #[test]
    fn very_bad_service_without_dynamic_load_changes_nothing() {
        let mut fleet = idle_fleet(config(AdmissionConfig {
            max_streams: 4,
            ..Default::default()
        }));
        let mut receivers: Vec<_> = (1..=4).map(|id| attach(&mut fleet, id, id)).collect();

        fleet
            .handle_event(event(2, ClientEventKind::VeryBadService))
            .unwrap();

        assert_eq!(kills(&mut receivers), 0);
        let snapshot = fleet.snapshot();
        assert_eq!(snapshot.max_streams, 4);
        assert!(!snapshot.seen_overload);
    }

    #[test]
    fn kill_sweep_picks_distinct_sessions_once_per_cooloff() {
        let mut fleet = idle_fleet(dynamic(8));
        let mut receivers: Vec<_> = (1..=8).map(|id| attach(&mut fleet, id, id)).collect();

        fleet
            .handle_event(event(1, ClientEventKind::VeryBadService))
            .unwrap();
        assert_eq!(kills(&mut receivers), 4);
        let terminating = fleet.attached.values().filter(|a| a.terminating).count();
        assert_eq!(terminating, 4);
        assert_eq!(fleet.snapshot().max_streams, 7);
        assert!(fleet.snapshot().seen_overload);

        // Cooloff still armed: no second sweep.
        let healthy = fleet
            .attached
            .iter()
            .find(|(_, a)| !a.terminating)
            .map(|(id, _)| id.0)
            .unwrap();
        fleet
            .handle_event(event(healthy, ClientEventKind::VeryBadService))
            .unwrap();
        assert_eq!(kills(&mut receivers), 0);
        assert_eq!(fleet.snapshot().max_streams, 7);
    }

    #[test]
    fn kill_sweep_reopens_after_ramp_ticks() {
        let mut fleet = idle_fleet(dynamic(8));
        let mut receivers: Vec<_> = (1..=8).map(|id| attach(&mut fleet, id, id)).collect();
        fleet
            .handle_event(event(1, ClientEventKind::VeryBadService))
            .unwrap();
        kills(&mut receivers);

        fleet.kill_cooloff.tick();
        fleet.kill_cooloff.tick();
        let healthy = fleet
            .attached
            .iter()
            .find(|(_, a)| !a.terminating)
            .map(|(id, _)| id.0)
            .unwrap();
        fleet
            .handle_event(event(healthy, ClientEventKind::VeryBadService))
            .unwrap();
        // floor(8 * 0.5) again, but only 4 sessions are still healthy.
        assert_eq!(kills(&mut receivers), 4);
        assert_eq!(fleet.snapshot().max_streams, 6);
    }

    #[test]
    fn zero_ceiling_only_records_overload() {
        let mut fleet = idle_fleet(dynamic(0));
        let mut receivers = vec![attach(&mut fleet, 1, 0)];
        fleet
            .handle_event(event(1, ClientEventKind::VeryBadService))
            .unwrap();
        assert_eq!(kills(&mut receivers), 0);
        assert_eq!(fleet.snapshot().max_streams, 0);
        assert!(fleet.snapshot().seen_overload);
    }

    #[test]
    fn service_reports_from_terminating_sessions_are_ignored() {
        let mut fleet =
            idle_fleet(dynamic(4)).with_stats_sink(Arc::new(RecordingSink::default()));
        let _rx = attach(&mut fleet, 1, 0);
        fleet.attached.get_mut(&SessionId(1)).unwrap().terminating = true;

        fleet
            .handle_event(event(1, ClientEventKind::BadService))
            .unwrap();
        fleet
            .handle_event(event(1, ClientEventKind::VeryBadService))
            .unwrap();
        let report = fleet.stats.report(1, 0, 4);
        assert_eq!(report.bad_service, 0);
        assert_eq!(report.very_bad_service, 0);
        assert_eq!(fleet.snapshot().max_streams, 4);
    }

    #[test]
    fn unknown_sessions_break_bookkeeping() {
        let mut fleet = idle_fleet(SwarmConfig::default());
        let attached = fleet.handle_event(event(9, ClientEventKind::Attached));
        assert!(matches!(attached, Err(SwarmError::Bookkeeping { .. })));

        let killed = fleet.handle_event(event(9, ClientEventKind::Killed));
        assert!(matches!(killed, Err(SwarmError::Bookkeeping { .. })));

        // An unknown abort is only logged.
        assert!(
            fleet
                .handle_event(event(9, ClientEventKind::Aborted("gone".into())))
                .is_ok()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replacements_follow_the_event_table() {
        let transport = Arc::new(ScriptedTransport::new());
        for i in 0..10 {
            transport.route(&format!("https://edge.example/s{i}/index.m3u8"), Reply::Hang);
        }
        let mut fleet = fleet(
            config(AdmissionConfig {
                max_streams: 4,
                ..Default::default()
            }),
            transport,
            &urls(10),
        );
        let _rx: Vec<_> = (101..=104).map(|id| attach(&mut fleet, id, 0)).collect();

        // At capacity: the terminated session frees exactly one slot.
        fleet
            .handle_event(event(101, ClientEventKind::Terminated(EndReason::SessionExpired)))
            .unwrap();
        assert_eq!(fleet.snapshot().unattached, vec![SessionId(1)]);

        fleet.handle_event(event(102, ClientEventKind::Killed)).unwrap();
        fleet
            .handle_event(event(103, ClientEventKind::Redirected { attached: true }))
            .unwrap();
        assert_eq!(fleet.snapshot().unattached.len(), 1);
        assert_eq!(fleet.snapshot().attached, vec![SessionId(104)]);

        fleet
            .handle_event(event(1, ClientEventKind::Aborted("404".into())))
            .unwrap();
        assert_eq!(fleet.snapshot().unattached, vec![SessionId(2)]);

        fleet.handle_event(event(2, ClientEventKind::Attached)).unwrap();
        assert_eq!(
            fleet.snapshot().attached,
            vec![SessionId(2), SessionId(104)]
        );
        fleet.shutdown().await;
    }

    #[test]
    fn watermark_follows_oldest_attached_session() {
        let store = Arc::new(MemoryResumeStore::new());
        let mut fleet =
            idle_fleet(SwarmConfig::default()).with_resume_store(store.clone());
        let _rx: Vec<_> = [(1, 10), (2, 11), (3, 12)]
            .into_iter()
            .map(|(id, line)| attach(&mut fleet, id, line))
            .collect();

        fleet.handle_event(event(2, ClientEventKind::Killed)).unwrap();
        fleet.handle_event(event(1, ClientEventKind::Killed)).unwrap();
        fleet.handle_event(event(3, ClientEventKind::Killed)).unwrap();

        assert_eq!(store.history(), vec![10, 12]);
        assert_eq!(fleet.snapshot().watermark, Some(12));
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_rises_only_at_capacity() {
        let mut fleet = idle_fleet(dynamic(2));
        let _rx: Vec<_> = (1..=2).map(|id| attach(&mut fleet, id, 0)).collect();

        fleet.ramp_step();
        assert_eq!(fleet.snapshot().max_streams, 3);

        // Below the new ceiling, and the cooloff is armed anyway.
        fleet.ramp_step();
        assert_eq!(fleet.snapshot().max_streams, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slowness_is_cleared_through_its_cooloff() {
        let mut fleet = idle_fleet(dynamic(2));
        fleet
            .handle_event(event(1, ClientEventKind::SlowServer))
            .unwrap();
        assert!(fleet.snapshot().seen_slowness);

        // The step itself still uses the backoff interval, then clears the flag.
        fleet.ramp_step();
        let delay = fleet.timers.next_deadline().unwrap() - Instant::now();
        assert!(delay <= fleet.config.admission.backoff_interval() * 2);
        assert!(!fleet.snapshot().seen_slowness);

        fleet
            .handle_event(event(1, ClientEventKind::SlowServer))
            .unwrap();
        fleet.ramp_step();
        assert!(fleet.snapshot().seen_slowness);
        fleet.ramp_step();
        assert!(!fleet.snapshot().seen_slowness);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_mode_starts_max_streams() {
        let transport = Arc::new(ScriptedTransport::new());
        for i in 0..5 {
            transport.route(&format!("https://edge.example/s{i}/index.m3u8"), Reply::Hang);
        }
        let fleet = fleet(
            config(AdmissionConfig {
                max_streams: 3,
                startup_delay_secs: 10,
                ..Default::default()
            }),
            transport.clone(),
            &urls(5),
        );

        let token = CancellationToken::new();
        let run = tokio::spawn(fleet.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(11)).await;

        for i in 0..3 {
            assert_eq!(transport.count(&format!("https://edge.example/s{i}/index.m3u8")), 1);
        }
        assert_eq!(transport.count("https://edge.example/s3/index.m3u8"), 0);

        token.cancel();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.started, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn overloaded_server_blocks_new_sessions() {
        let transport = Arc::new(ScriptedTransport::new());
        let (_tx, rx) = watch::channel(false);
        let fleet = fleet(SwarmConfig::default(), transport.clone(), &urls(3))
            .with_utilization(rx);

        let token = CancellationToken::new();
        let run = tokio::spawn(fleet.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(transport.requests().is_empty());

        token.cancel();
        assert_eq!(run.await.unwrap().unwrap().started, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fleet_plays_every_url_then_finishes() {
        let transport = Arc::new(ScriptedTransport::new());
        for i in 0..2 {
            transport.route(
                &format!("https://edge.example/s{i}/index.m3u8"),
                Reply::ok(media_playlist(0, 3, 2, true)),
            );
            for n in 0..3 {
                transport.route(&format!("https://edge.example/s{i}/seg{n}.ts"), Reply::ok(""));
            }
        }
        let mut config = config(AdmissionConfig::default());
        config.playback.avg_session_secs = 1_000_000_000;
        let fleet = fleet(config, transport, &urls(2));

        let summary = fleet.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.started, 2);
        assert_eq!(summary.attached, 2);
        assert_eq!(summary.terminated, 2);
        assert_eq!(summary.aborted, 0);
    }

    #[derive(Default)]
    struct RecordingSink {
        latency: Duration,
        reports: Mutex<Vec<StatsReport>>,
    }

    #[async_trait]
    impl StatsSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn publish(&self, report: StatsReport) -> Result<(), SwarmError> {
            tokio::time::sleep(self.latency).await;
            self.reports.lock().push(report);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn statistics_are_published_every_interval() {
        let transport = Arc::new(ScriptedTransport::new());
        for i in 0..2 {
            transport.route(&format!("https://edge.example/s{i}/index.m3u8"), Reply::Hang);
        }
        let sink = Arc::new(RecordingSink::default());
        let fleet = fleet(SwarmConfig::default(), transport, &urls(2))
            .with_stats_sink(sink.clone());

        let token = CancellationToken::new();
        let run = tokio::spawn(fleet.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(125)).await;
        token.cancel();
        run.await.unwrap().unwrap();

        let reports = sink.reports.lock().clone();
        assert!(reports.len() >= 2, "got {} reports", reports.len());
        assert_eq!(reports[0].unattached, 2);
        assert_eq!(reports[0].max_streams, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_pending_reports() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.route("https://edge.example/s0/index.m3u8", Reply::Hang);
        let sink = Arc::new(RecordingSink {
            latency: Duration::from_secs(30),
            ..Default::default()
        });
        let config = SwarmConfig {
            stats: StatsConfig { interval_secs: 10 },
            ..config(AdmissionConfig {
                max_streams: 1,
                ..Default::default()
            })
        };
        let fleet = fleet(config, transport, &urls(1)).with_stats_sink(sink.clone());

        let token = CancellationToken::new();
        let run = tokio::spawn(fleet.run(token.clone()));
        // The first report goes out within one interval and is still publishing here.
        tokio::time::sleep(Duration::from_secs(11)).await;
        token.cancel();
        run.await.unwrap().unwrap();

        assert!(!sink.reports.lock().is_empty());
    }

    #[test]
    fn observations_are_not_kept_without_a_sink() {
        let mut fleet = idle_fleet(SwarmConfig::default());
        let _rx = attach(&mut fleet, 1, 0);
        fleet
            .handle_event(event(1, ClientEventKind::BadService))
            .unwrap();
        fleet
            .handle_event(event(1, ClientEventKind::SlowServer))
            .unwrap();

        let report = fleet.stats.report(1, 0, 3);
        assert_eq!(report.bad_service, 0);
        assert_eq!(report.slow_server, 0);
        // Slowness still steers the ramp.
        assert!(fleet.snapshot().seen_slowness);
    }

    /// Drains the timer queue, returning each entry with its delay from now.
    fn pending_timers(fleet: &mut FleetManager) -> Vec<(Duration, FleetTimer)> {
        let now = Instant::now();
        std::iter::from_fn(|| {
            let deadline = fleet.timers.next_deadline()?;
            fleet.timers.pop_due(deadline).map(|timer| (deadline - now, timer))
        })
        .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn dynamic_mode_starts_a_share_right_away() {
        let mut fleet = idle_fleet(config(AdmissionConfig {
            max_streams: 10,
            dynamic: true,
            immediate_factor: 0.25,
            ..Default::default()
        }));
        fleet.start(&CancellationToken::new()).unwrap();

        let timers = pending_timers(&mut fleet);
        let starts: Vec<Duration> = timers
            .iter()
            .filter(|(_, timer)| *timer == FleetTimer::StartStream)
            .map(|(delay, _)| *delay)
            .collect();
        // round(10 * 0.25)
        assert_eq!(starts.len(), 3);
        assert!(starts.iter().all(|delay| *delay < Duration::from_secs(10)));
        assert_eq!(
            timers.iter().filter(|(_, timer)| *timer == FleetTimer::Ramp).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn soft_start_slows_the_ramp_until_something_attaches() {
        let ramp_delay = |soft_start: bool, attached: bool| {
            let mut fleet = idle_fleet(config(AdmissionConfig {
                max_streams: 10,
                dynamic: true,
                soft_start,
                ..Default::default()
            }));
            let _rx = attached.then(|| attach(&mut fleet, 1, 0));
            fleet.start(&CancellationToken::new()).unwrap();
            match pending_timers(&mut fleet).as_slice() {
                [(delay, FleetTimer::Ramp)] => *delay,
                other => panic!("unexpected timers {other:?}"),
            }
        };

        let plain = ramp_delay(false, false);
        assert!(plain > Duration::ZERO && plain < Duration::from_secs(20));
        assert_eq!(ramp_delay(true, false), plain * 10);
        assert_eq!(ramp_delay(true, true), plain);
    }
}
