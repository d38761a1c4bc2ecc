// Simulated HLS viewer.
//
// One client is one tokio task. Everything it does is driven from a single
// loop: fleet commands, completed requests and its own timer queue. Handlers
// never block; they schedule timers or start requests and return.

pub mod buffer;
pub mod events;
pub mod manifest;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use rand::rngs::StdRng;
use rand::RngExt;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::config::{PlaybackConfig, StartPosition};
use crate::error::{ManifestError, SwarmError, TransportError};
use crate::schedule::{TimerId, TimerQueue, sleep_until};
use crate::transport::{FetchOptions, FetchResponse, Transport};

pub use buffer::{BufferedSegment, PlaybackBuffer};
pub use events::{
    ClientCommand, ClientEvent, ClientEventKind, ClientHandle, EndReason, EventSender, SessionId,
};
pub use manifest::{MediaManifest, Segment, parse_media_manifest};

/// Manifest retry delay before the first target duration is known.
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(10);
/// Buffer checks per segment duration while waiting for data.
const WAITS_PER_SEGMENT: u32 = 5;
const MIN_WAIT_INTERVAL: Duration = Duration::from_millis(10);
const MAX_FETCHES_PER_REFRESH: usize = 2;
const INITIAL_FETCHES: usize = 2;
const BEGINNING_WINDOW: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unattached,
    Attached,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManifestPurpose {
    Attach,
    Refresh,
    Reattach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    SessionExpired,
    RefreshManifest,
    Refill,
    Play,
    RetryManifest(ManifestPurpose),
    FinishReattach,
}

enum Completion {
    Manifest {
        purpose: ManifestPurpose,
        result: Result<FetchResponse, TransportError>,
    },
    Segment {
        segment: Segment,
        result: Result<FetchResponse, TransportError>,
    },
}

enum Wake {
    Command(Option<ClientCommand>),
    Completed(Completion),
    Timer,
}

/// Shared pieces every client of a fleet is built from.
#[derive(Clone)]
pub struct ClientContext {
    pub config: Arc<PlaybackConfig>,
    pub transport: Arc<dyn Transport>,
    pub events: EventSender,
}

/// What the fleet decided for one session before the client exists.
#[derive(Debug, Clone)]
pub struct ClientTarget {
    pub session: SessionId,
    pub manifest_url: Url,
    pub bandwidth: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSummary {
    pub session: SessionId,
    pub segments_played: u64,
    pub stream_time: Duration,
}

pub struct SimulatedClient {
    session: SessionId,
    manifest_url: Url,
    bandwidth: u64,
    config: Arc<PlaybackConfig>,
    transport: Arc<dyn Transport>,
    events: EventSender,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    rng: StdRng,

    lifecycle: Lifecycle,
    /// Set once the `Attached` event went out
    announced: bool,
    reattaching: bool,
    live: Option<bool>,
    manifest: Option<MediaManifest>,
    segment_duration: Option<Duration>,
    buffer: PlaybackBuffer,
    next_to_play: Option<u64>,
    played: u64,
    buffer_waits: u32,
    stream_time: Duration,
    playback_started: Option<Instant>,
    retries_left: u32,
    session_timer: Option<TimerId>,
    timers: TimerQueue<Timer>,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
}

impl SimulatedClient {
    pub fn new(
        target: ClientTarget,
        context: ClientContext,
        commands: mpsc::UnboundedReceiver<ClientCommand>,
        rng: StdRng,
    ) -> Self {
        let retries_left = context.config.max_retries;
        Self {
            session: target.session,
            manifest_url: target.manifest_url,
            bandwidth: target.bandwidth,
            config: context.config,
            transport: context.transport,
            events: context.events,
            commands,
            rng,
            lifecycle: Lifecycle::Unattached,
            announced: false,
            reattaching: false,
            live: None,
            manifest: None,
            segment_duration: None,
            buffer: PlaybackBuffer::new(),
            next_to_play: None,
            played: 0,
            buffer_waits: 0,
            stream_time: Duration::ZERO,
            playback_started: None,
            retries_left,
            session_timer: None,
            timers: TimerQueue::new(),
            in_flight: FuturesUnordered::new(),
        }
    }

    /// Drives the session until it emits its terminal event or the fleet goes away.
    #[instrument(name = "client", skip_all, fields(session = %self.session))]
    pub async fn run(mut self) -> PlaybackSummary {
        debug!(url = %self.manifest_url, bandwidth = self.bandwidth, "Client starting");
        self.request_manifest(ManifestPurpose::Attach);

        while !self.is_terminating() {
            self.step().await;
        }

        self.lifecycle = Lifecycle::Terminated;
        PlaybackSummary {
            session: self.session,
            segments_played: self.played,
            stream_time: self.stream_time,
        }
    }

    /// Waits for the next command, completed request or due timer and handles it.
    async fn step(&mut self) {
        let deadline = self.timers.next_deadline();
        let wake = tokio::select! {
            biased;
            command = self.commands.recv() => Wake::Command(command),
            Some(done) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                Wake::Completed(done)
            }
            _ = sleep_until(deadline) => Wake::Timer,
        };

        match wake {
            Wake::Command(Some(command)) => self.on_command(command),
            Wake::Command(None) => {
                debug!("Command channel closed, shutting down");
                self.tear_down();
            }
            Wake::Completed(Completion::Manifest { purpose, result }) => {
                self.on_manifest_response(purpose, result)
            }
            Wake::Completed(Completion::Segment { segment, result }) => {
                self.on_segment_response(segment, result)
            }
            Wake::Timer => {
                if let Some(timer) = self.timers.pop_due(Instant::now()) {
                    self.on_timer(timer);
                }
            }
        }
    }

    fn on_command(&mut self, command: ClientCommand) {
        debug!(?command, "Command received");
        match command {
            ClientCommand::Terminate => self.terminate(EndReason::Requested),
            ClientCommand::Kill => self.kill(),
            ClientCommand::Abort => self.abort_or_terminate("aborted by fleet".to_owned()),
            ClientCommand::Reattach => self.reattach(),
        }
    }

    fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::SessionExpired => {
                info!("Session length reached");
                self.terminate(EndReason::SessionExpired);
            }
            Timer::RefreshManifest => {
                if self.reattaching {
                    debug!("Reattach in progress, skipping manifest refresh");
                } else {
                    self.request_manifest(ManifestPurpose::Refresh);
                }
            }
            Timer::Refill => self.refresh(),
            Timer::Play => self.wait_for_buffering(),
            Timer::RetryManifest(purpose) => self.request_manifest(purpose),
            Timer::FinishReattach => self.finish_reattach(),
        }
    }

    // --- manifest handling ---

    fn request_manifest(&mut self, purpose: ManifestPurpose) {
        debug!(?purpose, "Fetching manifest");
        let transport = Arc::clone(&self.transport);
        let url = self.manifest_url.clone();
        self.in_flight.push(Box::pin(async move {
            let result = transport.fetch(&url, FetchOptions::default()).await;
            Completion::Manifest { purpose, result }
        }));
    }

    fn on_manifest_response(
        &mut self,
        purpose: ManifestPurpose,
        result: Result<FetchResponse, TransportError>,
    ) {
        let err = match result {
            Ok(response) if response.status == StatusCode::OK => {
                self.retries_left = self.config.max_retries;
                match parse_media_manifest(&response.text(), &self.manifest_url, self.next_to_play)
                {
                    Ok(manifest) => self.on_manifest(purpose, manifest),
                    Err(e) => {
                        error!(error = %e, "Malformed manifest");
                        self.abort_or_terminate(format!("malformed manifest: {e}"));
                    }
                }
                return;
            }
            Ok(response) if response.is_redirect() => {
                info!(status = %response.status, url = %self.manifest_url, "Manifest redirected");
                self.redirected();
                return;
            }
            Ok(response) => SwarmError::http_status(response.status, self.manifest_url.as_str()),
            Err(e) => SwarmError::from(e),
        };

        if !err.is_retryable() {
            warn!(error = %err, "Manifest request rejected");
            self.abort_or_terminate(err.to_string());
            return;
        }
        if self.retries_left == 0 {
            warn!(error = %err, max = self.config.max_retries, "Manifest retries exhausted");
            self.abort_or_terminate(format!("retries exhausted: {err}"));
            return;
        }
        self.retries_left -= 1;

        let delay = self.segment_duration.unwrap_or(INITIAL_RETRY_DELAY);
        warn!(
            retries_left = self.retries_left,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Manifest request failed, retrying"
        );
        self.timers.schedule(delay, Timer::RetryManifest(purpose));
    }

    fn on_manifest(&mut self, purpose: ManifestPurpose, mut manifest: MediaManifest) {
        let declared_live = manifest.is_live();
        match self.live {
            None => {
                debug!(live = declared_live, playlist_type = ?manifest.playlist_type, "Stream classified");
                self.live = Some(declared_live);
            }
            Some(true) if !declared_live => {
                error!(playlist_type = ?manifest.playlist_type, "Live stream turned into a non-live playlist");
                self.abort_or_terminate("playlist type contradicts live classification".to_owned());
                return;
            }
            Some(_) => {}
        }

        self.segment_duration = Some(manifest.target_duration);
        if self.is_live() && self.next_to_play.is_some() {
            manifest.truncate(self.config.buffer_size);
        }

        let starting = matches!(purpose, ManifestPurpose::Attach | ManifestPurpose::Reattach);
        if starting && manifest.segments.is_empty() {
            self.manifest = Some(manifest);
            self.abort_or_terminate(ManifestError::Empty.to_string());
            return;
        }
        self.manifest = Some(manifest);

        match purpose {
            ManifestPurpose::Attach => {
                if !self.announced {
                    self.announced = true;
                    self.emit(ClientEventKind::Attached);
                }
                self.attach();
            }
            ManifestPurpose::Refresh => self.refresh(),
            ManifestPurpose::Reattach => {
                self.reattaching = false;
                debug!("Counters cleared, attaching again");
                self.attach();
            }
        }
    }

    // --- playback ---

    fn attach(&mut self) {
        self.lifecycle = Lifecycle::Attached;

        if let Some(previous) = self.session_timer.take() {
            self.timers.cancel(previous);
        }
        let length = self.session_length();
        debug!(session_secs = length.as_secs_f64(), "Session length drawn");
        self.session_timer = Some(self.timers.schedule(length, Timer::SessionExpired));
        self.timers
            .schedule(self.segment_duration(), Timer::RefreshManifest);

        let window = self.start_window();
        let Some(first) = window.first() else {
            return;
        };
        self.next_to_play = Some(first.sequence);
        info!(
            url = %self.manifest_url,
            live = self.is_live(),
            first = first.sequence,
            "Attached to stream"
        );
        for segment in window.into_iter().take(INITIAL_FETCHES) {
            self.fetch_segment(segment);
        }

        self.wait_for_buffering();
    }

    /// Segments around the configured start point; playback begins at the first.
    fn start_window(&mut self) -> Vec<Segment> {
        let Some(manifest) = &self.manifest else {
            return Vec::new();
        };
        let segments = &manifest.segments;
        let n = segments.len();
        let buffer_size = self.config.buffer_size;

        let position = match self.config.start_position {
            StartPosition::Auto if self.live.unwrap_or(true) => StartPosition::End,
            StartPosition::Auto => StartPosition::Beginning,
            other => other,
        };
        let range = match position {
            StartPosition::Random => {
                let max_start = n.saturating_sub(buffer_size);
                let start = self.rng.random_range(0..=max_start);
                debug!(start, max_start, "Starting at random point");
                start..(start + INITIAL_FETCHES).min(n)
            }
            StartPosition::End => n.saturating_sub(buffer_size)..n,
            StartPosition::Beginning | StartPosition::Auto => 0..BEGINNING_WINDOW.min(n),
        };
        segments[range].to_vec()
    }

    fn wait_for_buffering(&mut self) {
        if self.is_terminating() || self.reattaching {
            debug!("Not attached, stopping play loop");
            return;
        }

        let next = self.next_to_play;
        if next.is_some() && self.buffer.front_sequence() == next {
            self.buffer_waits = 0;
            self.play_segment();
            return;
        }

        if !self.is_live() {
            let last = self.manifest.as_ref().and_then(MediaManifest::last_sequence);
            if let (Some(last), Some(next)) = (last, next) {
                if last <= next {
                    info!(last, next, "Reached end of stream");
                    self.terminate(EndReason::EndOfStream);
                    return;
                }
            }
        }

        let segment_duration = self.segment_duration();
        let interval = (segment_duration / WAITS_PER_SEGMENT).max(MIN_WAIT_INTERVAL);
        if self.played == 0 {
            debug!(waiting_for = ?next, "Buffering");
        } else {
            self.buffer_waits += 1;
            if interval * self.buffer_waits > segment_duration {
                warn!(waiting_for = ?next, waits = self.buffer_waits, "Very bad service");
                self.emit(ClientEventKind::VeryBadService);
            } else {
                debug!(waiting_for = ?next, waits = self.buffer_waits, "Bad service");
                self.emit(ClientEventKind::BadService);
            }
        }
        self.timers.schedule(interval, Timer::Play);
    }

    fn play_segment(&mut self) {
        let Some(entry) = self.buffer.pop_front() else {
            return;
        };
        let sequence = entry.segment.sequence;
        let Some(following) = sequence.checked_add(1) else {
            self.abort_or_terminate(ManifestError::SequenceOverflow { last: sequence }.to_string());
            return;
        };
        self.buffer.forget_requests_below(sequence);

        let now = Instant::now();
        let started = *self.playback_started.get_or_insert(now);
        let wallclock = now - started;
        self.next_to_play = Some(following);
        self.played += 1;

        // max(0, duration - (wallclock - stream_time)) without going negative
        let delay = (self.stream_time + entry.segment.duration).saturating_sub(wallclock);
        debug!(
            seq = sequence,
            stream_secs = self.stream_time.as_secs_f64(),
            clock_secs = wallclock.as_secs_f64(),
            next_in_ms = delay.as_millis() as u64,
            "Playing segment"
        );
        self.timers.schedule(delay, Timer::Play);

        if !entry.is_success() {
            warn!(seq = sequence, status = %entry.status, "Segment failed to download, skipping");
            self.terminate_if_all_segments_failed();
        }
        self.stream_time += entry.segment.duration;
    }

    fn terminate_if_all_segments_failed(&mut self) {
        if self.config.pester_slow_server {
            return;
        }
        if self.buffer.all_failed() {
            error!(buffered = ?self.buffer.sequences(), "All buffered segments failed");
            self.abort_or_terminate("all buffered segments failed".to_owned());
        }
    }

    // --- buffer refill ---

    fn refresh(&mut self) {
        if self.reattaching || self.is_terminating() {
            debug!("Reattach or termination in progress, stopping refresh");
            return;
        }
        self.refill_buffer();
        let next = if self.is_live() {
            Timer::RefreshManifest
        } else {
            Timer::Refill
        };
        self.timers.schedule(self.segment_duration(), next);
    }

    fn refill_buffer(&mut self) {
        let (Some(next), Some(manifest)) = (self.next_to_play, &self.manifest) else {
            return;
        };
        let missing: Vec<Segment> = self
            .buffer
            .missing(manifest, next, self.config.buffer_size)
            .into_iter()
            .take(MAX_FETCHES_PER_REFRESH)
            .cloned()
            .collect();
        debug!(
            buffered = ?self.buffer.sequences(),
            outstanding = self.buffer.outstanding_requests(),
            missing = ?missing.iter().map(|s| s.sequence).collect::<Vec<_>>(),
            "Refilling buffer"
        );
        for segment in missing {
            self.fetch_segment(segment);
        }
    }

    fn fetch_segment(&mut self, segment: Segment) {
        let sequence = segment.sequence;
        if self.buffer.contains(sequence) {
            debug!(seq = sequence, "Already buffered, not fetching");
            return;
        }

        let requests = self.buffer.register_request(sequence);
        if requests > 1 {
            warn!(seq = sequence, requests, "Segment still outstanding, server is slow");
            self.emit(ClientEventKind::SlowServer);
            if !self.config.pester_slow_server {
                return;
            }
        }

        debug!(seq = sequence, url = %segment.uri, "Fetching segment");
        let transport = Arc::clone(&self.transport);
        self.in_flight.push(Box::pin(async move {
            let result = transport
                .fetch(&segment.uri, FetchOptions::discard_body())
                .await;
            Completion::Segment { segment, result }
        }));
    }

    fn on_segment_response(
        &mut self,
        segment: Segment,
        result: Result<FetchResponse, TransportError>,
    ) {
        let status = match result {
            Err(e) => {
                warn!(seq = segment.sequence, error = %e, "Segment request failed");
                return;
            }
            // The redirect target is assumed to deliver the segment.
            Ok(response) if response.is_redirect() => StatusCode::OK,
            Ok(response) => {
                if response.status.is_success() {
                    debug!(seq = segment.sequence, bytes = response.body_len, "Segment downloaded");
                } else {
                    warn!(seq = segment.sequence, status = %response.status, url = %segment.uri, "Segment request not OK");
                }
                response.status
            }
        };

        if self.reattaching {
            debug!(seq = segment.sequence, "Reattach in progress, dropping segment");
            return;
        }
        if self.next_to_play.is_some_and(|next| segment.sequence < next) {
            debug!(seq = segment.sequence, "Segment arrived late, dropping");
            return;
        }
        let sequence = segment.sequence;
        if !self.buffer.insert(segment, status) {
            debug!(seq = sequence, "Segment already buffered");
        }
    }

    // --- lifecycle ---

    fn reattach(&mut self) {
        if self.lifecycle != Lifecycle::Attached {
            debug!(lifecycle = ?self.lifecycle, "Not attached, ignoring reattach");
            return;
        }
        info!("Reattaching");
        self.lifecycle = Lifecycle::Unattached;
        self.reattaching = true;
        self.timers.cancel_where(|t| {
            matches!(
                t,
                Timer::Play | Timer::Refill | Timer::RefreshManifest | Timer::RetryManifest(_)
            )
        });
        self.timers
            .schedule(self.segment_duration(), Timer::FinishReattach);
    }

    fn finish_reattach(&mut self) {
        self.buffer.clear();
        self.next_to_play = None;
        self.played = 0;
        self.buffer_waits = 0;
        self.stream_time = Duration::ZERO;
        self.playback_started = None;
        self.request_manifest(ManifestPurpose::Reattach);
    }

    fn terminate(&mut self, reason: EndReason) {
        info!(?reason, played = self.played, "Terminating");
        self.tear_down();
        self.emit(ClientEventKind::Terminated(reason));
    }

    fn kill(&mut self) {
        info!(played = self.played, "Killed");
        self.tear_down();
        self.emit(ClientEventKind::Killed);
    }

    fn abort(&mut self, reason: String) {
        info!(%reason, "Aborting");
        self.tear_down();
        self.emit(ClientEventKind::Aborted(reason));
    }

    fn abort_or_terminate(&mut self, reason: String) {
        if self.announced {
            self.terminate(EndReason::Failed(reason));
        } else {
            self.abort(reason);
        }
    }

    fn redirected(&mut self) {
        self.tear_down();
        self.emit(ClientEventKind::Redirected {
            attached: self.announced,
        });
    }

    /// Cancels timers and drops in-flight requests.
    fn tear_down(&mut self) {
        self.lifecycle = Lifecycle::Terminating;
        self.timers.clear();
        self.session_timer = None;
        if !self.in_flight.is_empty() {
            debug!(requests = self.in_flight.len(), "Aborting in-flight requests");
        }
        self.in_flight = FuturesUnordered::new();
    }

    // --- helpers ---

    fn emit(&self, kind: ClientEventKind) {
        let event = ClientEvent {
            session: self.session,
            kind,
        };
        if self.events.send(event).is_err() {
            debug!("Fleet stopped listening");
        }
    }

    fn is_terminating(&self) -> bool {
        matches!(
            self.lifecycle,
            Lifecycle::Terminating | Lifecycle::Terminated
        )
    }

    /// Streams without a declared type are treated as live.
    fn is_live(&self) -> bool {
        self.live.unwrap_or(true)
    }

    fn segment_duration(&self) -> Duration {
        self.segment_duration.unwrap_or(Duration::from_secs(1))
    }

    /// Uniform in [0, 2 * average).
    fn session_length(&mut self) -> Duration {
        let avg = self.config.avg_session().as_secs_f64();
        Duration::try_from_secs_f64(self.rng.random::<f64>() * avg * 2.0).unwrap_or(Duration::MAX)
    }
}
