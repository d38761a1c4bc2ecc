use std::collections::BTreeMap;

use reqwest::StatusCode;

use super::manifest::{MediaManifest, Segment};

#[derive(Debug, Clone)]
pub struct BufferedSegment {
    pub segment: Segment,
    pub status: StatusCode,
}

impl BufferedSegment {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Fetched segments waiting to be played, keyed and ordered by sequence number.
///
/// Also counts, per requested sequence number, how many refresh cycles have
/// asked for it. A count above one means the origin is slow.
#[derive(Debug, Default)]
pub struct PlaybackBuffer {
    entries: BTreeMap<u64, BufferedSegment>,
    requests: BTreeMap<u64, u32>,
}

impl PlaybackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the sequence number is already buffered.
    pub fn insert(&mut self, segment: Segment, status: StatusCode) -> bool {
        if self.entries.contains_key(&segment.sequence) {
            return false;
        }
        self.entries
            .insert(segment.sequence, BufferedSegment { segment, status });
        true
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.entries.contains_key(&sequence)
    }

    pub fn front_sequence(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }

    pub fn pop_front(&mut self) -> Option<BufferedSegment> {
        self.entries.pop_first().map(|(_, entry)| entry)
    }

    /// True when nothing buffered was fetched successfully (including when empty).
    pub fn all_failed(&self) -> bool {
        !self.entries.values().any(BufferedSegment::is_success)
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    /// Records one more request for `sequence` and returns how many there have been.
    pub fn register_request(&mut self, sequence: u64) -> u32 {
        let count = self.requests.entry(sequence).or_insert(0);
        *count += 1;
        *count
    }

    /// Forgets request counts for everything below `sequence`.
    pub fn forget_requests_below(&mut self, sequence: u64) {
        self.requests = self.requests.split_off(&sequence);
    }

    pub fn outstanding_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.requests.clear();
    }

    /// Segments of the `[next, next + window)` range that are in `manifest`
    /// but not yet buffered, in playback order.
    pub fn missing<'a>(
        &self,
        manifest: &'a MediaManifest,
        next: u64,
        window: usize,
    ) -> Vec<&'a Segment> {
        (next..next.saturating_add(window as u64))
            .filter(|seq| !self.contains(*seq))
            .filter_map(|seq| manifest.segment(seq))
            .collect()
    }
}
