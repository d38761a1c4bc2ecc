use std::collections::VecDeque;

use tracing::{info, warn};
use url::Url;

use crate::config::TransportConfig;
use crate::error::SwarmError;

/// A stream URL together with its zero-based line in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedUrl {
    pub url: Url,
    pub line: u64,
}

#[derive(Debug)]
enum Feed {
    /// The same stream for every session
    Fixed(String),
    Lines(VecDeque<String>),
}

/// Hands out stream URLs to new sessions.
///
/// Line numbers count every line of the input, including skipped
/// and unusable ones, so they can be persisted and used to resume.
#[derive(Debug)]
pub struct UrlSource {
    feed: Feed,
    next_line: u64,
    protocol: String,
    host: Option<String>,
    skipped: u64,
}

impl UrlSource {
    pub fn fixed(url: impl Into<String>) -> Self {
        Self {
            feed: Feed::Fixed(url.into()),
            next_line: 0,
            protocol: "https".to_owned(),
            host: None,
            skipped: 0,
        }
    }

    /// One URL per line, starting after the first `skip` lines.
    pub fn from_lines(text: &str, skip: u64) -> Self {
        let lines = text
            .lines()
            .skip(usize::try_from(skip).unwrap_or(usize::MAX))
            .map(str::to_owned)
            .collect();
        Self {
            feed: Feed::Lines(lines),
            next_line: skip,
            protocol: "https".to_owned(),
            host: None,
            skipped: 0,
        }
    }

    /// Path-only entries are resolved against this protocol and host.
    pub fn with_transport(mut self, transport: &TransportConfig) -> Self {
        self.protocol = transport.protocol.clone();
        self.host = transport.stream_host.clone();
        self
    }

    /// Next usable URL, or `None` once the list is used up.
    pub fn next_url(&mut self) -> Option<SourcedUrl> {
        loop {
            let raw = match &mut self.feed {
                Feed::Fixed(url) => url.clone(),
                Feed::Lines(lines) => lines.pop_front()?,
            };
            let line = self.next_line;
            self.next_line += 1;

            let raw = raw.trim();
            if raw.ends_with(".f4m") {
                info!(line, url = raw, "HDS is not supported, skipping");
            } else if !raw.is_empty() {
                match self.prepare(raw) {
                    Ok(url) => return Some(SourcedUrl { url, line }),
                    Err(e) => warn!(line, error = %e, "Skipping unusable stream URL"),
                }
            }
            self.skipped += 1;
            // A fixed stream that cannot be played never becomes playable.
            if matches!(self.feed, Feed::Fixed(_)) {
                self.feed = Feed::Lines(VecDeque::new());
                return None;
            }
        }
    }

    pub fn is_exhausted(&self) -> bool {
        match &self.feed {
            Feed::Fixed(_) => false,
            Feed::Lines(lines) => lines.is_empty(),
        }
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn prepare(&self, raw: &str) -> Result<Url, SwarmError> {
        if raw.starts_with('/') {
            let host = self.host.as_deref().ok_or_else(|| {
                SwarmError::invalid_url(raw, "path-only URL without a stream host")
            })?;
            let full = format!("{}://{}{}", self.protocol, host, raw);
            return Url::parse(&full).map_err(|e| SwarmError::invalid_url(full, e.to_string()));
        }
        Url::parse(raw).map_err(|e| SwarmError::invalid_url(raw, e.to_string()))
    }
}
