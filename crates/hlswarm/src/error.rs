use reqwest::StatusCode;

/// Failure of a single network exchange, before any HTTP status is known.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("could not connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
}

impl TransportError {
    pub fn request(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Request {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_owned(),
            }
        } else if err.is_connect() {
            Self::Connect {
                url: url.to_owned(),
                reason: err.to_string(),
            }
        } else {
            Self::request(url, err.to_string())
        }
    }
}

/// Reasons a media manifest is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest does not start with #EXTM3U")]
    MissingHeader,

    #[error("invalid value `{value}` for {directive} on line {line}")]
    InvalidDirective {
        directive: &'static str,
        value: String,
        line: usize,
    },

    #[error("segment uri `{uri}` cannot be resolved: {reason}")]
    InvalidSegmentUri { uri: String, reason: String },

    #[error("manifest contains no segments")]
    Empty,

    #[error("segment numbering overflows after sequence {last}")]
    SequenceOverflow { last: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("quality list error: {reason}")]
    Quality { reason: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    /// Fleet bookkeeping no longer matches the sessions it spawned.
    #[error("session bookkeeping violated: {reason}")]
    Bookkeeping { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("HTTP client error: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },
}

impl SwarmError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn quality(reason: impl Into<String>) -> Self {
        Self::Quality {
            reason: reason.into(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn bookkeeping(reason: impl Into<String>) -> Self {
        Self::Bookkeeping {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    /// Whether a client should spend retry budget on this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::HttpStatus { status, .. } => !status.is_client_error(),
            Self::Http { source } => source.is_timeout() || source.is_connect(),
            Self::Configuration { .. }
            | Self::Manifest(_)
            | Self::Quality { .. }
            | Self::InvalidUrl { .. }
            | Self::Bookkeeping { .. }
            | Self::Io { .. } => false,
        }
    }
}

pub type Result<T, E = SwarmError> = std::result::Result<T, E>;
