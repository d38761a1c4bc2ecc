// HLS load generation: simulated viewers and the fleet that drives them
pub mod client;
pub mod config;
pub mod cooloff;
pub mod error;
pub mod fleet;
pub mod schedule;
pub mod transport;

#[cfg(test)]
mod testing;

// Export common types for ease of use
pub use client::{ClientEvent, ClientEventKind, ClientHandle, SessionId, SimulatedClient};
pub use config::{
    AdmissionConfig, BitrateSelection, PlaybackConfig, QualityConfig, StartPosition, StatsConfig,
    SwarmConfig, TransportConfig, UtilizationConfig,
};
pub use cooloff::Cooloff;
pub use error::{ManifestError, Result, SwarmError, TransportError};
pub use fleet::{
    FileResumeStore, FleetManager, FleetSummary, InfluxConfig, InfluxStatsSink, LogStatsSink,
    UrlSource, read_resume_state,
};
pub use transport::{ReqwestTransport, Transport};
