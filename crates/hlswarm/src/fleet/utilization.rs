// Server utilization probe. While the server reports utilization at or above
// the configured maximum, the fleet does not start new sessions.

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use rand::rngs::StdRng;
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SwarmError;
use crate::transport::{FetchOptions, Transport};

#[derive(Debug, Deserialize)]
struct UtilizationReport {
    sys_utilization: f64,
}

pub struct UtilizationProbe {
    url: Url,
    max_percent: f64,
    interval: Duration,
    transport: Arc<dyn Transport>,
}

impl UtilizationProbe {
    pub fn new(
        url: Url,
        max_percent: f64,
        interval: Duration,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            url,
            max_percent,
            interval,
            transport,
        }
    }

    /// Starts polling. The receiver reads `true` while new sessions are allowed.
    pub fn spawn(self, rng: &mut StdRng, token: CancellationToken) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(true);
        let first = self.interval.mul_f64(rng.random::<f64>());
        tokio::spawn(self.run(first, tx, token));
        rx
    }

    async fn run(self, first: Duration, tx: watch::Sender<bool>, token: CancellationToken) {
        let mut delay = first;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.interval;

            match self.poll().await {
                Ok(utilization) => {
                    let ok = utilization < self.max_percent;
                    let previous = tx.send_replace(ok);
                    if previous != ok {
                        info!(utilization, max = self.max_percent, ok, "Utilization state changed");
                    } else {
                        debug!(utilization, ok, "Utilization polled");
                    }
                }
                // The previous state stands until the next successful poll.
                Err(e) => warn!(url = %self.url, error = %e, "Utilization poll failed"),
            }
            if tx.is_closed() {
                return;
            }
        }
    }

    async fn poll(&self) -> Result<f64, SwarmError> {
        let response = self
            .transport
            .fetch(&self.url, FetchOptions::default())
            .await?;
        if !response.status.is_success() {
            return Err(SwarmError::http_status(response.status, self.url.as_str()));
        }
        parse_utilization(&response.body)
    }
}

pub fn parse_utilization(body: &[u8]) -> Result<f64, SwarmError> {
    let report: UtilizationReport = serde_json::from_slice(body).map_err(|e| {
        SwarmError::configuration(format!("invalid utilization report: {e}"))
    })?;
    Ok(report.sys_utilization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedTransport};
    use rand::SeedableRng;

    const URL: &str = "http://edge.example/utilization.json";

    #[test]
    fn parses_report() {
        assert_eq!(parse_utilization(br#"{"sys_utilization": 42.5}"#).unwrap(), 42.5);
        assert!(parse_utilization(b"busy").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_threshold_and_keeps_state_on_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push(URL, Reply::ok(r#"{"sys_utilization": 95.0}"#))
            .push(URL, Reply::Fail)
            .push(URL, Reply::status(500))
            .route(URL, Reply::ok(r#"{"sys_utilization": 40.0}"#));

        let probe = UtilizationProbe::new(
            Url::parse(URL).unwrap(),
            90.0,
            Duration::from_secs(5),
            transport.clone(),
        );
        let token = CancellationToken::new();
        let mut rng = StdRng::seed_from_u64(1);
        let mut ok = probe.spawn(&mut rng, token.clone());
        assert!(*ok.borrow());

        ok.changed().await.unwrap();
        assert!(!*ok.borrow_and_update());
        assert_eq!(transport.count(URL), 1);

        // Two failed polls leave the overload state in place.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(transport.count(URL) >= 3);

        ok.changed().await.unwrap();
        assert!(*ok.borrow());
        assert_eq!(transport.count(URL), 4);
        token.cancel();
    }
}
