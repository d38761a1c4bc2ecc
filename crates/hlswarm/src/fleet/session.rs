// Per-session startup: quality list fetch, variant selection, then hand-off to
// the simulated client.

use std::sync::Arc;

use rand::rngs::StdRng;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

use crate::client::{
    ClientCommand, ClientContext, ClientEvent, ClientEventKind, ClientTarget, PlaybackSummary,
    SessionId, SimulatedClient,
};
use crate::config::QualityConfig;
use crate::error::SwarmError;
use crate::transport::{FetchOptions, FetchResponse};

use super::quality::{QualityList, parse_quality_list, select_quality};

/// Everything needed to turn a stream URL into a running client.
#[derive(Clone)]
pub struct SessionFactory {
    pub quality: Arc<QualityConfig>,
    pub context: ClientContext,
}

enum Startup {
    Play(ClientTarget),
    Redirected,
    Aborted(String),
}

/// Runs one session from quality list to its terminal event.
///
/// Returns `None` when the session ended before a client was built.
pub async fn run_session(
    session: SessionId,
    url: Url,
    factory: SessionFactory,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    mut rng: StdRng,
) -> Option<PlaybackSummary> {
    let span = info_span!("session", session = %session);
    async move {
        let transport = Arc::clone(&factory.context.transport);
        let startup = tokio::select! {
            command = commands.recv() => match command {
                // Fleet is shutting down
                None => return None,
                Some(command) => {
                    debug!(?command, "Command while fetching quality list");
                    Startup::Aborted(format!("{command:?} before attach"))
                }
            },
            result = transport.fetch(&url, FetchOptions::default()) => {
                match result {
                    Ok(response) => startup_from(session, &url, response, &factory.quality, &mut rng),
                    Err(e) => {
                        warn!(url = %url, error = %e, "Quality list request failed");
                        Startup::Aborted(SwarmError::from(e).to_string())
                    }
                }
            }
        };

        let emit = |kind| {
            if factory.context.events.send(ClientEvent { session, kind }).is_err() {
                debug!("Fleet stopped listening");
            }
        };
        match startup {
            Startup::Play(target) => {
                let client = SimulatedClient::new(target, factory.context.clone(), commands, rng);
                Some(client.run().await)
            }
            Startup::Redirected => {
                emit(ClientEventKind::Redirected { attached: false });
                None
            }
            Startup::Aborted(reason) => {
                emit(ClientEventKind::Aborted(reason));
                None
            }
        }
    }
    .instrument(span)
    .await
}

fn startup_from(
    session: SessionId,
    url: &Url,
    response: FetchResponse,
    quality: &QualityConfig,
    rng: &mut StdRng,
) -> Startup {
    if response.is_redirect() {
        info!(status = %response.status, url = %url, "Quality list redirected");
        return Startup::Redirected;
    }
    if response.status != StatusCode::OK {
        let err = SwarmError::http_status(response.status, url.as_str());
        warn!(error = %err, "Quality list rejected");
        return Startup::Aborted(err.to_string());
    }

    let picked = parse_quality_list(&response.body, url).and_then(|list| match list {
        QualityList::Media => {
            debug!("Stream URL is a media playlist, using it directly");
            Ok((url.clone(), 0))
        }
        QualityList::Variants(variants) => {
            select_quality(&variants, quality, rng).map(|q| (q.url.clone(), q.bandwidth))
        }
    });
    match picked {
        Ok((manifest_url, bandwidth)) => Startup::Play(ClientTarget {
            session,
            manifest_url,
            bandwidth,
        }),
        Err(e) => {
            warn!(url = %url, error = %e, "No usable quality");
            Startup::Aborted(e.to_string())
        }
    }
}
