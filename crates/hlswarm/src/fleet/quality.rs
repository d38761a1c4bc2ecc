// Quality list handling: parse a master playlist and pick the variant a new
// session will play.

use m3u8_rs::{Playlist, parse_playlist_res};
use rand::RngExt;
use rand::rngs::StdRng;
use tracing::debug;
use url::Url;

use crate::config::{BitrateSelection, QualityConfig};
use crate::error::SwarmError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quality {
    pub url: Url,
    /// Advertised bandwidth in bits/s; zero when unknown
    pub bandwidth: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QualityList {
    Variants(Vec<Quality>),
    /// The URL already points at a media playlist
    Media,
}

/// Parses a quality list fetched from `url`.
pub fn parse_quality_list(body: &[u8], url: &Url) -> Result<QualityList, SwarmError> {
    match parse_playlist_res(body) {
        Ok(Playlist::MasterPlaylist(master)) => {
            let variants = master
                .variants
                .into_iter()
                .filter(|v| !v.is_i_frame)
                .map(|v| {
                    url.join(&v.uri)
                        .map(|variant_url| Quality {
                            url: variant_url,
                            bandwidth: v.bandwidth,
                        })
                        .map_err(|e| SwarmError::invalid_url(v.uri.clone(), e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(QualityList::Variants(variants))
        }
        Ok(Playlist::MediaPlaylist(_)) => Ok(QualityList::Media),
        Err(e) => Err(SwarmError::quality(format!(
            "failed to parse quality list from {url}: {e}"
        ))),
    }
}

/// Picks one variant according to `config`.
///
/// Fails on an empty list, or when audio-only lists are skipped and the best
/// variant is below the audio threshold.
pub fn select_quality<'a>(
    qualities: &'a [Quality],
    config: &QualityConfig,
    rng: &mut StdRng,
) -> Result<&'a Quality, SwarmError> {
    let best = qualities
        .iter()
        .max_by_key(|q| q.bandwidth)
        .ok_or_else(|| SwarmError::quality("quality list has no variants"))?;

    if config.skip_audio_only && best.bandwidth < config.audio_only_threshold {
        return Err(SwarmError::quality(format!(
            "best bandwidth {} is below the audio-only threshold {}",
            best.bandwidth, config.audio_only_threshold
        )));
    }

    let pick = match config.selection {
        BitrateSelection::Best => best,
        BitrateSelection::Random => random_quality(qualities, rng),
        BitrateSelection::Biased => {
            let roll = rng.random_range(1..=100u32);
            if roll <= config.biased_best_percent {
                best
            } else {
                random_quality(qualities, rng)
            }
        }
    };
    debug!(
        bandwidth = pick.bandwidth,
        url = %pick.url,
        selection = ?config.selection,
        "Selected quality"
    );
    Ok(pick)
}

fn random_quality<'a>(qualities: &'a [Quality], rng: &mut StdRng) -> &'a Quality {
    &qualities[rng.random_range(0..qualities.len())]
}
