// Media playlist parsing.
//
// Line oriented on purpose: the running sequence number has to follow every
// MEDIA-SEQUENCE directive and already played segments are dropped while
// parsing, which a full playlist model does not give us.

use std::time::Duration;

use url::Url;

use crate::error::ManifestError;

const DEFAULT_TARGET_DURATION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub sequence: u64,
    pub uri: Url,
    pub duration: Duration,
}

/// One parsed snapshot of a media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaManifest {
    pub segments: Vec<Segment>,
    pub target_duration: Duration,
    /// Last MEDIA-SEQUENCE value seen, if any
    pub media_sequence: Option<u64>,
    pub playlist_type: Option<String>,
}

impl MediaManifest {
    /// VOD and EVENT playlists are not live; anything else is.
    pub fn is_live(&self) -> bool {
        !matches!(self.playlist_type.as_deref(), Some("VOD" | "EVENT"))
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.segments.last().map(|s| s.sequence)
    }

    pub fn segment(&self, sequence: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.sequence == sequence)
    }

    /// Keeps only the oldest `len` segments.
    pub fn truncate(&mut self, len: usize) {
        self.segments.truncate(len);
    }
}

/// Parses `text`, resolving segment URIs against `base`.
///
/// When `next_to_play` is set, segments numbered below it are dropped.
pub fn parse_media_manifest(
    text: &str,
    base: &Url,
    next_to_play: Option<u64>,
) -> Result<MediaManifest, ManifestError> {
    let mut lines = text.lines().enumerate().map(|(n, l)| (n + 1, l.trim()));

    match lines.by_ref().find(|(_, l)| !l.is_empty()) {
        Some((_, "#EXTM3U")) => {}
        _ => return Err(ManifestError::MissingHeader),
    }

    let mut manifest = MediaManifest {
        segments: Vec::new(),
        target_duration: DEFAULT_TARGET_DURATION,
        media_sequence: None,
        playlist_type: None,
    };
    let mut sequence = 0u64;
    let mut duration = Duration::ZERO;

    for (line_no, line) in lines {
        if line.is_empty() {
            continue;
        }

        if !line.starts_with('#') {
            // Every segment needs a successor number to hand to the play loop.
            let following = sequence
                .checked_add(1)
                .ok_or(ManifestError::SequenceOverflow { last: sequence })?;
            if next_to_play.is_none_or(|next| sequence >= next) {
                let uri = base
                    .join(line)
                    .map_err(|e| ManifestError::InvalidSegmentUri {
                        uri: line.to_owned(),
                        reason: e.to_string(),
                    })?;
                manifest.segments.push(Segment {
                    sequence,
                    uri,
                    duration,
                });
            }
            sequence = following;
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let seconds = value.split(',').next().unwrap_or_default().trim();
            duration = parse_seconds("EXTINF", seconds, line_no)?;
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            manifest.target_duration = parse_seconds("EXT-X-TARGETDURATION", value, line_no)?;
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            sequence = value
                .trim()
                .parse()
                .map_err(|_| invalid("EXT-X-MEDIA-SEQUENCE", value, line_no))?;
            manifest.media_sequence = Some(sequence);
        } else if let Some(value) = line.strip_prefix("#EXT-X-PLAYLIST-TYPE:") {
            manifest.playlist_type = Some(value.trim().to_ascii_uppercase());
        }
    }

    Ok(manifest)
}

fn parse_seconds(
    directive: &'static str,
    value: &str,
    line: usize,
) -> Result<Duration, ManifestError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .ok_or_else(|| invalid(directive, value, line))
}

fn invalid(directive: &'static str, value: &str, line: usize) -> ManifestError {
    ManifestError::InvalidDirective {
        directive,
        value: value.trim().to_owned(),
        line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::media_playlist;

    fn base() -> Url {
        Url::parse("https://edge.example/live/chan/index.m3u8").unwrap()
    }

    fn sequences(manifest: &MediaManifest) -> Vec<u64> {
        manifest.segments.iter().map(|s| s.sequence).collect()
    }

    #[test]
    fn vod_with_media_sequence() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:10\n\
                    #EXT-X-PLAYLIST-TYPE:VOD\n\
                    #EXTINF:6.0,\na.ts\n#EXTINF:6.0,\nb.ts\n#EXTINF:6.0,\nc.ts\n\
                    #EXTINF:6.0,\nd.ts\n#EXTINF:4.5,\ne.ts\n#EXT-X-ENDLIST\n";
        let manifest = parse_media_manifest(text, &base(), None).unwrap();

        assert_eq!(sequences(&manifest), vec![10, 11, 12, 13, 14]);
        assert!(!manifest.is_live());
        assert_eq!(manifest.media_sequence, Some(10));
        assert_eq!(manifest.target_duration, Duration::from_secs(6));
        assert_eq!(manifest.segments[4].duration, Duration::from_millis(4500));
        assert_eq!(
            manifest.segments[0].uri.as_str(),
            "https://edge.example/live/chan/a.ts"
        );
    }

    #[test]
    fn sequence_numbers_follow_content_lines_and_resets() {
        let text = "#EXTM3U\n#EXTINF:2.0,\na.ts\n#EXTINF:2.0,\nb.ts\n\
                    #EXT-X-DISCONTINUITY\n#EXT-X-MEDIA-SEQUENCE:100\n\
                    #EXTINF:2.0,\nc.ts\n#EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:00Z\nd.ts\n";
        let manifest = parse_media_manifest(text, &base(), None).unwrap();
        assert_eq!(sequences(&manifest), vec![0, 1, 100, 101]);
        assert_eq!(manifest.segments[3].duration, Duration::from_secs(2));
    }

    #[test]
    fn drops_segments_already_played() {
        let text = media_playlist(20, 6, 4, false);
        let manifest = parse_media_manifest(&text, &base(), Some(23)).unwrap();
        assert_eq!(sequences(&manifest), vec![23, 24, 25]);

        let manifest = parse_media_manifest(&text, &base(), None).unwrap();
        assert_eq!(sequences(&manifest), (20..26).collect::<Vec<_>>());
    }

    #[test]
    fn missing_playlist_type_is_live() {
        let manifest =
            parse_media_manifest(&media_playlist(0, 3, 2, false), &base(), None).unwrap();
        assert!(manifest.is_live());

        let event = "#EXTM3U\n#EXT-X-PLAYLIST-TYPE:EVENT\n#EXTINF:2.0,\na.ts\n";
        assert!(!parse_media_manifest(event, &base(), None).unwrap().is_live());
    }

    #[test]
    fn target_duration_defaults_to_one_second() {
        let manifest = parse_media_manifest("#EXTM3U\n#EXTINF:3,\na.ts\n", &base(), None).unwrap();
        assert_eq!(manifest.target_duration, Duration::from_secs(1));
        assert_eq!(manifest.segments[0].duration, Duration::from_secs(3));
    }

    #[test]
    fn rejects_non_playlists() {
        let err = parse_media_manifest("<html>oops</html>", &base(), None).unwrap_err();
        assert_eq!(err, ManifestError::MissingHeader);
        assert_eq!(
            parse_media_manifest("", &base(), None).unwrap_err(),
            ManifestError::MissingHeader
        );
    }

    #[test]
    fn rejects_unparseable_directive_values() {
        let text = "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:abc\n";
        assert!(matches!(
            parse_media_manifest(text, &base(), None),
            Err(ManifestError::InvalidDirective {
                directive: "EXT-X-MEDIA-SEQUENCE",
                line: 2,
                ..
            })
        ));
    }

    #[test]
    fn rejects_sequence_numbers_that_overflow() {
        let text = format!(
            "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:{}\n#EXTINF:2.0,\na.ts\n#EXTINF:2.0,\nb.ts\n",
            u64::MAX
        );
        assert_eq!(
            parse_media_manifest(&text, &base(), None).unwrap_err(),
            ManifestError::SequenceOverflow { last: u64::MAX }
        );

        let text = format!("#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:{}\n#EXTINF:2.0,\na.ts\n", u64::MAX - 1);
        let manifest = parse_media_manifest(&text, &base(), None).unwrap();
        assert_eq!(sequences(&manifest), vec![u64::MAX - 1]);
    }

    #[test]
    fn rejects_durations_too_large_to_represent() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:1e300\n#EXTINF:2.0,\na.ts\n";
        assert!(matches!(
            parse_media_manifest(text, &base(), None),
            Err(ManifestError::InvalidDirective {
                directive: "EXT-X-TARGETDURATION",
                ..
            })
        ));
    }

    #[test]
    fn resolves_absolute_and_rooted_uris() {
        let text = "#EXTM3U\n#EXTINF:2.0,\nhttps://cdn.example/x.ts\n#EXTINF:2.0,\n/abs/y.ts\n";
        let manifest = parse_media_manifest(text, &base(), None).unwrap();
        assert_eq!(manifest.segments[0].uri.as_str(), "https://cdn.example/x.ts");
        assert_eq!(manifest.segments[1].uri.as_str(), "https://edge.example/abs/y.ts");
    }
}
