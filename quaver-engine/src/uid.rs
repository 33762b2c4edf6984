//! Deterministic track fingerprints
//!
//! The track uid is the dedup key for tracks that carry no external
//! identifier: a hash over the normalized primary artist, the
//! normalized title and the duration bucket. Exactly one canonical
//! track exists per distinct uid.

use quaver_common::config::NormalizerConfig;
use sha2::{Digest, Sha256};

use crate::normalize::{duration_bucket, normalize_text, normalize_title};

/// Compute the stable fingerprint for a track identity.
pub fn track_uid(
    config: &NormalizerConfig,
    artist: Option<&str>,
    title: Option<&str>,
    duration_secs: Option<i64>,
) -> String {
    let artist_norm = artist
        .map(|a| normalize_text(config, a))
        .unwrap_or_default();
    let title_norm = title
        .map(|t| normalize_title(config, t).title)
        .unwrap_or_default();

    let key = format!(
        "{}|{}|{}",
        artist_norm,
        title_norm,
        duration_bucket(config, duration_secs)
    );

    format!("{:x}", Sha256::digest(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NormalizerConfig {
        NormalizerConfig::default()
    }

    #[test]
    fn uid_is_deterministic() {
        let cfg = config();
        let a = track_uid(&cfg, Some("Massive Attack"), Some("Teardrop"), Some(329));
        let b = track_uid(&cfg, Some("Massive Attack"), Some("Teardrop"), Some(329));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn uid_ignores_casing_and_punctuation() {
        let cfg = config();
        let a = track_uid(&cfg, Some("MASSIVE ATTACK"), Some("Teardrop!"), Some(329));
        let b = track_uid(&cfg, Some("massive attack"), Some("teardrop"), Some(329));
        assert_eq!(a, b);
    }

    #[test]
    fn uid_ignores_featuring_credits_in_title() {
        let cfg = config();
        let a = track_uid(&cfg, Some("Artist"), Some("Song (feat. Guest)"), Some(200));
        let b = track_uid(&cfg, Some("Artist"), Some("Song"), Some(200));
        assert_eq!(a, b);
    }

    #[test]
    fn uid_distinguishes_artists_and_durations() {
        let cfg = config();
        let base = track_uid(&cfg, Some("Artist"), Some("Song"), Some(200));
        assert_ne!(base, track_uid(&cfg, Some("Other"), Some("Song"), Some(200)));
        assert_ne!(base, track_uid(&cfg, Some("Artist"), Some("Song"), Some(240)));
        assert_ne!(base, track_uid(&cfg, Some("Artist"), Some("Song"), None));
    }

    #[test]
    fn nearby_durations_share_a_bucket() {
        let cfg = config();
        let a = track_uid(&cfg, Some("Artist"), Some("Song"), Some(200));
        let b = track_uid(&cfg, Some("Artist"), Some("Song"), Some(199));
        assert_eq!(a, b);
    }
}
