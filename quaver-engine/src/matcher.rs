//! Listen matching
//!
//! Resolves a reported listen to a canonical track through tiered
//! evidence: external ids first, then the deterministic track uid,
//! then fuzzy metadata scoring. Matching is read-only against the
//! catalog and fully deterministic for a given catalog state.

use quaver_common::config::{MatcherConfig, NormalizerConfig};
use quaver_common::db::models::TrackRow;
use quaver_common::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use crate::normalize::{normalize_text, normalize_title};
use crate::uid::track_uid;

/// Jaro-Winkler floor for treating two names as the same entity.
const APPROX_NAME_SIMILARITY: f64 = 0.9;

/// Metadata reported by the listen source.
#[derive(Debug, Clone, Default)]
pub struct ListenInput {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_secs: Option<i64>,
    pub mbid: Option<String>,
    pub isrc: Option<String>,
}

/// Which evidence tier produced the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    ExternalId,
    Fingerprint,
    Fuzzy,
    Manual,
    Unmatched,
}

impl MatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchReason::ExternalId => "external-id",
            MatchReason::Fingerprint => "fingerprint",
            MatchReason::Fuzzy => "fuzzy",
            MatchReason::Manual => "manual",
            MatchReason::Unmatched => "unmatched",
        }
    }
}

impl std::str::FromStr for MatchReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "external-id" => Ok(MatchReason::ExternalId),
            "fingerprint" => Ok(MatchReason::Fingerprint),
            "fuzzy" => Ok(MatchReason::Fuzzy),
            "manual" => Ok(MatchReason::Manual),
            "unmatched" => Ok(MatchReason::Unmatched),
            other => Err(Error::InvalidInput(format!(
                "unknown match reason: {}",
                other
            ))),
        }
    }
}

/// Per-candidate evidence breakdown, persisted as JSON for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateFeatures {
    pub title_exact: bool,
    pub artist_exact: bool,
    pub artist_similarity: f64,
    pub album_exact: bool,
    pub duration_delta: Option<i64>,
}

/// One scored track candidate for a listen.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub track_id: String,
    pub confidence: u8,
    /// Evidence tier that produced this candidate.
    pub reason: MatchReason,
    pub features: CandidateFeatures,
}

/// Outcome of matching one listen against the catalog.
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// Accepted track, present only at or above the accept threshold.
    pub track_id: Option<String>,
    pub confidence: u8,
    pub reason: MatchReason,
    /// Ranked candidates at or above the include threshold, best
    /// first, capped at the configured maximum.
    pub candidates: Vec<Candidate>,
}

impl MatchResult {
    fn unmatched(candidates: Vec<Candidate>) -> Self {
        Self {
            track_id: None,
            confidence: 0,
            reason: MatchReason::Unmatched,
            candidates,
        }
    }

    fn accepted(track_id: String, confidence: u8, reason: MatchReason) -> Self {
        Self {
            track_id: Some(track_id),
            confidence,
            reason,
            candidates: Vec::new(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct FuzzyCandidateRow {
    id: String,
    primary_artist_id: String,
    duration_secs: Option<i64>,
    artist_normalized: String,
    album_normalized: Option<String>,
    listen_count: i64,
}

/// Read-only matcher over the catalog.
pub struct ListenMatcher {
    db: SqlitePool,
    normalizer: NormalizerConfig,
    config: MatcherConfig,
}

impl ListenMatcher {
    pub fn new(db: SqlitePool, normalizer: NormalizerConfig, config: MatcherConfig) -> Self {
        Self {
            db,
            normalizer,
            config,
        }
    }

    /// Match one listen. Tier order: external id (100), track uid
    /// (90), fuzzy scoring (60-85). Anything below the accept
    /// threshold comes back unmatched with its candidate list.
    pub async fn match_listen(&self, input: &ListenInput) -> Result<MatchResult> {
        if let Some(mbid) = &input.mbid {
            if let Some(track) = self.track_by_mbid(mbid).await? {
                debug!(track_id = %track.id, "Matched listen by recording mbid");
                return Ok(self.tier_result(track, 100, MatchReason::ExternalId, input));
            }
        }
        if let Some(isrc) = &input.isrc {
            if let Some(track) = self.track_by_isrc(isrc).await? {
                debug!(track_id = %track.id, "Matched listen by isrc");
                return Ok(self.tier_result(track, 100, MatchReason::ExternalId, input));
            }
        }

        if input.artist.is_some() && input.title.is_some() {
            let uid = track_uid(
                &self.normalizer,
                input.artist.as_deref(),
                input.title.as_deref(),
                input.duration_secs,
            );
            if let Some(track) = self.track_by_uid(&uid).await? {
                debug!(track_id = %track.id, "Matched listen by track uid");
                return Ok(self.tier_result(track, 90, MatchReason::Fingerprint, input));
            }
        }

        let Some(title) = &input.title else {
            return Ok(MatchResult::unmatched(Vec::new()));
        };

        let candidates = self.fuzzy_candidates(title, input).await?;
        match candidates.first() {
            Some(best) if best.confidence >= self.config.accept_threshold => {
                Ok(MatchResult {
                    track_id: Some(best.track_id.clone()),
                    confidence: best.confidence,
                    reason: MatchReason::Fuzzy,
                    candidates,
                })
            }
            _ => Ok(MatchResult::unmatched(candidates)),
        }
    }

    /// Wrap a tier hit against the configured thresholds. At or above
    /// the accept threshold the track is the accepted match. Below it,
    /// which only happens when the threshold is raised past the tier's
    /// fixed confidence, the track survives as the sole ranked
    /// candidate so the enrichment layer can still hold it tentatively.
    fn tier_result(
        &self,
        track: TrackRow,
        confidence: u8,
        reason: MatchReason,
        input: &ListenInput,
    ) -> MatchResult {
        if confidence >= self.config.accept_threshold {
            return MatchResult::accepted(track.id, confidence, reason);
        }
        if confidence < self.config.include_threshold {
            return MatchResult::unmatched(Vec::new());
        }
        let title_exact = input
            .title
            .as_deref()
            .map(|t| normalize_title(&self.normalizer, t).title == track.title_normalized)
            .unwrap_or(false);
        let duration_delta = match (input.duration_secs, track.duration_secs) {
            (Some(listen), Some(known)) => Some((listen - known).abs()),
            _ => None,
        };
        MatchResult::unmatched(vec![Candidate {
            track_id: track.id,
            confidence,
            reason,
            features: CandidateFeatures {
                title_exact,
                artist_exact: false,
                artist_similarity: 0.0,
                album_exact: false,
                duration_delta,
            },
        }])
    }

    /// Score every track whose normalized title equals the listen's.
    /// Returned best-first with deterministic tie-breaks: confidence,
    /// then prior listen count, then track id.
    async fn fuzzy_candidates(
        &self,
        title: &str,
        input: &ListenInput,
    ) -> Result<Vec<Candidate>> {
        let title_normalized = normalize_title(&self.normalizer, title).title;
        if title_normalized.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<FuzzyCandidateRow> = sqlx::query_as(
            "SELECT t.id, t.primary_artist_id, t.duration_secs, \
                    a.name_normalized AS artist_normalized, \
                    r.title_normalized AS album_normalized, \
                    (SELECT COUNT(*) FROM listens l WHERE l.track_id = t.id) AS listen_count \
             FROM tracks t \
             JOIN artists a ON a.id = t.primary_artist_id \
             LEFT JOIN releases r ON r.id = t.release_id \
             WHERE t.title_normalized = ?",
        )
        .bind(&title_normalized)
        .fetch_all(&self.db)
        .await?;

        let listen_artist = input
            .artist
            .as_deref()
            .map(|a| normalize_text(&self.normalizer, a))
            .filter(|a| !a.is_empty());
        let listen_album = input
            .album
            .as_deref()
            .map(|a| normalize_text(&self.normalizer, a))
            .filter(|a| !a.is_empty());

        let mut scored: Vec<(Candidate, i64)> = Vec::new();
        for row in rows {
            let duration_delta = match (input.duration_secs, row.duration_secs) {
                (Some(listen), Some(track)) => Some((listen - track).abs()),
                _ => None,
            };
            // Both durations known but far apart: this is a different
            // recording, not a weak match
            if let Some(delta) = duration_delta {
                if delta > self.config.duration_tolerance_secs {
                    continue;
                }
            }

            let mut names = self.artist_name_pool(&row).await?;
            names.sort();
            names.dedup();

            // Title equality is the entry ticket (40), artist overlap
            // lifts a candidate into the acceptable band, duration and
            // album agreement round it out. Top of the scale is 85 so
            // fuzzy evidence never outranks the fingerprint tier.
            let mut confidence: u8 = 40;
            let mut features = CandidateFeatures {
                title_exact: true,
                artist_exact: false,
                artist_similarity: 0.0,
                album_exact: false,
                duration_delta,
            };

            if let Some(artist) = &listen_artist {
                if names.iter().any(|n| n == artist) {
                    confidence += 25;
                    features.artist_exact = true;
                    features.artist_similarity = 1.0;
                } else {
                    let best = names
                        .iter()
                        .map(|n| strsim::jaro_winkler(artist, n))
                        .fold(0.0_f64, f64::max);
                    features.artist_similarity = best;
                    if best >= APPROX_NAME_SIMILARITY {
                        confidence += 15;
                    }
                }
            }

            if let Some(album) = &listen_album {
                match &row.album_normalized {
                    Some(track_album) if track_album == album => {
                        confidence += 8;
                        features.album_exact = true;
                    }
                    Some(track_album)
                        if strsim::jaro_winkler(album, track_album)
                            >= APPROX_NAME_SIMILARITY =>
                    {
                        confidence += 4;
                    }
                    _ => {}
                }
            }

            match duration_delta {
                Some(delta) if delta <= 1 => confidence += 12,
                Some(_) => confidence += 8,
                None => {}
            }

            // Without any artist-name overlap a candidate stays below
            // the accept threshold no matter how the rest agrees
            if features.artist_similarity < APPROX_NAME_SIMILARITY {
                confidence = confidence.min(55);
            }
            confidence = confidence.min(85);
            if confidence < self.config.include_threshold {
                continue;
            }

            scored.push((
                Candidate {
                    track_id: row.id,
                    confidence,
                    reason: MatchReason::Fuzzy,
                    features,
                },
                row.listen_count,
            ));
        }

        scored.sort_by(|(a, a_listens), (b, b_listens)| {
            b.confidence
                .cmp(&a.confidence)
                .then_with(|| b_listens.cmp(a_listens))
                .then_with(|| a.track_id.cmp(&b.track_id))
        });
        scored.truncate(self.config.max_candidates);

        Ok(scored.into_iter().map(|(c, _)| c).collect())
    }

    /// All normalized names that may refer to a candidate's artists:
    /// the primary name, every credited artist's name, and all their
    /// aliases.
    async fn artist_name_pool(&self, row: &FuzzyCandidateRow) -> Result<Vec<String>> {
        let mut names = vec![row.artist_normalized.clone()];

        let credited: Vec<String> = sqlx::query_scalar(
            "SELECT a.name_normalized FROM artists a \
             JOIN track_artists ta ON ta.artist_id = a.id \
             WHERE ta.track_id = ?",
        )
        .bind(&row.id)
        .fetch_all(&self.db)
        .await?;
        names.extend(credited);

        let aliases: Vec<String> = sqlx::query_scalar(
            "SELECT alias_normalized FROM artist_aliases \
             WHERE artist_id = ? \
                OR artist_id IN (SELECT artist_id FROM track_artists WHERE track_id = ?)",
        )
        .bind(&row.primary_artist_id)
        .bind(&row.id)
        .fetch_all(&self.db)
        .await?;
        names.extend(aliases);

        Ok(names)
    }

    async fn track_by_mbid(&self, mbid: &str) -> Result<Option<TrackRow>> {
        let row = sqlx::query_as::<_, TrackRow>(
            "SELECT id, title, title_normalized, primary_artist_id, release_id, duration_secs, \
                    track_uid, mbid, isrc \
             FROM tracks WHERE mbid = ?",
        )
        .bind(mbid)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn track_by_isrc(&self, isrc: &str) -> Result<Option<TrackRow>> {
        let row = sqlx::query_as::<_, TrackRow>(
            "SELECT id, title, title_normalized, primary_artist_id, release_id, duration_secs, \
                    track_uid, mbid, isrc \
             FROM tracks WHERE isrc = ? ORDER BY id LIMIT 1",
        )
        .bind(isrc)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn track_by_uid(&self, uid: &str) -> Result<Option<TrackRow>> {
        let row = sqlx::query_as::<_, TrackRow>(
            "SELECT id, title, title_normalized, primary_artist_id, release_id, duration_secs, \
                    track_uid, mbid, isrc \
             FROM tracks WHERE track_uid = ?",
        )
        .bind(uid)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{ArtistInput, CatalogResolver, ReleaseInput, TrackInput};
    use quaver_common::db::init_schema;

    struct Fixture {
        matcher: ListenMatcher,
        resolver: CatalogResolver,
    }

    async fn setup() -> Fixture {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        init_schema(&pool).await.unwrap();
        let normalizer = NormalizerConfig::default();
        Fixture {
            matcher: ListenMatcher::new(
                pool.clone(),
                normalizer.clone(),
                MatcherConfig::default(),
            ),
            resolver: CatalogResolver::new(pool, normalizer),
        }
    }

    async fn seed_track(
        fx: &Fixture,
        artist: &str,
        title: &str,
        album: Option<&str>,
        duration: Option<i64>,
        mbid: Option<&str>,
    ) -> String {
        let artist_row = fx
            .resolver
            .resolve_artist(&ArtistInput {
                name: artist.to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner();
        let release_id = match album {
            Some(album) => Some(
                fx.resolver
                    .resolve_release(&ReleaseInput {
                        title: album.to_string(),
                        primary_artist_id: artist_row.id.clone(),
                        ..Default::default()
                    })
                    .await
                    .unwrap()
                    .id
                    .clone(),
            ),
            None => None,
        };
        fx.resolver
            .resolve_track(&TrackInput {
                title: title.to_string(),
                artist_name: artist.to_string(),
                primary_artist_id: artist_row.id.clone(),
                release_id,
                duration_secs: duration,
                mbid: mbid.map(|s| s.to_string()),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner()
            .id
    }

    #[tokio::test]
    async fn external_id_match_wins_at_full_confidence() {
        let fx = setup().await;
        let track_id = seed_track(
            &fx,
            "Massive Attack",
            "Teardrop",
            Some("Mezzanine"),
            Some(329),
            Some("mbid-teardrop"),
        )
        .await;

        // Garbage metadata; only the mbid agrees
        let result = fx
            .matcher
            .match_listen(&ListenInput {
                title: Some("trackname???".to_string()),
                artist: Some("someone".to_string()),
                mbid: Some("mbid-teardrop".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.track_id.as_deref(), Some(track_id.as_str()));
        assert_eq!(result.confidence, 100);
        assert_eq!(result.reason, MatchReason::ExternalId);
    }

    #[tokio::test]
    async fn uid_match_scores_ninety() {
        let fx = setup().await;
        let track_id = seed_track(&fx, "Portishead", "Glory Box", None, Some(305), None).await;

        let result = fx
            .matcher
            .match_listen(&ListenInput {
                title: Some("glory box".to_string()),
                artist: Some("PORTISHEAD".to_string()),
                duration_secs: Some(305),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.track_id.as_deref(), Some(track_id.as_str()));
        assert_eq!(result.confidence, 90);
        assert_eq!(result.reason, MatchReason::Fingerprint);
    }

    #[tokio::test]
    async fn raised_accept_threshold_demotes_uid_hit_to_candidate() {
        let fx = setup().await;
        let track_id = seed_track(&fx, "Portishead", "Glory Box", None, Some(305), None).await;

        // Accept threshold raised above the fingerprint tier's fixed
        // confidence: the hit must survive as a ranked candidate
        // instead of vanishing
        let strict = ListenMatcher::new(
            fx.matcher.db.clone(),
            NormalizerConfig::default(),
            MatcherConfig {
                accept_threshold: 95,
                ..MatcherConfig::default()
            },
        );
        let result = strict
            .match_listen(&ListenInput {
                title: Some("Glory Box".to_string()),
                artist: Some("Portishead".to_string()),
                duration_secs: Some(305),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.track_id.is_none());
        assert_eq!(result.reason, MatchReason::Unmatched);
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].track_id, track_id);
        assert_eq!(result.candidates[0].confidence, 90);
        assert_eq!(result.candidates[0].reason, MatchReason::Fingerprint);
        assert!(result.candidates[0].features.title_exact);
    }

    #[tokio::test]
    async fn fuzzy_match_accumulates_evidence() {
        let fx = setup().await;
        // Duration differs enough to miss the uid bucket but stays
        // inside the matcher tolerance
        let track_id = seed_track(
            &fx,
            "Radiohead",
            "Airbag",
            Some("OK Computer"),
            Some(284),
            None,
        )
        .await;

        let result = fx
            .matcher
            .match_listen(&ListenInput {
                title: Some("Airbag".to_string()),
                artist: Some("Radiohead".to_string()),
                album: Some("OK Computer".to_string()),
                duration_secs: Some(288),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.track_id.as_deref(), Some(track_id.as_str()));
        assert_eq!(result.reason, MatchReason::Fuzzy);
        // 40 title + 25 artist + 8 album + 8 duration
        assert_eq!(result.confidence, 81);
    }

    #[tokio::test]
    async fn missing_listen_duration_still_matches_fuzzily() {
        let fx = setup().await;
        let track_id = seed_track(
            &fx,
            "Massive Attack",
            "Teardrop",
            None,
            Some(329),
            None,
        )
        .await;

        // The uid tier cannot fire without a duration, but title and
        // artist agreement carry the listen over the accept threshold
        let result = fx
            .matcher
            .match_listen(&ListenInput {
                title: Some("Teardrop".to_string()),
                artist: Some("Massive Attack".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.track_id.as_deref(), Some(track_id.as_str()));
        assert_eq!(result.reason, MatchReason::Fuzzy);
        assert!(result.confidence >= 60 && result.confidence < 85);
    }

    #[tokio::test]
    async fn approximate_artist_lands_below_the_accept_band() {
        let fx = setup().await;
        let track_id = seed_track(&fx, "Artist", "Some Song", None, None, None).await;

        // One typo in the artist name: similar but not exact
        let result = fx
            .matcher
            .match_listen(&ListenInput {
                title: Some("Some Song".to_string()),
                artist: Some("Artst".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.track_id.is_none());
        assert_eq!(result.reason, MatchReason::Unmatched);
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].track_id, track_id);
        // 40 title + 15 approximate artist
        assert_eq!(result.candidates[0].confidence, 55);
    }

    #[tokio::test]
    async fn fuzzy_confidence_is_capped_below_fingerprint_tier() {
        let fx = setup().await;
        seed_track(&fx, "Artist", "Song", Some("Album"), Some(200), None).await;

        let result = fx
            .matcher
            .match_listen(&ListenInput {
                title: Some("Song".to_string()),
                artist: Some("Artist".to_string()),
                album: Some("Album".to_string()),
                // Misses the uid bucket by rounding but exact enough
                // for the full duration bonus
                duration_secs: Some(201),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.reason, MatchReason::Fuzzy);
        // 40 + 25 + 8 + 12 caps at the top of the fuzzy band
        assert_eq!(result.confidence, 85);
    }

    #[tokio::test]
    async fn incompatible_duration_rejects_candidate() {
        let fx = setup().await;
        seed_track(&fx, "Artist", "Song", None, Some(200), None).await;

        let result = fx
            .matcher
            .match_listen(&ListenInput {
                title: Some("Song".to_string()),
                artist: Some("Artist".to_string()),
                duration_secs: Some(300),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.track_id.is_none());
        assert_eq!(result.reason, MatchReason::Unmatched);
        assert!(result.candidates.is_empty());
    }

    #[tokio::test]
    async fn alias_counts_as_exact_artist_evidence() {
        let fx = setup().await;
        let track_id = seed_track(&fx, "The Chemical Brothers", "Block Rockin Beats", None, None, None).await;
        let artist_id: String =
            sqlx::query_scalar("SELECT primary_artist_id FROM tracks WHERE id = ?")
                .bind(&track_id)
                .fetch_one(&fx.matcher.db)
                .await
                .unwrap();
        fx.resolver
            .add_artist_alias(&artist_id, "Chemical Brothers")
            .await
            .unwrap();

        let result = fx
            .matcher
            .match_listen(&ListenInput {
                title: Some("Block Rockin Beats".to_string()),
                artist: Some("Chemical Brothers".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.track_id.as_deref(), Some(track_id.as_str()));
        assert_eq!(result.reason, MatchReason::Fuzzy);
        // 40 title + 25 exact-by-alias
        assert_eq!(result.confidence, 65);
    }

    #[tokio::test]
    async fn ordering_is_deterministic_under_ties() {
        let fx = setup().await;
        // Two distinct tracks with the same title, neither better than
        // the other on evidence
        let a = seed_track(&fx, "Artist One", "Common Title", None, None, None).await;
        let b = seed_track(&fx, "Artist Two", "Common Title", None, None, None).await;

        let result = fx
            .matcher
            .match_listen(&ListenInput {
                title: Some("Common Title".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        // Title alone is not enough to accept, but both rivals are
        // recorded in a stable order
        assert!(result.track_id.is_none());
        assert_eq!(result.candidates.len(), 2);
        let expected_first = std::cmp::min(a.clone(), b.clone());
        assert_eq!(result.candidates[0].track_id, expected_first);

        let again = fx
            .matcher
            .match_listen(&ListenInput {
                title: Some("Common Title".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = result.candidates.iter().map(|c| &c.track_id).collect();
        let ids_again: Vec<_> = again.candidates.iter().map(|c| &c.track_id).collect();
        assert_eq!(ids, ids_again);
    }

    #[tokio::test]
    async fn unknown_listen_has_no_candidates() {
        let fx = setup().await;
        seed_track(&fx, "Artist", "Song", None, None, None).await;

        let result = fx
            .matcher
            .match_listen(&ListenInput {
                title: Some("Completely Different".to_string()),
                artist: Some("Nobody".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.track_id.is_none());
        assert!(result.candidates.is_empty());
        assert_eq!(result.reason, MatchReason::Unmatched);
    }
}
