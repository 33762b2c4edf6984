//! Listen enrichment
//!
//! Drives raw listens through the matcher and persists the outcome as
//! an explicit per-listen state. Raw listens themselves are immutable;
//! enrichment only ever writes the listen projection and its candidate
//! rows, so any listen can be re-enriched from scratch at any time.

use quaver_common::config::{EngineConfig, MatcherConfig};
use quaver_common::{Error, Result};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::matcher::{ListenInput, ListenMatcher, MatchReason, MatchResult};

/// Resolution state of a listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichStatus {
    /// Never been through the matcher.
    Unenriched,
    /// Accepted match at or above the accept threshold.
    Matched,
    /// Best candidate below the accept threshold but clearly ahead of
    /// the rest; linked tentatively.
    Provisional,
    /// Multiple candidates too close to call; linked to nothing.
    Ambiguous,
    /// No candidate worth recording.
    Unmatched,
}

impl EnrichStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichStatus::Unenriched => "unenriched",
            EnrichStatus::Matched => "matched",
            EnrichStatus::Provisional => "provisional",
            EnrichStatus::Ambiguous => "ambiguous",
            EnrichStatus::Unmatched => "unmatched",
        }
    }
}

impl std::str::FromStr for EnrichStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unenriched" => Ok(EnrichStatus::Unenriched),
            "matched" => Ok(EnrichStatus::Matched),
            "provisional" => Ok(EnrichStatus::Provisional),
            "ambiguous" => Ok(EnrichStatus::Ambiguous),
            "unmatched" => Ok(EnrichStatus::Unmatched),
            other => Err(Error::InvalidInput(format!(
                "unknown enrich status: {}",
                other
            ))),
        }
    }
}

/// Classify a match result into the listen state it should land in.
pub fn next_status(config: &MatcherConfig, result: &MatchResult) -> EnrichStatus {
    if result.track_id.is_some() && result.confidence >= config.accept_threshold {
        return EnrichStatus::Matched;
    }
    if result.candidates.is_empty() {
        return EnrichStatus::Unmatched;
    }
    if result.candidates.len() >= 2 {
        let best = result.candidates[0].confidence;
        let second = result.candidates[1].confidence;
        if best.saturating_sub(second) < config.ambiguity_band {
            return EnrichStatus::Ambiguous;
        }
    }
    EnrichStatus::Provisional
}

/// One listen as reported by a scrobble source.
#[derive(Debug, Clone, Default)]
pub struct RawListenInput {
    pub user: String,
    pub listened_at: i64,
    pub source: String,
    pub source_track_id: String,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    pub duration_secs: Option<i64>,
    pub mbid: Option<String>,
    pub isrc: Option<String>,
}

/// Persist a raw listen and its unenriched projection.
///
/// Idempotent on `(user, listened_at, source, source_track_id)`: a
/// replayed report returns the existing listen id untouched. Returns
/// the listen id and whether this call created it.
pub async fn record_listen(db: &SqlitePool, input: &RawListenInput) -> Result<(String, bool)> {
    if input.user.is_empty() || input.source.is_empty() {
        return Err(Error::InvalidInput(
            "listen requires a user and a source".to_string(),
        ));
    }

    let raw_id = Uuid::new_v4().to_string();
    let insert = sqlx::query(
        "INSERT INTO raw_listens \
         (id, user, listened_at, source, source_track_id, artist_raw, title_raw, album_raw, \
          duration_secs, mbid, isrc) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&raw_id)
    .bind(&input.user)
    .bind(input.listened_at)
    .bind(&input.source)
    .bind(&input.source_track_id)
    .bind(&input.artist)
    .bind(&input.title)
    .bind(&input.album)
    .bind(input.duration_secs)
    .bind(&input.mbid)
    .bind(&input.isrc)
    .execute(db)
    .await;

    let (raw_id, created) = match insert {
        Ok(_) => (raw_id, true),
        Err(e) if quaver_common::error::is_unique_violation(&e) => {
            let existing: String = sqlx::query_scalar(
                "SELECT id FROM raw_listens \
                 WHERE user = ? AND listened_at = ? AND source = ? AND source_track_id = ?",
            )
            .bind(&input.user)
            .bind(input.listened_at)
            .bind(&input.source)
            .bind(&input.source_track_id)
            .fetch_one(db)
            .await?;
            debug!(raw_listen_id = %existing, "Duplicate listen report ignored");
            (existing, false)
        }
        Err(e) => return Err(e.into()),
    };

    sqlx::query("INSERT OR IGNORE INTO listens (id, raw_listen_id) VALUES (?, ?)")
        .bind(Uuid::new_v4().to_string())
        .bind(&raw_id)
        .execute(db)
        .await?;

    let listen_id: String = sqlx::query_scalar("SELECT id FROM listens WHERE raw_listen_id = ?")
        .bind(&raw_id)
        .fetch_one(db)
        .await?;

    Ok((listen_id, created))
}

/// Progress snapshot handed to the caller after every listen.
#[derive(Debug, Clone, Default)]
pub struct EnrichProgress {
    pub processed: u64,
    pub matched: u64,
    pub current_listen: String,
}

/// Totals for one enrichment pass.
#[derive(Debug, Clone, Default)]
pub struct EnrichReport {
    pub processed: u64,
    pub matched: u64,
    pub provisional: u64,
    pub ambiguous: u64,
    pub unmatched: u64,
    pub cancelled: bool,
}

#[derive(sqlx::FromRow)]
struct PendingListenRow {
    id: String,
    artist_raw: Option<String>,
    title_raw: Option<String>,
    album_raw: Option<String>,
    duration_secs: Option<i64>,
    mbid: Option<String>,
    isrc: Option<String>,
}

/// Enrichment worker: matches pending listens and persists their
/// state transitions.
pub struct EnrichmentService {
    db: SqlitePool,
    matcher: ListenMatcher,
    config: MatcherConfig,
    normalizer: quaver_common::config::NormalizerConfig,
}

impl EnrichmentService {
    pub fn new(db: SqlitePool, config: &EngineConfig) -> Self {
        let matcher = ListenMatcher::new(
            db.clone(),
            config.normalizer.clone(),
            config.matcher.clone(),
        );
        Self {
            db,
            matcher,
            config: config.matcher.clone(),
            normalizer: config.normalizer.clone(),
        }
    }

    /// Enrich every unenriched listen, oldest first, up to `limit`.
    /// Cancellation is honored between listens.
    pub async fn enrich_pending(
        &self,
        limit: Option<u32>,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(&EnrichProgress),
    ) -> Result<EnrichReport> {
        let limit = limit.map(i64::from).unwrap_or(i64::MAX);
        let pending: Vec<PendingListenRow> = sqlx::query_as(
            "SELECT l.id, r.artist_raw, r.title_raw, r.album_raw, r.duration_secs, r.mbid, r.isrc \
             FROM listens l \
             JOIN raw_listens r ON r.id = l.raw_listen_id \
             WHERE l.enrich_status = 'unenriched' \
             ORDER BY r.listened_at, l.id \
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        info!(pending = pending.len(), "Starting enrichment pass");
        let mut report = EnrichReport::default();

        for row in pending {
            if cancel.is_cancelled() {
                info!("Enrichment cancelled");
                report.cancelled = true;
                break;
            }

            let status = self.enrich_one(&row).await?;
            report.processed += 1;
            match status {
                EnrichStatus::Matched => report.matched += 1,
                EnrichStatus::Provisional => report.provisional += 1,
                EnrichStatus::Ambiguous => report.ambiguous += 1,
                EnrichStatus::Unmatched => report.unmatched += 1,
                EnrichStatus::Unenriched => {}
            }

            progress(&EnrichProgress {
                processed: report.processed,
                matched: report.matched,
                current_listen: row.id.clone(),
            });
        }

        info!(
            processed = report.processed,
            matched = report.matched,
            provisional = report.provisional,
            ambiguous = report.ambiguous,
            unmatched = report.unmatched,
            cancelled = report.cancelled,
            "Enrichment pass finished"
        );
        Ok(report)
    }

    async fn enrich_one(&self, row: &PendingListenRow) -> Result<EnrichStatus> {
        let input = ListenInput {
            title: row.title_raw.clone(),
            artist: row.artist_raw.clone(),
            album: row.album_raw.clone(),
            duration_secs: row.duration_secs,
            mbid: row.mbid.clone(),
            isrc: row.isrc.clone(),
        };

        let result = self.matcher.match_listen(&input).await?;
        let status = next_status(&self.config, &result);
        self.apply_result(&row.id, &result, status).await?;
        Ok(status)
    }

    /// Persist one state transition. Matched listens carry no
    /// candidate rows; every other state replaces them wholesale.
    async fn apply_result(
        &self,
        listen_id: &str,
        result: &MatchResult,
        status: EnrichStatus,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;

        match status {
            EnrichStatus::Matched => {
                sqlx::query(
                    "UPDATE listens SET track_id = ?, enrich_status = ?, match_confidence = ?, \
                     match_reason = ?, last_enriched_at = CURRENT_TIMESTAMP WHERE id = ?",
                )
                .bind(&result.track_id)
                .bind(status.as_str())
                .bind(result.confidence as i64)
                .bind(result.reason.as_str())
                .bind(listen_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query("DELETE FROM listen_match_candidates WHERE listen_id = ?")
                    .bind(listen_id)
                    .execute(&mut *tx)
                    .await?;
            }
            _ => {
                // A provisional listen is tentatively linked to its
                // best candidate; ambiguous and unmatched link nothing
                let (track_id, confidence, reason) = match status {
                    EnrichStatus::Provisional => {
                        let best = &result.candidates[0];
                        (
                            Some(best.track_id.clone()),
                            Some(best.confidence as i64),
                            Some(best.reason.as_str()),
                        )
                    }
                    _ => (None, None, Some(MatchReason::Unmatched.as_str())),
                };

                sqlx::query(
                    "UPDATE listens SET track_id = ?, enrich_status = ?, match_confidence = ?, \
                     match_reason = ?, last_enriched_at = CURRENT_TIMESTAMP WHERE id = ?",
                )
                .bind(&track_id)
                .bind(status.as_str())
                .bind(confidence)
                .bind(reason)
                .bind(listen_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query("DELETE FROM listen_match_candidates WHERE listen_id = ?")
                    .bind(listen_id)
                    .execute(&mut *tx)
                    .await?;

                for (rank, candidate) in result.candidates.iter().enumerate() {
                    let features = serde_json::to_string(&candidate.features)
                        .map_err(|e| Error::Internal(format!("Failed to encode features: {}", e)))?;
                    sqlx::query(
                        "INSERT INTO listen_match_candidates \
                         (listen_id, track_id, confidence, features, rank) \
                         VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(listen_id)
                    .bind(&candidate.track_id)
                    .bind(candidate.confidence as i64)
                    .bind(&features)
                    .bind(rank as i64)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Manually pin a listen to a track. Optionally learns the raw
    /// artist string as an alias of the track's primary artist so the
    /// same spelling matches automatically next time.
    pub async fn confirm_match(
        &self,
        listen_id: &str,
        track_id: &str,
        learn_alias: bool,
    ) -> Result<()> {
        let track: Option<(String,)> =
            sqlx::query_as("SELECT primary_artist_id FROM tracks WHERE id = ?")
                .bind(track_id)
                .fetch_optional(&self.db)
                .await?;
        let Some((primary_artist_id,)) = track else {
            return Err(Error::NotFound(format!("track not found: {}", track_id)));
        };

        let updated = sqlx::query(
            "UPDATE listens SET track_id = ?, enrich_status = 'matched', match_confidence = 100, \
             match_reason = ?, last_enriched_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(track_id)
        .bind(MatchReason::Manual.as_str())
        .bind(listen_id)
        .execute(&self.db)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::NotFound(format!("listen not found: {}", listen_id)));
        }

        sqlx::query("DELETE FROM listen_match_candidates WHERE listen_id = ?")
            .bind(listen_id)
            .execute(&self.db)
            .await?;

        if learn_alias {
            let artist_raw: Option<String> = sqlx::query_scalar(
                "SELECT r.artist_raw FROM raw_listens r \
                 JOIN listens l ON l.raw_listen_id = r.id WHERE l.id = ?",
            )
            .bind(listen_id)
            .fetch_one(&self.db)
            .await?;
            if let Some(artist_raw) = artist_raw {
                let resolver = crate::resolver::CatalogResolver::new(
                    self.db.clone(),
                    self.normalizer.clone(),
                );
                if let Err(e) = resolver.add_artist_alias(&primary_artist_id, &artist_raw).await {
                    warn!(error = %e, "Failed to learn artist alias from confirmation");
                }
            }
        }

        info!(listen_id = %listen_id, track_id = %track_id, "Listen match confirmed manually");
        Ok(())
    }

    /// Send listens back to the unenriched state so the next pass
    /// re-matches them, e.g. after the catalog grew. `None` resets
    /// every non-matched listen; a specific status resets only that
    /// state. Returns how many listens were reset.
    pub async fn reset_listens(&self, status: Option<EnrichStatus>) -> Result<u64> {
        let result = match status {
            Some(status) => {
                sqlx::query(
                    "UPDATE listens SET enrich_status = 'unenriched', track_id = NULL, \
                     match_confidence = NULL, match_reason = NULL WHERE enrich_status = ?",
                )
                .bind(status.as_str())
                .execute(&self.db)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE listens SET enrich_status = 'unenriched', track_id = NULL, \
                     match_confidence = NULL, match_reason = NULL \
                     WHERE enrich_status NOT IN ('matched', 'unenriched')",
                )
                .execute(&self.db)
                .await?
            }
        };

        sqlx::query(
            "DELETE FROM listen_match_candidates WHERE listen_id IN \
             (SELECT id FROM listens WHERE enrich_status = 'unenriched')",
        )
        .execute(&self.db)
        .await?;

        info!(reset = result.rows_affected(), "Reset listens for re-enrichment");
        Ok(result.rows_affected())
    }
}
