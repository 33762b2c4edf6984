//! Job entrypoints
//!
//! The engine never owns scheduling: an external runner calls these
//! with a cancellation token and a progress callback and decides when
//! and how often they run. Each entrypoint is safe to re-run.

use std::path::PathBuf;

use quaver_common::config::EngineConfig;
use quaver_common::{Error, Result};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::enrich::{EnrichProgress, EnrichReport, EnrichmentService, RawListenInput};
use crate::pipeline::{IngestPipeline, ScanProgress, ScanSummary};
use crate::resolver::CatalogResolver;
use crate::uid::track_uid;

/// Scan the configured library roots (or an explicit override) and
/// fold the per-root summaries into one.
pub async fn scan_library(
    db: &SqlitePool,
    config: &EngineConfig,
    roots: Option<Vec<PathBuf>>,
    cancel: &CancellationToken,
    progress: &mut dyn FnMut(&ScanProgress),
) -> Result<ScanSummary> {
    let roots = roots.unwrap_or_else(|| config.scan.roots.clone());
    if roots.is_empty() {
        return Err(Error::Config("no library roots configured".to_string()));
    }

    let pipeline = IngestPipeline::new(db.clone(), config);
    let mut total = ScanSummary::default();
    for root in &roots {
        if cancel.is_cancelled() {
            total.cancelled = true;
            break;
        }
        let summary = pipeline.scan_root(root, cancel, progress).await?;
        total.processed += summary.processed;
        total.created += summary.created;
        total.updated += summary.updated;
        total.skipped += summary.skipped;
        total.errors += summary.errors;
        total.pruned += summary.pruned;
        total.cancelled |= summary.cancelled;
    }
    Ok(total)
}

/// Run one enrichment pass over pending listens.
pub async fn enrich_listens(
    db: &SqlitePool,
    config: &EngineConfig,
    limit: Option<u32>,
    cancel: &CancellationToken,
    progress: &mut dyn FnMut(&EnrichProgress),
) -> Result<EnrichReport> {
    EnrichmentService::new(db.clone(), config)
        .enrich_pending(limit, cancel, progress)
        .await
}

/// Record one reported listen. Idempotent; returns the listen id and
/// whether this call created it.
pub async fn record_listen(db: &SqlitePool, input: &RawListenInput) -> Result<(String, bool)> {
    crate::enrich::record_listen(db, input).await
}

/// Manually resolve a listen to a track.
pub async fn confirm_listen_match(
    db: &SqlitePool,
    config: &EngineConfig,
    listen_id: &str,
    track_id: &str,
    learn_alias: bool,
) -> Result<()> {
    EnrichmentService::new(db.clone(), config)
        .confirm_match(listen_id, track_id, learn_alias)
        .await
}

/// Totals for one uid reindex run.
#[derive(Debug, Clone, Default)]
pub struct ReindexReport {
    pub processed: u64,
    pub updated: u64,
    pub merged: u64,
    pub conflicts: u64,
}

#[derive(sqlx::FromRow)]
struct ReindexTrackRow {
    id: String,
    title: String,
    duration_secs: Option<i64>,
    track_uid: String,
    mbid: Option<String>,
    artist_name: String,
}

/// Recompute every track uid under the current normalization rules.
///
/// Run after a rule change; uids are otherwise never mutated in
/// place. When two tracks collapse onto the same uid they are merged,
/// with the external-id carrier surviving. Two distinct external ids
/// on the same uid are left alone and reported as conflicts.
pub async fn reindex_track_uids(db: &SqlitePool, config: &EngineConfig) -> Result<ReindexReport> {
    let resolver = CatalogResolver::new(db.clone(), config.normalizer.clone());
    let tracks: Vec<ReindexTrackRow> = sqlx::query_as(
        "SELECT t.id, t.title, t.duration_secs, t.track_uid, t.mbid, a.name AS artist_name \
         FROM tracks t JOIN artists a ON a.id = t.primary_artist_id \
         ORDER BY t.created_at, t.id",
    )
    .fetch_all(db)
    .await?;

    let mut report = ReindexReport::default();
    for track in tracks {
        report.processed += 1;

        // The row may have been merged away earlier in this run
        let still_exists: Option<String> =
            sqlx::query_scalar("SELECT id FROM tracks WHERE id = ?")
                .bind(&track.id)
                .fetch_optional(db)
                .await?;
        if still_exists.is_none() {
            continue;
        }

        let new_uid = track_uid(
            &config.normalizer,
            Some(&track.artist_name),
            Some(&track.title),
            track.duration_secs,
        );
        if new_uid == track.track_uid {
            continue;
        }

        match resolver.find_track_by_uid(&new_uid).await? {
            Some(holder) => {
                let (survivor, duplicate) = match (&track.mbid, &holder.mbid) {
                    (Some(_), Some(_)) => {
                        warn!(
                            a = %track.id,
                            b = %holder.id,
                            "Reindexed uid collides across two external ids; not merging"
                        );
                        report.conflicts += 1;
                        continue;
                    }
                    (Some(_), None) => (track.id.clone(), holder.id.clone()),
                    _ => (holder.id.clone(), track.id.clone()),
                };
                resolver.merge_tracks(&survivor, &duplicate).await?;
                if survivor == track.id {
                    sqlx::query("UPDATE tracks SET track_uid = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
                        .bind(&new_uid)
                        .bind(&track.id)
                        .execute(db)
                        .await?;
                }
                report.merged += 1;
            }
            None => {
                sqlx::query(
                    "UPDATE tracks SET track_uid = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
                )
                .bind(&new_uid)
                .bind(&track.id)
                .execute(db)
                .await?;
                report.updated += 1;
            }
        }
    }

    info!(
        processed = report.processed,
        updated = report.updated,
        merged = report.merged,
        conflicts = report.conflicts,
        "Track uid reindex finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{ArtistInput, TrackInput};
    use quaver_common::config::NormalizerConfig;
    use quaver_common::db::init_schema;
    use std::fs;
    use std::path::Path;

    async fn setup() -> SqlitePool {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        init_schema(&pool).await.unwrap();
        pool
    }

    fn touch(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
    }

    #[tokio::test]
    async fn scan_library_covers_all_roots() {
        let pool = setup().await;
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        touch(&dir_a.path().join("One.mp3"), b"1");
        touch(&dir_b.path().join("Two.mp3"), b"2");

        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let summary = scan_library(
            &pool,
            &config,
            Some(vec![dir_a.path().to_path_buf(), dir_b.path().to_path_buf()]),
            &cancel,
            &mut |_p| {},
        )
        .await
        .unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.created, 2);
    }

    #[tokio::test]
    async fn scan_library_requires_a_root() {
        let pool = setup().await;
        let config = EngineConfig::default();
        let cancel = CancellationToken::new();
        let err = scan_library(&pool, &config, None, &cancel, &mut |_p| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn reindex_merges_tracks_that_collapse_onto_one_uid() {
        let pool = setup().await;

        // Seed under rules that keep edition suffixes, so the two
        // titles produce distinct uids
        let loose = EngineConfig {
            normalizer: NormalizerConfig {
                strip_edition_suffixes: false,
                ..NormalizerConfig::default()
            },
            ..EngineConfig::default()
        };
        let resolver = CatalogResolver::new(pool.clone(), loose.normalizer.clone());
        let artist = resolver
            .resolve_artist(&ArtistInput {
                name: "Artist".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner();
        resolver
            .resolve_track(&TrackInput {
                title: "Song".to_string(),
                artist_name: "Artist".to_string(),
                primary_artist_id: artist.id.clone(),
                duration_secs: Some(200),
                ..Default::default()
            })
            .await
            .unwrap();
        resolver
            .resolve_track(&TrackInput {
                title: "Song (Remastered 2011)".to_string(),
                artist_name: "Artist".to_string(),
                primary_artist_id: artist.id.clone(),
                duration_secs: Some(200),
                ..Default::default()
            })
            .await
            .unwrap();

        let before: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(before, 2);

        // Under the default rules the suffix strips away and the uids
        // collide
        let report = reindex_track_uids(&pool, &EngineConfig::default())
            .await
            .unwrap();
        assert_eq!(report.merged, 1);

        let after: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(after, 1);
    }

    #[tokio::test]
    async fn reindex_is_a_noop_when_rules_are_unchanged() {
        let pool = setup().await;
        let config = EngineConfig::default();
        let resolver = CatalogResolver::new(pool.clone(), config.normalizer.clone());
        let artist = resolver
            .resolve_artist(&ArtistInput {
                name: "Artist".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner();
        resolver
            .resolve_track(&TrackInput {
                title: "Song".to_string(),
                artist_name: "Artist".to_string(),
                primary_artist_id: artist.id,
                duration_secs: Some(200),
                ..Default::default()
            })
            .await
            .unwrap();

        let report = reindex_track_uids(&pool, &config).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(report.merged, 0);
    }
}
