//! Library summary read model
//!
//! Aggregate counts over the catalog and the listen history, computed
//! on demand. Pure reads; nothing here writes.

use quaver_common::Result;
use serde::Serialize;
use sqlx::SqlitePool;

/// Tracks at or above this duration are reported separately from
/// ordinary songs.
const LONG_TRACK_SECS: i64 = 600;

/// Listen counts per enrichment state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichBreakdown {
    pub unenriched: i64,
    pub matched: i64,
    pub provisional: i64,
    pub ambiguous: i64,
    pub unmatched: i64,
}

/// One artist with its accumulated listen count.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ArtistTally {
    pub artist_id: String,
    pub name: String,
    pub listen_count: i64,
}

/// Snapshot of the library and listen history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LibrarySummary {
    pub media_files: i64,
    pub artists: i64,
    pub releases: i64,
    /// Tracks under the long-track cutoff, or with unknown duration.
    pub songs: i64,
    /// Tracks at or above the long-track cutoff (mixes, audiobooks).
    pub long_tracks: i64,
    pub listens: i64,
    pub enrich: EnrichBreakdown,
    /// Most-listened artists, best first.
    pub top_artists: Vec<ArtistTally>,
}

/// Compute the library summary. `top_limit` bounds the top-artists
/// list.
pub async fn library_summary(db: &SqlitePool, top_limit: u32) -> Result<LibrarySummary> {
    let media_files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media_files")
        .fetch_one(db)
        .await?;
    let artists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artists")
        .fetch_one(db)
        .await?;
    let releases: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM releases")
        .fetch_one(db)
        .await?;
    let songs: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM tracks WHERE duration_secs IS NULL OR duration_secs < ?",
    )
    .bind(LONG_TRACK_SECS)
    .fetch_one(db)
    .await?;
    let long_tracks: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM tracks WHERE duration_secs >= ?")
            .bind(LONG_TRACK_SECS)
            .fetch_one(db)
            .await?;
    let listens: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listens")
        .fetch_one(db)
        .await?;

    let mut enrich = EnrichBreakdown::default();
    let by_status: Vec<(String, i64)> =
        sqlx::query_as("SELECT enrich_status, COUNT(*) FROM listens GROUP BY enrich_status")
            .fetch_all(db)
            .await?;
    for (status, count) in by_status {
        match status.as_str() {
            "unenriched" => enrich.unenriched = count,
            "matched" => enrich.matched = count,
            "provisional" => enrich.provisional = count,
            "ambiguous" => enrich.ambiguous = count,
            "unmatched" => enrich.unmatched = count,
            _ => {}
        }
    }

    let top_artists: Vec<ArtistTally> = sqlx::query_as(
        "SELECT a.id AS artist_id, a.name, COUNT(l.id) AS listen_count \
         FROM listens l \
         JOIN tracks t ON t.id = l.track_id \
         JOIN artists a ON a.id = t.primary_artist_id \
         GROUP BY a.id, a.name \
         ORDER BY listen_count DESC, a.name \
         LIMIT ?",
    )
    .bind(i64::from(top_limit))
    .fetch_all(db)
    .await?;

    Ok(LibrarySummary {
        media_files,
        artists,
        releases,
        songs,
        long_tracks,
        listens,
        enrich,
        top_artists,
    })
}
