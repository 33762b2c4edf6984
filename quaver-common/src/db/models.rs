//! Row models for the catalog tables
//!
//! Entity identifiers are UUID v4 values stored as TEXT; foreign keys
//! are plain columns. The resolver owns all writes to the catalog
//! tables, the matcher owns the listen-side columns.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Canonical artist row. Identity is `name_normalized`; `mbid` when
/// present takes precedence for lookups.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ArtistRow {
    pub id: String,
    pub name: String,
    pub name_normalized: String,
    pub sort_name: Option<String>,
    pub mbid: Option<String>,
}

/// Release row. Identity is `(primary_artist_id, title_normalized)`
/// unless an `mbid` is present.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReleaseRow {
    pub id: String,
    pub title: String,
    pub title_normalized: String,
    pub primary_artist_id: String,
    pub release_group_id: Option<String>,
    pub year: Option<i64>,
    pub mbid: Option<String>,
}

/// Canonical track row, the join point of the catalog.
///
/// `track_uid` is the dedup key when no external id exists; exactly
/// one track per distinct uid.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TrackRow {
    pub id: String,
    pub title: String,
    pub title_normalized: String,
    pub primary_artist_id: String,
    pub release_id: Option<String>,
    pub duration_secs: Option<i64>,
    pub track_uid: String,
    pub mbid: Option<String>,
    pub isrc: Option<String>,
}

/// One physical file on disk. Identity is the hash of its path;
/// re-scanning the same path updates, never duplicates, the row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MediaFileRow {
    pub id: String,
    pub path: String,
    pub path_hash: String,
    pub file_size: Option<i64>,
    pub file_mtime: Option<i64>,
    pub content_hash: Option<String>,
    pub track_id: Option<String>,
    /// Media file id of the byte-identical original, when this file is
    /// a duplicate by content hash.
    pub duplicate_of: Option<String>,
}

/// Enriched projection of a raw listen: one per raw listen, carrying
/// the resolution state and the matched track when one was accepted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ListenRow {
    pub id: String,
    pub raw_listen_id: String,
    pub track_id: Option<String>,
    pub enrich_status: String,
    pub match_confidence: Option<i64>,
    pub match_reason: Option<String>,
}

/// Below-threshold alternate match retained for audit and manual
/// resolution. Never auto-promoted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MatchCandidateRow {
    pub listen_id: String,
    pub track_id: String,
    pub confidence: i64,
    pub features: Option<String>,
    pub rank: i64,
}
