//! Filesystem ingest pipeline
//!
//! Turns discovered media files into catalog rows: tag extraction,
//! content hashing, resolver calls and the media_files upsert. One
//! file is one unit of work; a failure marks that file and the scan
//! moves on. Cancellation is honored between files, never mid-file.

use std::path::Path;

use quaver_common::config::{EngineConfig, NormalizerConfig, ScanConfig};
use quaver_common::{Error, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::normalize::normalize_title;
use crate::resolver::{ArtistInput, CatalogResolver, ReleaseInput, TrackInput};
use crate::scanner::{discover_files, DiscoveredFile};

/// Artist credited when a file carries no artist tag at all.
const UNKNOWN_ARTIST: &str = "Unknown Artist";

/// What happened to one successfully ingested file. Files that fail
/// to ingest surface as errors on the scan summary instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// First sighting; a new media_files row was created.
    Created,
    /// Known path whose content or metadata changed.
    Updated,
    /// Known path, unchanged size and mtime; nothing re-read.
    Skipped,
}

/// Progress snapshot handed to the caller after every file.
#[derive(Debug, Clone, Default)]
pub struct ScanProgress {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub current_path: String,
    pub error: Option<String>,
}

/// Totals for one completed (or cancelled) scan pass.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
    pub pruned: u64,
    pub cancelled: bool,
}

/// Tag fields the pipeline cares about. Anything the file does not
/// carry stays `None` and downstream fallbacks apply.
#[derive(Debug, Clone, Default)]
struct ExtractedTags {
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    year: Option<i64>,
    duration_secs: Option<i64>,
    mbid: Option<String>,
}

/// Filesystem ingest pipeline. Owns no long-lived state beyond the
/// pool; safe to construct per scan.
pub struct IngestPipeline {
    db: SqlitePool,
    resolver: CatalogResolver,
    normalizer: NormalizerConfig,
    scan: ScanConfig,
}

impl IngestPipeline {
    pub fn new(db: SqlitePool, config: &EngineConfig) -> Self {
        let resolver = CatalogResolver::new(db.clone(), config.normalizer.clone());
        Self {
            db,
            resolver,
            normalizer: config.normalizer.clone(),
            scan: config.scan.clone(),
        }
    }

    /// Scan one library root to completion.
    ///
    /// The progress callback fires after every file. Vanished files
    /// are pruned only when the pass ran to completion uncancelled,
    /// so an interrupted scan can never mistake unvisited files for
    /// deleted ones.
    pub async fn scan_root(
        &self,
        root: &Path,
        cancel: &CancellationToken,
        progress: &mut dyn FnMut(&ScanProgress),
    ) -> Result<ScanSummary> {
        info!(root = %root.display(), "Starting library scan");
        let mut summary = ScanSummary::default();

        for file in discover_files(&self.scan, root) {
            if cancel.is_cancelled() {
                info!(root = %root.display(), "Scan cancelled");
                summary.cancelled = true;
                break;
            }

            let mut snapshot = ScanProgress {
                current_path: file.path.display().to_string(),
                ..Default::default()
            };

            match self.ingest_file(&file).await {
                Ok(ScanOutcome::Created) => summary.created += 1,
                Ok(ScanOutcome::Updated) => summary.updated += 1,
                Ok(ScanOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "Failed to ingest file");
                    summary.errors += 1;
                    snapshot.error = Some(e.to_string());
                }
            }
            summary.processed += 1;

            snapshot.processed = summary.processed;
            snapshot.created = summary.created;
            snapshot.updated = summary.updated;
            snapshot.skipped = summary.skipped;
            snapshot.errors = summary.errors;
            progress(&snapshot);
        }

        if !summary.cancelled && self.scan.prune_missing {
            summary.pruned = self.prune_missing(root).await?;
        }

        info!(
            root = %root.display(),
            processed = summary.processed,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            errors = summary.errors,
            pruned = summary.pruned,
            cancelled = summary.cancelled,
            "Library scan finished"
        );
        Ok(summary)
    }

    /// Ingest a single file: shortcut on unchanged size+mtime, else
    /// extract tags, hash content, resolve catalog rows and upsert the
    /// media_files row.
    async fn ingest_file(&self, file: &DiscoveredFile) -> Result<ScanOutcome> {
        let path_str = file.path.display().to_string();
        let path_hash = format!("{:x}", Sha256::digest(path_str.as_bytes()));

        let existing: Option<(String, Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT id, file_size, file_mtime FROM media_files WHERE path_hash = ?",
        )
        .bind(&path_hash)
        .fetch_optional(&self.db)
        .await?;

        if let Some((id, size, mtime)) = &existing {
            if *size == Some(file.file_size) && *mtime == file.file_mtime {
                sqlx::query(
                    "UPDATE media_files SET last_scan_at = CURRENT_TIMESTAMP WHERE id = ?",
                )
                .bind(id)
                .execute(&self.db)
                .await?;
                debug!(path = %path_str, "Unchanged file, skipping");
                return Ok(ScanOutcome::Skipped);
            }
        }

        let tags = match extract_tags(&file.path).await {
            Ok(tags) => tags,
            Err(e) => {
                // Unparseable audio still gets cataloged from its
                // filename so the file is visible and re-taggable
                warn!(path = %path_str, error = %e, "Tag extraction failed, using filename fallback");
                ExtractedTags::default()
            }
        };

        let content_hash = hash_file_content(&file.path).await?;

        let title = tags.title.clone().unwrap_or_else(|| file_stem(&file.path));
        let artist_name = tags
            .artist
            .clone()
            .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());

        let artist = self
            .resolver
            .resolve_artist(&ArtistInput {
                name: artist_name.clone(),
                ..Default::default()
            })
            .await?
            .into_inner();

        let release_id = match &tags.album {
            Some(album) => Some(
                self.resolver
                    .resolve_release(&ReleaseInput {
                        title: album.clone(),
                        primary_artist_id: artist.id.clone(),
                        year: tags.year,
                        ..Default::default()
                    })
                    .await?
                    .id
                    .clone(),
            ),
            None => None,
        };

        let track = self
            .resolver
            .resolve_track(&TrackInput {
                title: title.clone(),
                artist_name,
                primary_artist_id: artist.id.clone(),
                release_id,
                duration_secs: tags.duration_secs,
                mbid: tags.mbid.clone(),
                ..Default::default()
            })
            .await?
            .into_inner();

        let mut links = vec![(artist.id.clone(), "primary", 0i64)];
        for (i, featured_name) in normalize_title(&self.normalizer, &title)
            .featured
            .iter()
            .enumerate()
        {
            let featured = self
                .resolver
                .resolve_artist(&ArtistInput {
                    name: featured_name.clone(),
                    ..Default::default()
                })
                .await?
                .into_inner();
            links.push((featured.id, "featured", (i + 1) as i64));
        }
        self.resolver.link_track_artists(&track.id, &links).await?;

        // Byte-identical content under another path marks this row as
        // a duplicate of the first-seen file
        let duplicate_of: Option<String> = sqlx::query_scalar(
            "SELECT id FROM media_files \
             WHERE content_hash = ? AND path_hash != ? \
             ORDER BY created_at, id LIMIT 1",
        )
        .bind(&content_hash)
        .bind(&path_hash)
        .fetch_optional(&self.db)
        .await?;

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO media_files \
             (id, path, path_hash, file_size, file_mtime, content_hash, track_id, duplicate_of, \
              last_scan_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP) \
             ON CONFLICT(path_hash) DO UPDATE SET \
               file_size = excluded.file_size, \
               file_mtime = excluded.file_mtime, \
               content_hash = excluded.content_hash, \
               track_id = excluded.track_id, \
               duplicate_of = excluded.duplicate_of, \
               last_scan_at = CURRENT_TIMESTAMP, \
               updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&id)
        .bind(&path_str)
        .bind(&path_hash)
        .bind(file.file_size)
        .bind(file.file_mtime)
        .bind(&content_hash)
        .bind(&track.id)
        .bind(&duplicate_of)
        .execute(&self.db)
        .await?;

        if existing.is_some() {
            Ok(ScanOutcome::Updated)
        } else {
            Ok(ScanOutcome::Created)
        }
    }

    /// Remove media_files rows under `root` whose file no longer
    /// exists on disk. Only called after a complete uncancelled pass.
    async fn prune_missing(&self, root: &Path) -> Result<u64> {
        // LIKE metacharacters in the root must not widen the scope,
        // and the separator anchor keeps a sibling root such as
        // "music2" out of a scan of "music"
        let escaped = root
            .display()
            .to_string()
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let prefix = format!("{}{}%", escaped, std::path::MAIN_SEPARATOR);
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, path FROM media_files WHERE path LIKE ? ESCAPE '\\'")
                .bind(&prefix)
                .fetch_all(&self.db)
                .await?;

        let mut pruned = 0u64;
        for (id, path) in rows {
            if !Path::new(&path).exists() {
                sqlx::query("DELETE FROM media_files WHERE id = ?")
                    .bind(&id)
                    .execute(&self.db)
                    .await?;
                info!(path = %path, "Pruned vanished media file");
                pruned += 1;
            }
        }
        Ok(pruned)
    }
}

/// Read tag metadata off-thread; lofty parses synchronously.
async fn extract_tags(path: &Path) -> Result<ExtractedTags> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_tags_blocking(&path))
        .await
        .map_err(|e| Error::Internal(format!("Tag extraction task failed: {}", e)))?
}

fn extract_tags_blocking(path: &Path) -> Result<ExtractedTags> {
    use lofty::file::{AudioFile, TaggedFileExt};
    use lofty::probe::Probe;
    use lofty::tag::{Accessor, ItemKey};

    let tagged_file = Probe::open(path)
        .map_err(|e| Error::InvalidInput(format!("Failed to probe audio file: {}", e)))?
        .read()
        .map_err(|e| Error::InvalidInput(format!("Failed to read audio file tags: {}", e)))?;

    let duration_secs = Some(tagged_file.properties().duration().as_secs() as i64);

    let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());
    let Some(tag) = tag else {
        debug!(path = %path.display(), "No tags found in audio file");
        return Ok(ExtractedTags {
            duration_secs,
            ..Default::default()
        });
    };

    Ok(ExtractedTags {
        title: tag.title().map(|s| s.to_string()),
        artist: tag.artist().map(|s| s.to_string()),
        album: tag.album().map(|s| s.to_string()),
        year: tag.year().map(|y| y as i64),
        duration_secs,
        mbid: tag
            .get_string(&ItemKey::MusicBrainzRecordingId)
            .map(|s| s.to_string()),
    })
}

/// SHA-256 over the file content, read in 1MB chunks off-thread.
async fn hash_file_content(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        use std::io::Read;

        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 1024 * 1024];
        loop {
            let bytes_read = file.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| Error::Internal(format!("Hash calculation task failed: {}", e)))?
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}
