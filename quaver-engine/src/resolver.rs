//! Canonical entity resolver
//!
//! Idempotent upsert-or-link for artists, releases and tracks.
//! Lookup priority per identity: external id (MBID/ISRC), then the
//! normalized key (alias for artists, `(artist, normalized title)` for
//! releases, track uid for tracks), then create.
//!
//! The storage layer enforces the identity constraints; a unique
//! violation on insert means a concurrent writer won the race, and the
//! resolver re-fetches instead of failing the caller.

use quaver_common::config::NormalizerConfig;
use quaver_common::db::models::{ArtistRow, ReleaseRow, TrackRow};
use quaver_common::error::is_unique_violation;
use quaver_common::{Error, Result};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::normalize::{normalize_text, normalize_title};
use crate::uid::track_uid;

/// Retries before a persistent insert race is escalated to the caller.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Outcome of a resolve call.
#[derive(Debug, Clone)]
pub enum Resolved<T> {
    /// A new canonical row was created.
    Created(T),
    /// An existing canonical row matched the identity.
    Found(T),
}

impl<T> Resolved<T> {
    pub fn into_inner(self) -> T {
        match self {
            Resolved::Created(inner) | Resolved::Found(inner) => inner,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Resolved::Created(_))
    }
}

impl<T> std::ops::Deref for Resolved<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Resolved::Created(inner) | Resolved::Found(inner) => inner,
        }
    }
}

/// Metadata bag for artist resolution.
#[derive(Debug, Clone, Default)]
pub struct ArtistInput {
    pub name: String,
    pub sort_name: Option<String>,
    pub mbid: Option<String>,
}

/// Metadata bag for release resolution.
#[derive(Debug, Clone, Default)]
pub struct ReleaseInput {
    pub title: String,
    pub primary_artist_id: String,
    pub year: Option<i64>,
    pub mbid: Option<String>,
}

/// Metadata bag for track resolution.
#[derive(Debug, Clone, Default)]
pub struct TrackInput {
    pub title: String,
    /// Raw primary artist name, used for the uid fingerprint.
    pub artist_name: String,
    pub primary_artist_id: String,
    pub release_id: Option<String>,
    pub duration_secs: Option<i64>,
    pub mbid: Option<String>,
    pub isrc: Option<String>,
}

/// Canonical entity resolver. Exclusively owns Artist/Release/Track/
/// MediaFile writes; never touches listen data.
#[derive(Clone)]
pub struct CatalogResolver {
    db: SqlitePool,
    config: NormalizerConfig,
}

impl CatalogResolver {
    pub fn new(db: SqlitePool, config: NormalizerConfig) -> Self {
        Self { db, config }
    }

    // ------------------------------------------------------------------
    // Artists
    // ------------------------------------------------------------------

    /// Resolve an artist to its canonical row, creating one on first
    /// sighting.
    pub async fn resolve_artist(&self, input: &ArtistInput) -> Result<Resolved<ArtistRow>> {
        let normalized = normalize_text(&self.config, &input.name);
        if normalized.is_empty() {
            return Err(Error::InvalidInput(
                "artist name normalizes to empty".to_string(),
            ));
        }

        for _attempt in 0..MAX_CONFLICT_RETRIES {
            // External id is the strongest signal and bypasses name
            // comparison entirely
            if let Some(mbid) = &input.mbid {
                if let Some(row) = self.find_artist_by_mbid(mbid).await? {
                    self.absorb_artist_duplicate(&row, &normalized).await?;
                    self.register_alias_quiet(&row.id, &normalized).await?;
                    return Ok(Resolved::Found(row));
                }
            }

            if let Some(mut row) = self.find_artist_by_alias(&normalized).await? {
                if let Some(mbid) = &input.mbid {
                    if row.mbid.is_none() {
                        // First time an external id shows up for this
                        // artist; it becomes the authoritative identity
                        match self.set_artist_mbid(&row.id, mbid).await {
                            Ok(()) => row.mbid = Some(mbid.clone()),
                            Err(Error::Database(e)) if is_unique_violation(&e) => {
                                debug!(artist_id = %row.id, "Lost mbid race, refetching");
                                continue;
                            }
                            Err(e) => return Err(e),
                        }
                    } else if row.mbid.as_deref() != Some(mbid.as_str()) {
                        warn!(
                            artist_id = %row.id,
                            existing = ?row.mbid,
                            incoming = %mbid,
                            "Artist already carries a different external id; keeping both rows"
                        );
                    }
                }
                return Ok(Resolved::Found(row));
            }

            let id = Uuid::new_v4().to_string();
            let insert = sqlx::query(
                "INSERT INTO artists (id, name, name_normalized, sort_name, mbid) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&input.name)
            .bind(&normalized)
            .bind(input.sort_name.as_deref().unwrap_or(&normalized))
            .bind(&input.mbid)
            .execute(&self.db)
            .await;

            match insert {
                Ok(_) => {
                    self.register_alias_quiet(&id, &normalized).await?;
                    info!(artist = %input.name, artist_id = %id, "Created artist");
                    return Ok(Resolved::Created(ArtistRow {
                        id,
                        name: input.name.clone(),
                        name_normalized: normalized,
                        sort_name: Some(
                            input.sort_name.clone().unwrap_or_else(|| {
                                normalize_text(&self.config, &input.name)
                            }),
                        ),
                        mbid: input.mbid.clone(),
                    }));
                }
                Err(e) if is_unique_violation(&e) => {
                    debug!(artist = %input.name, "Lost artist insert race, refetching");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Conflict(format!(
            "artist resolution kept losing insert races: {}",
            input.name
        )))
    }

    /// Register an alternate name for an artist. Aliases are globally
    /// unique; an alias already claimed by another artist is left
    /// untouched.
    pub async fn add_artist_alias(&self, artist_id: &str, raw_alias: &str) -> Result<()> {
        let normalized = normalize_text(&self.config, raw_alias);
        if normalized.is_empty() {
            return Ok(());
        }
        self.register_alias_quiet(artist_id, &normalized).await
    }

    async fn register_alias_quiet(&self, artist_id: &str, alias_normalized: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO artist_aliases (alias_normalized, artist_id) VALUES (?, ?)",
        )
        .bind(alias_normalized)
        .bind(artist_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn find_artist_by_mbid(&self, mbid: &str) -> Result<Option<ArtistRow>> {
        let row = sqlx::query_as::<_, ArtistRow>(
            "SELECT id, name, name_normalized, sort_name, mbid FROM artists WHERE mbid = ?",
        )
        .bind(mbid)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn find_artist_by_alias(&self, normalized: &str) -> Result<Option<ArtistRow>> {
        let row = sqlx::query_as::<_, ArtistRow>(
            "SELECT DISTINCT a.id, a.name, a.name_normalized, a.sort_name, a.mbid \
             FROM artists a \
             LEFT JOIN artist_aliases al ON al.artist_id = a.id \
             WHERE a.name_normalized = ?1 OR al.alias_normalized = ?1 \
             LIMIT 1",
        )
        .bind(normalized)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn set_artist_mbid(&self, artist_id: &str, mbid: &str) -> Result<()> {
        sqlx::query(
            "UPDATE artists SET mbid = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(mbid)
        .bind(artist_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// When an external id proves an mbid-carrying row and a
    /// name-matched row are the same artist, fold the latter into the
    /// former. Rows with conflicting external ids are never merged.
    async fn absorb_artist_duplicate(&self, survivor: &ArtistRow, normalized: &str) -> Result<()> {
        let other = match self.find_artist_by_alias(normalized).await? {
            Some(other) if other.id != survivor.id => other,
            _ => return Ok(()),
        };

        if other.mbid.is_some() {
            warn!(
                survivor = %survivor.id,
                duplicate = %other.id,
                "Both artist rows carry external ids; flagging for manual review"
            );
            return Ok(());
        }

        self.merge_artists(&survivor.id, &other.id).await
    }

    /// Re-point all foreign keys from `duplicate` onto `survivor` and
    /// remove the duplicate. The row carrying the external id survives.
    pub async fn merge_artists(&self, survivor_id: &str, duplicate_id: &str) -> Result<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("UPDATE artist_aliases SET artist_id = ? WHERE artist_id = ?")
            .bind(survivor_id)
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE tracks SET primary_artist_id = ? WHERE primary_artist_id = ?")
            .bind(survivor_id)
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE OR IGNORE track_artists SET artist_id = ? WHERE artist_id = ?")
            .bind(survivor_id)
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM track_artists WHERE artist_id = ?")
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;

        // Release identities may collide after repointing; the
        // leftovers collapse into the survivor's releases
        sqlx::query("UPDATE OR IGNORE releases SET primary_artist_id = ? WHERE primary_artist_id = ?")
            .bind(survivor_id)
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM releases WHERE primary_artist_id = ?")
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE OR IGNORE release_groups SET primary_artist_id = ? WHERE primary_artist_id = ?",
        )
        .bind(survivor_id)
        .bind(duplicate_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM release_groups WHERE primary_artist_id = ?")
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM artists WHERE id = ?")
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(survivor = %survivor_id, duplicate = %duplicate_id, "Merged artists");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Releases
    // ------------------------------------------------------------------

    /// Resolve a release against `(primary artist, normalized title)`,
    /// or its MBID when present.
    pub async fn resolve_release(&self, input: &ReleaseInput) -> Result<Resolved<ReleaseRow>> {
        let normalized = normalize_text(&self.config, &input.title);
        if normalized.is_empty() {
            return Err(Error::InvalidInput(
                "release title normalizes to empty".to_string(),
            ));
        }

        for _attempt in 0..MAX_CONFLICT_RETRIES {
            if let Some(mbid) = &input.mbid {
                if let Some(row) = self.find_release_by_mbid(mbid).await? {
                    return Ok(Resolved::Found(row));
                }
            }

            if let Some(mut row) = self
                .find_release_by_identity(&input.primary_artist_id, &normalized)
                .await?
            {
                if let Some(mbid) = &input.mbid {
                    if row.mbid.is_none() {
                        match self.set_release_mbid(&row.id, mbid).await {
                            Ok(()) => row.mbid = Some(mbid.clone()),
                            Err(Error::Database(e)) if is_unique_violation(&e) => continue,
                            Err(e) => return Err(e),
                        }
                    } else if row.mbid.as_deref() != Some(mbid.as_str()) {
                        warn!(
                            release_id = %row.id,
                            "Release already carries a different external id; keeping both rows"
                        );
                    }
                }
                return Ok(Resolved::Found(row));
            }

            let group_id = self
                .ensure_release_group(&input.primary_artist_id, &input.title, &normalized)
                .await?;

            let id = Uuid::new_v4().to_string();
            let insert = sqlx::query(
                "INSERT INTO releases \
                 (id, title, title_normalized, primary_artist_id, release_group_id, year, mbid) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&input.title)
            .bind(&normalized)
            .bind(&input.primary_artist_id)
            .bind(&group_id)
            .bind(input.year)
            .bind(&input.mbid)
            .execute(&self.db)
            .await;

            match insert {
                Ok(_) => {
                    info!(release = %input.title, release_id = %id, "Created release");
                    return Ok(Resolved::Created(ReleaseRow {
                        id,
                        title: input.title.clone(),
                        title_normalized: normalized,
                        primary_artist_id: input.primary_artist_id.clone(),
                        release_group_id: Some(group_id),
                        year: input.year,
                        mbid: input.mbid.clone(),
                    }));
                }
                Err(e) if is_unique_violation(&e) => {
                    debug!(release = %input.title, "Lost release insert race, refetching");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Conflict(format!(
            "release resolution kept losing insert races: {}",
            input.title
        )))
    }

    async fn ensure_release_group(
        &self,
        primary_artist_id: &str,
        title: &str,
        normalized: &str,
    ) -> Result<String> {
        if let Some(id) = sqlx::query_scalar::<_, String>(
            "SELECT id FROM release_groups WHERE primary_artist_id = ? AND title_normalized = ?",
        )
        .bind(primary_artist_id)
        .bind(normalized)
        .fetch_optional(&self.db)
        .await?
        {
            return Ok(id);
        }

        let id = Uuid::new_v4().to_string();
        let insert = sqlx::query(
            "INSERT INTO release_groups (id, title, title_normalized, primary_artist_id) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(title)
        .bind(normalized)
        .bind(primary_artist_id)
        .execute(&self.db)
        .await;

        match insert {
            Ok(_) => Ok(id),
            Err(e) if is_unique_violation(&e) => {
                // Concurrent creator won; use theirs
                let existing = sqlx::query_scalar::<_, String>(
                    "SELECT id FROM release_groups \
                     WHERE primary_artist_id = ? AND title_normalized = ?",
                )
                .bind(primary_artist_id)
                .bind(normalized)
                .fetch_one(&self.db)
                .await?;
                Ok(existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_release_by_mbid(&self, mbid: &str) -> Result<Option<ReleaseRow>> {
        let row = sqlx::query_as::<_, ReleaseRow>(
            "SELECT id, title, title_normalized, primary_artist_id, release_group_id, year, mbid \
             FROM releases WHERE mbid = ?",
        )
        .bind(mbid)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn find_release_by_identity(
        &self,
        primary_artist_id: &str,
        normalized: &str,
    ) -> Result<Option<ReleaseRow>> {
        let row = sqlx::query_as::<_, ReleaseRow>(
            "SELECT id, title, title_normalized, primary_artist_id, release_group_id, year, mbid \
             FROM releases WHERE primary_artist_id = ? AND title_normalized = ?",
        )
        .bind(primary_artist_id)
        .bind(normalized)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn set_release_mbid(&self, release_id: &str, mbid: &str) -> Result<()> {
        sqlx::query(
            "UPDATE releases SET mbid = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(mbid)
        .bind(release_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tracks
    // ------------------------------------------------------------------

    /// Resolve a track. External id match short-circuits the uid
    /// comparison entirely; otherwise exactly one track exists per
    /// distinct uid.
    pub async fn resolve_track(&self, input: &TrackInput) -> Result<Resolved<TrackRow>> {
        let uid = track_uid(
            &self.config,
            Some(&input.artist_name),
            Some(&input.title),
            input.duration_secs,
        );
        let normalized = normalize_title(&self.config, &input.title).title;
        if normalized.is_empty() {
            return Err(Error::InvalidInput(
                "track title normalizes to empty".to_string(),
            ));
        }

        for _attempt in 0..MAX_CONFLICT_RETRIES {
            if let Some(mbid) = &input.mbid {
                if let Some(row) = self.find_track_by_mbid(mbid).await? {
                    self.absorb_track_duplicate(&row, &uid).await?;
                    return Ok(Resolved::Found(row));
                }
            }
            if input.mbid.is_none() {
                if let Some(isrc) = &input.isrc {
                    if let Some(row) = self.find_track_by_isrc(isrc).await? {
                        return Ok(Resolved::Found(row));
                    }
                }
            }

            if let Some(mut row) = self.find_track_by_uid(&uid).await? {
                if let Some(mbid) = &input.mbid {
                    if row.mbid.is_none() {
                        match self
                            .set_track_external_ids(&row.id, Some(mbid.as_str()), input.isrc.as_deref())
                            .await
                        {
                            Ok(()) => {
                                row.mbid = Some(mbid.clone());
                                if row.isrc.is_none() {
                                    row.isrc = input.isrc.clone();
                                }
                            }
                            Err(Error::Database(e)) if is_unique_violation(&e) => continue,
                            Err(e) => return Err(e),
                        }
                    } else if row.mbid.as_deref() != Some(mbid.as_str()) {
                        warn!(
                            track_id = %row.id,
                            existing = ?row.mbid,
                            incoming = %mbid,
                            "Track already carries a different external id; keeping both rows"
                        );
                    }
                }
                return Ok(Resolved::Found(row));
            }

            let id = Uuid::new_v4().to_string();
            let insert = sqlx::query(
                "INSERT INTO tracks \
                 (id, title, title_normalized, primary_artist_id, release_id, duration_secs, \
                  track_uid, mbid, isrc) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&input.title)
            .bind(&normalized)
            .bind(&input.primary_artist_id)
            .bind(&input.release_id)
            .bind(input.duration_secs)
            .bind(&uid)
            .bind(&input.mbid)
            .bind(&input.isrc)
            .execute(&self.db)
            .await;

            match insert {
                Ok(_) => {
                    info!(track = %input.title, track_id = %id, "Created track");
                    return Ok(Resolved::Created(TrackRow {
                        id,
                        title: input.title.clone(),
                        title_normalized: normalized,
                        primary_artist_id: input.primary_artist_id.clone(),
                        release_id: input.release_id.clone(),
                        duration_secs: input.duration_secs,
                        track_uid: uid,
                        mbid: input.mbid.clone(),
                        isrc: input.isrc.clone(),
                    }));
                }
                Err(e) if is_unique_violation(&e) => {
                    debug!(track = %input.title, "Lost track insert race, refetching");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Conflict(format!(
            "track resolution kept losing insert races: {}",
            input.title
        )))
    }

    /// Link ordered artist associations onto a track. Idempotent.
    pub async fn link_track_artists(
        &self,
        track_id: &str,
        artists: &[(String, &str, i64)],
    ) -> Result<()> {
        for (artist_id, role, position) in artists {
            sqlx::query(
                "INSERT OR IGNORE INTO track_artists (track_id, artist_id, role, position) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(track_id)
            .bind(artist_id)
            .bind(role)
            .bind(position)
            .execute(&self.db)
            .await?;
        }
        Ok(())
    }

    pub async fn find_track_by_uid(&self, uid: &str) -> Result<Option<TrackRow>> {
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

    async fn find_track_by_mbid(&self, mbid: &str) -> Result<Option<TrackRow>> {
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

    async fn find_track_by_isrc(&self, isrc: &str) -> Result<Option<TrackRow>> {
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

    async fn set_track_external_ids(
        &self,
        track_id: &str,
        mbid: Option<&str>,
        isrc: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tracks SET mbid = COALESCE(?, mbid), isrc = COALESCE(isrc, ?), \
             updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(mbid)
        .bind(isrc)
        .bind(track_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn absorb_track_duplicate(&self, survivor: &TrackRow, uid: &str) -> Result<()> {
        let other = match self.find_track_by_uid(uid).await? {
            Some(other) if other.id != survivor.id => other,
            _ => return Ok(()),
        };

        if other.mbid.is_some() {
            warn!(
                survivor = %survivor.id,
                duplicate = %other.id,
                "Both track rows carry external ids; flagging for manual review"
            );
            return Ok(());
        }

        self.merge_tracks(&survivor.id, &other.id).await
    }

    /// Re-point media files, listens and candidates from `duplicate`
    /// onto `survivor`, then remove the duplicate track.
    pub async fn merge_tracks(&self, survivor_id: &str, duplicate_id: &str) -> Result<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("UPDATE media_files SET track_id = ? WHERE track_id = ?")
            .bind(survivor_id)
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE listens SET track_id = ? WHERE track_id = ?")
            .bind(survivor_id)
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE OR IGNORE listen_match_candidates SET track_id = ? WHERE track_id = ?",
        )
        .bind(survivor_id)
        .bind(duplicate_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM listen_match_candidates WHERE track_id = ?")
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM track_artists WHERE track_id = ?")
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM tracks WHERE id = ?")
            .bind(duplicate_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(survivor = %survivor_id, duplicate = %duplicate_id, "Merged tracks");
        Ok(())
    }
}
