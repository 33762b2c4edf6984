//! Database initialization
//!
//! Opens (or creates) the SQLite database and applies the catalog
//! schema. Every `create_*_table` function is idempotent, so startup
//! is safe to repeat. The unique indexes declared here are the
//! storage-side half of the resolver contract: a violated constraint
//! means a concurrent writer won the race, and callers re-fetch
//! instead of failing.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL allows concurrent readers with one writer, which the scan
    // and enrichment workers rely on
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    init_schema(&pool).await?;

    Ok(pool)
}

/// Apply the full catalog schema to an open pool.
///
/// Exposed separately so tests can run against `:memory:` databases.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    create_artists_table(pool).await?;
    create_artist_aliases_table(pool).await?;
    create_release_groups_table(pool).await?;
    create_releases_table(pool).await?;
    create_tracks_table(pool).await?;
    create_track_artists_table(pool).await?;
    create_media_files_table(pool).await?;
    create_raw_listens_table(pool).await?;
    create_listens_table(pool).await?;
    create_listen_match_candidates_table(pool).await?;
    Ok(())
}

async fn create_artists_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artists (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_normalized TEXT NOT NULL UNIQUE,
            sort_name TEXT,
            mbid TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS ix_artists_mbid ON artists (mbid) WHERE mbid IS NOT NULL",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_artist_aliases_table(pool: &SqlitePool) -> Result<()> {
    // alias_normalized is the primary key: no two artists may claim
    // the same alias
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artist_aliases (
            alias_normalized TEXT PRIMARY KEY,
            artist_id TEXT NOT NULL REFERENCES artists(id) ON DELETE CASCADE,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_artist_aliases_artist ON artist_aliases (artist_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_release_groups_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS release_groups (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            title_normalized TEXT NOT NULL,
            primary_artist_id TEXT REFERENCES artists(id) ON DELETE SET NULL,
            mbid TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS ix_release_groups_identity \
         ON release_groups (primary_artist_id, title_normalized)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_releases_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS releases (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            title_normalized TEXT NOT NULL,
            primary_artist_id TEXT NOT NULL REFERENCES artists(id) ON DELETE CASCADE,
            release_group_id TEXT REFERENCES release_groups(id) ON DELETE SET NULL,
            year INTEGER,
            mbid TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Identity when no external id is present
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS ix_releases_identity \
         ON releases (primary_artist_id, title_normalized)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS ix_releases_mbid ON releases (mbid) WHERE mbid IS NOT NULL",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_tracks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            title_normalized TEXT NOT NULL,
            primary_artist_id TEXT NOT NULL REFERENCES artists(id) ON DELETE CASCADE,
            release_id TEXT REFERENCES releases(id) ON DELETE SET NULL,
            duration_secs INTEGER,
            track_uid TEXT NOT NULL UNIQUE,
            mbid TEXT,
            isrc TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS ix_tracks_mbid ON tracks (mbid) WHERE mbid IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_tracks_isrc ON tracks (isrc) WHERE isrc IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_tracks_title_normalized ON tracks (title_normalized)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_track_artists_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS track_artists (
            track_id TEXT NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
            artist_id TEXT NOT NULL REFERENCES artists(id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (track_id, artist_id, role)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_media_files_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS media_files (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            path_hash TEXT NOT NULL UNIQUE,
            file_size INTEGER,
            file_mtime INTEGER,
            content_hash TEXT,
            track_id TEXT REFERENCES tracks(id) ON DELETE SET NULL,
            duplicate_of TEXT,
            last_scan_at TIMESTAMP,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_media_files_content_hash \
         ON media_files (content_hash) WHERE content_hash IS NOT NULL",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_raw_listens_table(pool: &SqlitePool) -> Result<()> {
    // Append-only: rows are never mutated after insert
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_listens (
            id TEXT PRIMARY KEY,
            user TEXT NOT NULL,
            listened_at INTEGER NOT NULL,
            source TEXT NOT NULL,
            source_track_id TEXT NOT NULL DEFAULT '',
            artist_raw TEXT,
            title_raw TEXT,
            album_raw TEXT,
            duration_secs INTEGER,
            mbid TEXT,
            isrc TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS ix_raw_listens_identity \
         ON raw_listens (user, listened_at, source, source_track_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_listens_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS listens (
            id TEXT PRIMARY KEY,
            raw_listen_id TEXT NOT NULL UNIQUE REFERENCES raw_listens(id) ON DELETE CASCADE,
            track_id TEXT REFERENCES tracks(id) ON DELETE SET NULL,
            enrich_status TEXT NOT NULL DEFAULT 'unenriched',
            match_confidence INTEGER,
            match_reason TEXT,
            last_enriched_at TIMESTAMP,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_listens_enrich_status ON listens (enrich_status)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS ix_listens_track ON listens (track_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_listen_match_candidates_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS listen_match_candidates (
            listen_id TEXT NOT NULL REFERENCES listens(id) ON DELETE CASCADE,
            track_id TEXT NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
            confidence INTEGER NOT NULL,
            features TEXT,
            rank INTEGER NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (listen_id, track_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(count >= 10);
    }

    #[tokio::test]
    async fn alias_uniqueness_is_global() {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        init_schema(&pool).await.unwrap();

        sqlx::query("INSERT INTO artists (id, name, name_normalized) VALUES ('a1', 'A', 'a')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO artists (id, name, name_normalized) VALUES ('a2', 'B', 'b')")
            .execute(&pool)
            .await
            .unwrap();

        sqlx::query(
            "INSERT INTO artist_aliases (alias_normalized, artist_id) VALUES ('shared', 'a1')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let err = sqlx::query(
            "INSERT INTO artist_aliases (alias_normalized, artist_id) VALUES ('shared', 'a2')",
        )
        .execute(&pool)
        .await
        .unwrap_err();
        assert!(crate::error::is_unique_violation(&err));
    }

    #[tokio::test]
    async fn raw_listen_identity_tuple_is_unique() {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        init_schema(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO raw_listens (id, user, listened_at, source) \
             VALUES ('r1', 'alice', 1000, 'listenbrainz')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let err = sqlx::query(
            "INSERT INTO raw_listens (id, user, listened_at, source) \
             VALUES ('r2', 'alice', 1000, 'listenbrainz')",
        )
        .execute(&pool)
        .await
        .unwrap_err();
        assert!(crate::error::is_unique_violation(&err));
    }
}
