//! Engine configuration
//!
//! All tunables are carried in immutable config structs passed
//! explicitly into the normalizer, resolver, pipeline and matcher.
//! Resolution runs are reproducible: nothing reads process-wide
//! mutable state.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Text normalization rules.
///
/// Changing these rules changes every normalized key and track uid, so
/// a change must be followed by a controlled re-resolution
/// (`reindex_track_uids`), never applied in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Strip bracketed edition/remaster noise such as
    /// "(Remastered 2011)" or "[Deluxe Edition]" from titles.
    pub strip_edition_suffixes: bool,
    /// Width in seconds of the duration bucket used by the track uid.
    pub duration_bucket_secs: u32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            strip_edition_suffixes: true,
            duration_bucket_secs: 2,
        }
    }
}

/// Listen matcher thresholds.
///
/// The values here are operator-tunable; the defaults are the ones the
/// enrichment jobs ship with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Minimum confidence for a listen to be linked to a track.
    pub accept_threshold: u8,
    /// Minimum confidence for a candidate to be persisted for audit.
    pub include_threshold: u8,
    /// Duration agreement window for the fuzzy tier, in seconds.
    pub duration_tolerance_secs: i64,
    /// Cap on persisted match candidates per listen.
    pub max_candidates: usize,
    /// Candidates within this many points of the best one make the
    /// listen ambiguous when the best is below the accept threshold.
    pub ambiguity_band: u8,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 60,
            include_threshold: 30,
            duration_tolerance_secs: 5,
            max_candidates: 5,
            ambiguity_band: 5,
        }
    }
}

/// Filesystem scan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Roots to walk. Usually supplied per job rather than from the
    /// config file.
    pub roots: Vec<PathBuf>,
    /// Lower-case audio file extensions accepted by the scanner.
    pub extensions: Vec<String>,
    /// Remove media file rows whose path vanished from a fully
    /// scanned root. Tracks and listens are never removed.
    pub prune_missing: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            extensions: ["mp3", "flac", "m4a", "ogg", "oga", "opus", "wav", "aac"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            prune_missing: true,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub normalizer: NormalizerConfig,
    pub matcher: MatcherConfig,
    pub scan: ScanConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults
    /// when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read config failed: {}", e)))?;
        let config: EngineConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse config failed: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.matcher.include_threshold > self.matcher.accept_threshold {
            return Err(Error::Config(format!(
                "include_threshold ({}) must not exceed accept_threshold ({})",
                self.matcher.include_threshold, self.matcher.accept_threshold
            )));
        }
        if self.matcher.accept_threshold > 100 {
            return Err(Error::Config(
                "accept_threshold must be at most 100".to_string(),
            ));
        }
        if self.normalizer.duration_bucket_secs == 0 {
            return Err(Error::Config(
                "duration_bucket_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
