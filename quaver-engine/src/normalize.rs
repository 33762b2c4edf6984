//! Text and metadata canonicalization
//!
//! Pure, total and deterministic: two raw strings that normalize to
//! the same value are the same identity for matching purposes. The
//! rules are carried in [`NormalizerConfig`]; a rule change requires a
//! controlled re-resolution (`jobs::reindex_track_uids`), never an
//! in-place mutation.

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use quaver_common::config::NormalizerConfig;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Title with featured-artist fragments split out of the main text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTitle {
    /// Normalized main title, featuring credits removed.
    pub title: String,
    /// Normalized featured artist names extracted from the raw title.
    pub featured: Vec<String>,
}

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Bracketed or dash-suffixed edition/remaster noise, e.g.
/// "(Remastered 2011)", "[Deluxe Edition]", "- 2011 Remaster".
static EDITION_SUFFIX_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\s*[\(\[](?:\d{4}\s+)?remaster(?:ed)?(?:\s+\d{4})?[\)\]]").unwrap(),
        Regex::new(r"(?i)\s*[-–—]\s*(?:\d{4}\s+)?remaster(?:ed)?(?:\s+\d{4})?\s*$").unwrap(),
        Regex::new(
            r"(?i)\s*[\(\[](?:deluxe|expanded|anniversary|special|collector'?s?)(?:\s+edition)?[\)\]]",
        )
        .unwrap(),
        Regex::new(r"(?i)\s*[\(\[](?:bonus\s+track(?:s)?(?:\s+version)?)[\)\]]").unwrap(),
    ]
});

/// Featuring credit inside brackets: "(feat. X)", "[ft. X]", "(with X)".
static FEAT_BRACKETED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*[\(\[](?:feat\.?|ft\.?|featuring|with)\s+([^\)\]]+)[\)\]]").unwrap()
});

/// Trailing featuring credit without brackets: "Song feat. X".
static FEAT_TRAILING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(?:feat\.?|ft\.?|featuring)\s+(.+)$").unwrap());

/// Separators between multiple featured artists.
static FEAT_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*(?:,|&|\band\b)\s*").unwrap());

/// Canonicalize a text fragment for identity comparison.
///
/// Lowercases, folds diacritics to ASCII, turns punctuation into
/// spaces and collapses whitespace. Edition/remaster suffixes are
/// stripped first when the config asks for it.
pub fn normalize_text(config: &NormalizerConfig, value: &str) -> String {
    let mut working = value.trim().to_string();

    if config.strip_edition_suffixes {
        for re in EDITION_SUFFIX_RES.iter() {
            working = re.replace_all(&working, "").to_string();
        }
    }

    // NFKD first so compatibility forms decompose before the ASCII fold
    let decomposed: String = working.nfkd().collect();
    let folded = any_ascii(&decomposed).to_lowercase();

    let spaced: String = folded
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();

    WHITESPACE_RE.replace_all(spaced.trim(), " ").to_string()
}

/// Normalize and join multiple text tokens, skipping empty ones.
pub fn normalize_tokens<'a, I>(config: &NormalizerConfig, tokens: I) -> String
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    tokens
        .into_iter()
        .flatten()
        .map(|t| normalize_text(config, t))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize a title, extracting featured-artist fragments into a
/// separate list instead of the main title.
pub fn normalize_title(config: &NormalizerConfig, raw: &str) -> NormalizedTitle {
    let mut featured_raw: Vec<String> = Vec::new();

    let mut working = raw.trim().to_string();
    working = FEAT_BRACKETED_RE
        .replace_all(&working, |caps: &regex::Captures<'_>| {
            featured_raw.push(caps[1].to_string());
            String::new()
        })
        .to_string();
    working = FEAT_TRAILING_RE
        .replace_all(&working, |caps: &regex::Captures<'_>| {
            featured_raw.push(caps[1].to_string());
            String::new()
        })
        .to_string();

    let featured = featured_raw
        .iter()
        .flat_map(|fragment| FEAT_SPLIT_RE.split(fragment))
        .map(|name| normalize_text(config, name))
        .filter(|name| !name.is_empty())
        .collect();

    NormalizedTitle {
        title: normalize_text(config, &working),
        featured,
    }
}

/// Bucket a duration for fingerprinting. Absent durations map to a
/// distinct bucket so they never collide with real ones.
pub fn duration_bucket(config: &NormalizerConfig, duration_secs: Option<i64>) -> String {
    match duration_secs {
        None => "na".to_string(),
        Some(secs) => {
            let bucket = config.duration_bucket_secs.max(1) as f64;
            let rounded = (secs as f64 / bucket).round() * bucket;
            format!("{}", rounded as i64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NormalizerConfig {
        NormalizerConfig::default()
    }

    #[test]
    fn lowercases_and_folds_diacritics() {
        let cfg = config();
        assert_eq!(normalize_text(&cfg, "Björk"), "bjork");
        assert_eq!(normalize_text(&cfg, "Café  Tacvba"), "cafe tacvba");
        assert_eq!(normalize_text(&cfg, "Sigur Rós"), "sigur ros");
    }

    #[test]
    fn punctuation_becomes_whitespace() {
        let cfg = config();
        assert_eq!(normalize_text(&cfg, "AC/DC"), "ac dc");
        assert_eq!(
            normalize_text(&cfg, "Don't Stop — Believin'"),
            "don t stop believin"
        );
    }

    #[test]
    fn same_identity_after_normalization() {
        let cfg = config();
        assert_eq!(
            normalize_text(&cfg, "  MASSIVE attack "),
            normalize_text(&cfg, "Massive Attack")
        );
    }

    #[test]
    fn edition_suffixes_stripped_when_configured() {
        let cfg = config();
        assert_eq!(
            normalize_text(&cfg, "Teardrop (Remastered 2011)"),
            "teardrop"
        );
        assert_eq!(normalize_text(&cfg, "Kid A - 2009 Remaster"), "kid a");
        assert_eq!(
            normalize_text(&cfg, "OK Computer [Deluxe Edition]"),
            "ok computer"
        );
    }

    #[test]
    fn edition_suffixes_kept_when_disabled() {
        let cfg = NormalizerConfig {
            strip_edition_suffixes: false,
            ..config()
        };
        assert_eq!(
            normalize_text(&cfg, "Teardrop (Remastered 2011)"),
            "teardrop remastered 2011"
        );
    }

    #[test]
    fn featured_artists_extracted_from_title() {
        let cfg = config();
        let result = normalize_title(&cfg, "Lose Yourself (feat. Dido & Eminem)");
        assert_eq!(result.title, "lose yourself");
        assert_eq!(result.featured, vec!["dido", "eminem"]);

        let trailing = normalize_title(&cfg, "Airbag ft. Someone");
        assert_eq!(trailing.title, "airbag");
        assert_eq!(trailing.featured, vec!["someone"]);
    }

    #[test]
    fn plain_title_has_no_featured() {
        let cfg = config();
        let result = normalize_title(&cfg, "Paranoid Android");
        assert_eq!(result.title, "paranoid android");
        assert!(result.featured.is_empty());
    }

    #[test]
    fn duration_buckets() {
        let cfg = config();
        assert_eq!(duration_bucket(&cfg, None), "na");
        // default bucket width is 2 seconds
        assert_eq!(duration_bucket(&cfg, Some(180)), "180");
        assert_eq!(duration_bucket(&cfg, Some(181)), "182");
        assert_eq!(duration_bucket(&cfg, Some(179)), "180");
    }

    #[test]
    fn normalize_tokens_skips_missing() {
        let cfg = config();
        let joined = normalize_tokens(&cfg, [Some("Massive Attack"), None, Some("Teardrop")]);
        assert_eq!(joined, "massive attack teardrop");
    }
}
