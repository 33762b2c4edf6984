//! Catalog resolution and listen matching
//!
//! Maintains a normalized catalog of artists, releases and tracks fed
//! by a filesystem scan, and resolves incoming scrobble listens to
//! canonical tracks with a confidence score.
//!
//! The engine is a library: an external job runner drives it through
//! the entrypoints in [`jobs`], supplying a cancellation token and a
//! progress callback. It never owns thread or process lifecycle.

pub mod enrich;
pub mod jobs;
pub mod matcher;
pub mod normalize;
pub mod pipeline;
pub mod resolver;
pub mod scanner;
pub mod summary;
pub mod uid;

pub use quaver_common::{Error, Result};
