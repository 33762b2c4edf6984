//! Shared foundation for the quaver catalog engine
//!
//! Holds the workspace error type, engine configuration, database
//! initialization and the row models shared between the resolver and
//! the matcher.

pub mod config;
pub mod db;
pub mod error;

pub use error::{Error, Result};
