//! Error types for the navigator crate.
//!
//! The public query surface (`Navigator::find_path` and friends) never
//! returns `Err` — failures there are modeled as `Status` or `Option` per
//! the façade's infallibility contract. `NavigatorError` covers the few
//! boundaries that are genuinely fallible: opening the persistent DB and
//! registering external collaborators.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NavigatorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistent DB error: {0}")]
    Db(String),

    #[error("invalid DB row: {0}")]
    Corrupt(String),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type NavResult<T> = Result<T, NavigatorError>;
