//! Core error type

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Directory not available: {0}")]
    MissingDir(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
