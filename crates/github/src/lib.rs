/// Typed GitHub REST client for repositories, commits and Actions runs
use chrono::{DateTime, Utc};
use thiserror::Error;

mod client;
pub use client::*;

mod models;
pub use models::*;

mod metrics;
pub use metrics::*;

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GitHub returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("rate limited (reset at {reset_at:?})")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("could not decode response: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for GitHubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GitHubError>;
