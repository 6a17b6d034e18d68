use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport Error, no response received: {0}")]
    Transport(String),
    #[error("Request failed with status {0}")]
    HttpStatus(StatusCode),
    #[error("Rate limited by the remote API")]
    RateLimited,
    #[error("Malformed response for {operation}: {reason}")]
    MalformedResponse { operation: String, reason: String },
    #[error("Gave up on {operation} after {attempts} attempts")]
    RequestExhausted { operation: String, attempts: u32 },

    #[error("Upload time for comic {comic_id} chapter {chapter_id} is already stored")]
    DuplicateKey { comic_id: i64, chapter_id: i64 },
    #[error("Store Error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("Store lock was poisoned by a panicking writer")]
    StorePoisoned,

    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Tokio Join Error, couldn't await a task! {0}")]
    RuntimeJoin(#[from] tokio::task::JoinError),
    #[error("Worker pool was closed while tasks were pending")]
    WorkerPoolClosed,
}

impl From<tokio::sync::AcquireError> for Error {
    fn from(_value: tokio::sync::AcquireError) -> Self {
        Error::WorkerPoolClosed
    }
}

