use thiserror::Error;

/// Errors surfaced by the media plumbing layer.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("not found")]
    NotFound,

    #[error("stream already exists")]
    AlreadyExists,

    #[error("session ended")]
    SessionEnded,

    #[error("end of stream")]
    Eof,

    #[error("canceled")]
    Canceled,

    #[error("deadline exceeded")]
    Timeout,

    #[error("envelope decode error: {0}")]
    EnvelopeDecode(String),

    #[error("overlay send error")]
    OverlaySend,

    #[error("segmenter error: {0}")]
    Segmenter(String),
}
