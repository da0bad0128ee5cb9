//! Error taxonomy of the content pipeline.
//!
//! Validation failures are caught before any external call and are never
//! retried. Transport failures (including partial blob upload failures)
//! leave the draft untouched so the author can retry. Patch drift is not an
//! error at all: it is reported through `clean` flags on the results of
//! [`crate::patch::apply`] and [`crate::history::reconstruct`].

use thiserror::Error;

use crate::content_id::ContentId;

/// A draft that must not be submitted as-is.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("text is {len} characters long, the limit is {max}")]
    TextTooLong { len: usize, max: usize },

    #[error("text references /blob/{0} but no such blob is attached")]
    StaleBlobReference(String),

    #[error("blob {id} is {len} bytes, the limit is {max}")]
    BlobTooLarge { id: ContentId, len: usize, max: usize },

    #[error("attachment is not a readable image: {0}")]
    UnreadableImage(String),

    #[error("a poll needs at least two options")]
    InvalidPoll,
}

/// Why a publish attempt ended in the `Failed` state.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{stage} failed: {cause:#}")]
    Transport {
        stage: &'static str,
        cause: anyhow::Error,
    },

    #[error("{} of {total} blob uploads failed (first error: {cause:#})", .failed.len())]
    PartialBlobFailure {
        failed: Vec<ContentId>,
        total: usize,
        cause: anyhow::Error,
    },
}

impl PublishError {
    pub(crate) fn transport(stage: &'static str, cause: anyhow::Error) -> Self {
        PublishError::Transport { stage, cause }
    }

    /// Whether the same draft may be submitted again unchanged.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PublishError::Validation(_))
    }
}

/// Failure to decode or re-encode an image.
#[derive(Debug, Error)]
pub enum ImageFitError {
    #[error("image codec error: {0}")]
    Codec(#[from] image::ImageError),

    #[error("image has zero width or height")]
    Empty,

    #[error("maximum size must be greater than zero")]
    ZeroBudget,
}
