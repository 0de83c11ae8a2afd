//! Error taxonomy shared by the whole engine.
//!
//! Transient conditions (drive not idle yet, sectors not yet reported) are
//! never represented here; the polling convention handles them by retrying.
//! Everything in this enum is either user-actionable or terminal for the
//! active job.

use std::path::PathBuf;

use thiserror::Error;

pub type BurnResult<T> = Result<T, BurnError>;

#[derive(Debug, Error)]
pub enum BurnError {
    /// No chain of registered jobs connects the source track to the format
    /// the write backend requires.
    #[error("no job chain leads from {from} to {to}")]
    NoRoute { from: String, to: String },

    /// A locator is neither local nor covered by a staged ancestor.
    #[error("\"{0}\" is not local and nothing staged a local copy of it")]
    NotLocal(String),

    /// `start()` was called on a job that is already running.
    #[error("the job is already running")]
    AlreadyRunning,

    /// The drive could not be scanned and grabbed.
    #[error("the drive is busy")]
    DriveBusy,

    /// The write backend reported a FATAL or ABORT condition.
    #[error("the drive reported a fatal condition: {0}")]
    Backend(String),

    #[error("a directory could not be created ({path}): {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BurnError {
    /// True for user-initiated cancellation, which unwinds cleanly and is
    /// reported as an outcome rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BurnError::Cancelled)
    }
}
