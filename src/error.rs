use std::io;

use thiserror::Error;

/// Errors reported by this crate.
///
/// Only conditions that fail a call synchronously are represented here.  A
/// child process exiting with a non-zero status is *not* an error of the
/// parent: it is reported through [`Stage::status`], [`Stage::rc`],
/// [`Stage::ok`] and [`Stage::error`].  Likewise, a child whose pid was
/// reaped behind our back is reported by [`Status::Lost`], not by an `Err`.
///
/// [`Stage::status`]: crate::Stage::status
/// [`Stage::rc`]: crate::Stage::rc
/// [`Stage::ok`]: crate::Stage::ok
/// [`Stage::error`]: crate::Stage::error
/// [`Status::Lost`]: crate::Status::Lost
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A stage or fitting was configured inconsistently: an orientation
    /// conflict on a fitting, a link to the wrong kind of stage, a NUL byte
    /// in a would-be argv entry, or an operation that the stage's kind does
    /// not support.
    #[error("configuration: {0}")]
    Config(String),

    /// `unquote` was given input that matches none of its alternatives,
    /// such as an unterminated quote or a trailing backslash.
    #[error("cannot parse word list at byte {pos}: {reason}")]
    Parse {
        /// Byte offset of the offending position in the input.
        pos: usize,
        /// What was expected there.
        reason: &'static str,
    },

    /// An operating-system resource could not be acquired: fork, pipe, or
    /// file open failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Error {
        Error::Config(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
