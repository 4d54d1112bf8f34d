//! Error type for the few inputs the engine refuses outright.
//!
//! Almost everything is clamped rather than rejected: a malformed tuning knob must never
//! fail a live selection request. What remains here is structural (no candidates, a
//! broken stage ladder) or configuration loading.

use thiserror::Error;

/// Errors returned by `coachgate`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The selector was called with no candidates at all.
    #[error("hybrid selector requires at least one candidate")]
    EmptyCandidates,

    /// A stage ladder names a threshold stage that is not in its stage list.
    #[error("stage {stage:?} is not part of the stage ladder")]
    UnknownStage {
        /// The stage that could not be found.
        stage: String,
    },

    /// A configuration document was structurally valid but semantically unusable.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// A configuration document could not be parsed.
    #[cfg(feature = "serde")]
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
