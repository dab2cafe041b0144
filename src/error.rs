//! Error types for the SLAM core.
//!
//! Failures fall into a few classes that callers must be able to tell apart:
//! configuration errors abort a session, insufficient-data failures are
//! reported per call, and bad frames are skipped without touching the map.
//! Losing track is not an error at all; it is reported through
//! [`TrackingState`](crate::tracking::TrackingState).

use thiserror::Error;

/// Errors produced by the SLAM core.
#[derive(Error, Debug)]
pub enum SlamError {
    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A descriptor of a different length than the map's was inserted.
    #[error("descriptor length mismatch: map uses {expected} bytes, got {found}")]
    DescriptorLengthMismatch { expected: usize, found: usize },

    /// Image resolution or intrinsics disagree with the calibration.
    #[error("calibration error: {0}")]
    Calibration(String),

    /// Corrupted or unusable frame data.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Too few correspondences survived matching or geometric verification.
    #[error("insufficient matches: {found} < {required}")]
    InsufficientMatches { found: usize, required: usize },

    /// Baseline between two views too small to triangulate reliably.
    #[error("insufficient parallax: {degrees:.2} deg")]
    InsufficientParallax { degrees: f64 },

    /// No landmark could be created from the given observations.
    #[error("triangulation failed: {0}")]
    TriangulationFailed(String),

    /// No place-recognition candidate passed geometric verification.
    #[error("no candidate keyframe passed geometric verification")]
    NoLoopClosure,

    /// A session finished without producing a single keyframe.
    #[error("session produced no keyframes")]
    NoKeyframes,

    /// Malformed relocalization query.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Relocalization against a map id that is not registered.
    #[error("unknown map: {0}")]
    UnknownMap(String),

    /// Persisted map bytes could not be decoded or are inconsistent.
    #[error("map format error: {0}")]
    MapFormat(String),

    /// The session's worker threads are no longer running.
    #[error("session closed")]
    SessionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SlamError {
    /// Configuration errors are not recoverable; everything else is scoped
    /// to a single call or frame.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SlamError::Config(_) | SlamError::DescriptorLengthMismatch { .. }
        )
    }

    /// Whether this is an "insufficient data" failure (the caller should
    /// reject the candidate rather than treat it as a fault).
    pub fn is_insufficient_data(&self) -> bool {
        matches!(
            self,
            SlamError::InsufficientMatches { .. }
                | SlamError::InsufficientParallax { .. }
                | SlamError::TriangulationFailed(_)
                | SlamError::NoLoopClosure
        )
    }
}

impl From<bincode::Error> for SlamError {
    fn from(e: bincode::Error) -> Self {
        SlamError::MapFormat(e.to_string())
    }
}

impl From<serde_json::Error> for SlamError {
    fn from(e: serde_json::Error) -> Self {
        SlamError::Config(e.to_string())
    }
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, SlamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SlamError::Config("x".into()).is_fatal());
        assert!(SlamError::DescriptorLengthMismatch { expected: 32, found: 64 }.is_fatal());
        assert!(!SlamError::NoLoopClosure.is_fatal());
        assert!(!SlamError::InvalidFrame("bad".into()).is_fatal());
    }

    #[test]
    fn test_insufficient_data_classification() {
        assert!(SlamError::NoLoopClosure.is_insufficient_data());
        assert!(SlamError::InsufficientMatches { found: 3, required: 10 }.is_insufficient_data());
        assert!(!SlamError::NoKeyframes.is_insufficient_data());
    }

    #[test]
    fn test_display_messages() {
        let e = SlamError::DescriptorLengthMismatch { expected: 32, found: 64 };
        assert_eq!(e.to_string(), "descriptor length mismatch: map uses 32 bytes, got 64");
        let e = SlamError::InsufficientMatches { found: 4, required: 10 };
        assert_eq!(e.to_string(), "insufficient matches: 4 < 10");
    }
}
