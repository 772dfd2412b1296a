use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("master manifest lists no variants")]
    NoVariants,
    #[error("media manifest lists no segments")]
    NoSegments,
    #[error("{count} segment(s) missing (ordinals {ordinals:?}): {last_error}")]
    SegmentsMissing {
        count: usize,
        ordinals: Vec<usize>,
        last_error: String,
    },
    #[error("transcode failed with exit code {exit_code:?}: {stderr_tail}")]
    TranscodeFailed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },
    #[error("transcode exceeded the overall timeout of {0}s")]
    TranscodeTimeout(u64),
    #[error("transcode produced no progress for {0}s")]
    TranscodeStalled(u64),
    #[error("output invalid: {0}")]
    OutputInvalid(String),
    #[error("external tool error: {0}")]
    Tool(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("cancelled")]
    Cancelled,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }

    /// Kind reported to `on_error`. Cancellation is not an error and has none.
    pub fn kind(&self) -> Option<ErrorKind> {
        let kind = match self {
            CoreError::Fetch(_) => ErrorKind::Fetch,
            CoreError::InvalidManifest(_) => ErrorKind::InvalidManifest,
            CoreError::NoVariants => ErrorKind::NoVariants,
            CoreError::NoSegments => ErrorKind::NoSegments,
            CoreError::SegmentsMissing { .. } => ErrorKind::SegmentsMissing,
            CoreError::TranscodeFailed { .. } => ErrorKind::TranscodeFailed,
            CoreError::TranscodeTimeout(_) => ErrorKind::TranscodeTimeout,
            CoreError::TranscodeStalled(_) => ErrorKind::TranscodeStalled,
            CoreError::OutputInvalid(_) => ErrorKind::OutputInvalid,
            CoreError::Tool(_) => ErrorKind::Tool,
            CoreError::InvalidState(_) | CoreError::Io(_) => ErrorKind::Internal,
            CoreError::Cancelled => return None,
        };
        Some(kind)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    Fetch,
    InvalidManifest,
    NoVariants,
    NoSegments,
    SegmentsMissing,
    TranscodeFailed,
    TranscodeTimeout,
    TranscodeStalled,
    OutputInvalid,
    Tool,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Fetch => "fetch",
            ErrorKind::InvalidManifest => "invalid_manifest",
            ErrorKind::NoVariants => "no_variants",
            ErrorKind::NoSegments => "no_segments",
            ErrorKind::SegmentsMissing => "segments_missing",
            ErrorKind::TranscodeFailed => "transcode_failed",
            ErrorKind::TranscodeTimeout => "transcode_timeout",
            ErrorKind::TranscodeStalled => "transcode_stalled",
            ErrorKind::OutputInvalid => "output_invalid",
            ErrorKind::Tool => "tool",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_has_no_error_kind() {
        assert!(CoreError::Cancelled.kind().is_none());
        assert!(CoreError::Cancelled.is_cancelled());
    }

    #[test]
    fn segments_missing_message_names_ordinals() {
        let err = CoreError::SegmentsMissing {
            count: 1,
            ordinals: vec![1],
            last_error: "status 500".to_string(),
        };
        assert_eq!(err.kind(), Some(ErrorKind::SegmentsMissing));
        let text = err.to_string();
        assert!(text.contains("[1]"));
        assert!(text.contains("status 500"));
    }
}
