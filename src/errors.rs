//! Error types for the extraction pipeline.
//!
//! Command-line glue uses [`anyhow`] like everything else, but the pipeline
//! stages report one of the specific failure kinds below, so that callers can
//! tell a bad upload apart from a missing OCR engine or a full disk.

use std::fmt;

use schemars::JsonSchema;
use thiserror::Error;

use crate::prelude::*;

/// Something went wrong while processing a document.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The caller supplied something we refuse to process.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The bytes could not be decoded as an image.
    #[error("could not decode image: {0}")]
    DecodeFailure(String),

    /// The image decoded, but it can't be processed (for example, it's empty).
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A recognition or evaluation backend could not be initialized.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The recognition backend failed on a specific image.
    #[error("recognition failed: {0}")]
    RecognitionFailure(String),

    /// The grading service returned something we couldn't interpret.
    #[error("could not parse evaluation: {0}")]
    EvaluationParseFailure(String),

    /// We could not write an output file.
    #[error("could not write {path}: {source}")]
    OutputWriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Build an [`PipelineError::InvalidInput`] from anything printable.
    pub fn invalid_input(msg: impl fmt::Display) -> Self {
        Self::InvalidInput(msg.to_string())
    }

    /// Build a [`PipelineError::BackendUnavailable`] from anything printable.
    pub fn backend_unavailable(msg: impl fmt::Display) -> Self {
        Self::BackendUnavailable(msg.to_string())
    }
}

/// A value, plus any non-fatal problems we hit while producing it.
///
/// Stages that can degrade gracefully (spell checking, `.docx` output, OCR
/// failures) return one of these instead of logging and moving on, so that
/// the warnings end up in the job record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, JsonSchema)]
pub struct WithWarnings<T> {
    /// The value itself.
    pub value: T,

    /// Human-readable warnings.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl<T> WithWarnings<T> {
    /// Wrap a value with no warnings.
    pub fn ok(value: T) -> Self {
        Self {
            value,
            warnings: vec![],
        }
    }

    /// Wrap a value with a single warning, and log it.
    pub fn with_warning(value: T, warning: impl Into<String>) -> Self {
        let warning = warning.into();
        warn!("{warning}");
        Self {
            value,
            warnings: vec![warning],
        }
    }

    /// Move our warnings into `sink`, returning the bare value.
    pub fn into_value(self, sink: &mut Vec<String>) -> T {
        sink.extend(self.warnings);
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_value_collects_warnings() {
        let mut sink = vec!["earlier".to_owned()];
        let value = WithWarnings::with_warning(3, "spell check failed").into_value(&mut sink);
        assert_eq!(value, 3);
        assert_eq!(sink, vec!["earlier", "spell check failed"]);
    }

    #[test]
    fn error_messages_are_readable() {
        let err = PipelineError::invalid_input("file too large");
        assert_eq!(err.to_string(), "invalid input: file too large");
    }
}
