use crate::state_machine::{PipelineEvent, PipelineState};
use detection::DetectionError;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal conditions of an evaluation run. Any of them stops the run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to load image {index}: {source:#}")]
    ImageLoadFailure {
        index: usize,
        source: anyhow::Error,
    },

    #[error("Inference failed on image {index}: {source:#}")]
    InferenceFailure {
        index: usize,
        source: anyhow::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    SerializationFailure {
        path: PathBuf,
        source: DetectionError,
    },

    #[error("Evaluation failed: {0:#}")]
    EvaluationFailure(anyhow::Error),

    #[error("Cannot handle {event:?} while {state:?}")]
    InvalidState {
        state: PipelineState,
        event: PipelineEvent,
    },

    #[error("Detection store error: {0}")]
    Store(#[from] DetectionError),
}

impl PipelineError {
    /// Serialization failures leave a complete store behind that can be
    /// written again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::SerializationFailure { .. } | PipelineError::EvaluationFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display_formatting() {
        let err = PipelineError::ImageLoadFailure {
            index: 4,
            source: anyhow::anyhow!("no such file"),
        };
        assert_eq!(err.to_string(), "Failed to load image 4: no such file");

        let err = PipelineError::InferenceFailure {
            index: 0,
            source: anyhow::anyhow!("bad shape").context("recorded output"),
        };
        assert_eq!(
            err.to_string(),
            "Inference failed on image 0: recorded output: bad shape"
        );

        let err = PipelineError::SerializationFailure {
            path: PathBuf::from("/out/detections.json"),
            source: DetectionError::Io(io::Error::other("disk full")),
        };
        assert_eq!(
            err.to_string(),
            "Failed to write /out/detections.json: IO error: disk full"
        );

        let err = PipelineError::InvalidState {
            state: PipelineState::Done,
            event: PipelineEvent::Start,
        };
        assert_eq!(err.to_string(), "Cannot handle Start while Done");
    }

    #[test]
    fn test_retryable_errors() {
        let serialization = PipelineError::SerializationFailure {
            path: PathBuf::from("x"),
            source: DetectionError::Corrupt("x".to_string()),
        };
        assert!(serialization.is_retryable());

        let load = PipelineError::ImageLoadFailure {
            index: 0,
            source: anyhow::anyhow!("x"),
        };
        assert!(!load.is_retryable());
    }

    #[test]
    fn test_store_errors_convert() {
        fn record() -> Result<(), PipelineError> {
            Err(DetectionError::BackgroundClass)?;
            Ok(())
        }
        assert!(matches!(
            record().unwrap_err(),
            PipelineError::Store(DetectionError::BackgroundClass)
        ));
    }
}
