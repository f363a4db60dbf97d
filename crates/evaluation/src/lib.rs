pub mod backend;
pub mod config;
pub mod errors;
pub mod evaluator;
pub mod logging;
pub mod pipeline;
pub mod source;
pub mod state_machine;

// Re-export commonly used types for convenience
pub use backend::{InferenceBackend, RecordedBackend};
pub use config::EvalConfig;
pub use errors::PipelineError;
pub use evaluator::{Evaluator, SummaryEvaluator};
pub use pipeline::{EvaluationPipeline, ImageRecord, RunSummary};
pub use source::{DirectoryImageSource, Image, ImageSource};
pub use state_machine::PipelineState;
