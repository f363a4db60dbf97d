use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid image scale: {0}")]
    InvalidScale(f32),

    #[error("Non-finite value in {0}")]
    NonFinite(&'static str),

    #[error("Slot out of range: class {class_id}, image {image_index}")]
    SlotOutOfRange { class_id: usize, image_index: usize },

    #[error("Slot already recorded: class {class_id}, image {image_index}")]
    SlotAlreadyRecorded { class_id: usize, image_index: usize },

    #[error("Background class cannot hold detections")]
    BackgroundClass,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported artifact format {format:?} version {version}")]
    UnsupportedFormat { format: String, version: u32 },

    #[error("Corrupt artifact: {0}")]
    Corrupt(String),
}
