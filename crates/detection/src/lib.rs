//! Detection post-processing: box decoding, per-class non-maximum
//! suppression, per-image capping and the run-wide detection store.

pub mod cap;
pub mod decode;
pub mod errors;
pub mod nms;
pub mod postprocessing;
pub mod serialization;
pub mod store;
pub mod types;

pub use cap::cap_detections;
pub use decode::{clip_boxes, decode_boxes, tile_boxes};
pub use errors::DetectionError;
pub use nms::{iou, suppress, suppress_detections};
pub use postprocessing::{PostProcessConfig, PostProcessor};
pub use serialization::{load_detections, save_detections};
pub use store::DetectionStore;
pub use types::{BoundingBox, Detection, RawOutput};

pub type Result<T, E = DetectionError> = std::result::Result<T, E>;
