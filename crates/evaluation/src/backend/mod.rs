use crate::source::Image;
use detection::RawOutput;

pub mod recorded;

pub use recorded::RecordedBackend;

/// Runs the detection network on one image.
///
/// This is the only contact point with the model: post-processing sees
/// nothing but the returned scores, proposals and deltas.
pub trait InferenceBackend {
    fn infer(&mut self, image: &Image) -> anyhow::Result<RawOutput>;
}
