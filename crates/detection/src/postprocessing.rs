use crate::cap::cap_detections;
use crate::decode::{clip_boxes, decode_boxes, tile_boxes};
use crate::nms::suppress_detections;
use crate::types::{BoundingBox, Detection, RawOutput};
use crate::{DetectionError, Result};
use ndarray::Array2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostProcessConfig {
    /// Candidates must score strictly above this to reach suppression.
    pub confidence_threshold: f32,
    /// IoU above which a lower-scoring box of the same class is dropped.
    pub nms_threshold: f32,
    /// Detections kept per image over all classes; `<= 0` disables the cap.
    pub max_per_image: i64,
    /// Apply regression deltas; otherwise proposals are reused per class.
    pub bbox_regression: bool,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.05,
            nms_threshold: 0.3,
            max_per_image: 100,
            bbox_regression: true,
        }
    }
}

/// Turns raw network output for one image into final per-class detections.
pub struct PostProcessor {
    config: PostProcessConfig,
}

impl PostProcessor {
    pub fn new(config: PostProcessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PostProcessConfig {
        &self.config
    }

    /// Decode, threshold, suppress and cap the detections of one image.
    ///
    /// The result holds one list per class including the background, which
    /// is always empty. Lists are ordered by descending score.
    #[tracing::instrument(skip(self, raw), fields(regions = raw.num_regions()))]
    pub fn process(&self, raw: &RawOutput, width: u32, height: u32) -> Result<Vec<Vec<Detection>>> {
        let boxes = self.image_boxes(raw, width, height)?;
        let num_classes = raw.num_classes();

        let mut per_class: Vec<Vec<Detection>> = vec![Vec::new(); num_classes];

        // Column 0 is the background
        for (class_id, slot) in per_class.iter_mut().enumerate().skip(1) {
            let offset = 4 * class_id;
            let candidates: Vec<Detection> = raw
                .scores
                .column(class_id)
                .iter()
                .enumerate()
                .filter(|&(_, &score)| score > self.config.confidence_threshold)
                .map(|(i, &score)| {
                    let bbox = BoundingBox::new(
                        boxes[[i, offset]],
                        boxes[[i, offset + 1]],
                        boxes[[i, offset + 2]],
                        boxes[[i, offset + 3]],
                    );
                    Detection::new(bbox, score, class_id)
                })
                .collect();

            let candidate_count = candidates.len();
            *slot = suppress_detections(candidates, self.config.nms_threshold);

            if candidate_count > 0 {
                tracing::trace!(
                    class_id,
                    candidates = candidate_count,
                    kept = slot.len(),
                    "Class suppressed"
                );
            }
        }

        let removed = cap_detections(&mut per_class, self.config.max_per_image);
        if removed > 0 {
            tracing::trace!(removed, "Per-image cap applied");
        }

        Ok(per_class)
    }

    /// `[R, 4K]` image-space boxes for every (region, class) pair.
    fn image_boxes(&self, raw: &RawOutput, width: u32, height: u32) -> Result<Array2<f32>> {
        let num_regions = raw.num_regions();
        let num_classes = raw.num_classes();

        if num_classes == 0 {
            return Err(DetectionError::ShapeMismatch(
                "scores have no class columns".to_string(),
            ));
        }
        if raw.rois.dim() != (num_regions, 4) {
            return Err(DetectionError::ShapeMismatch(format!(
                "rois are {:?}, expected ({num_regions}, 4)",
                raw.rois.dim()
            )));
        }
        if !raw.image_scale.is_finite() || raw.image_scale <= 0.0 {
            return Err(DetectionError::InvalidScale(raw.image_scale));
        }
        ensure_finite(&raw.scores, "scores")?;
        ensure_finite(&raw.rois, "rois")?;

        // Proposals come back in network-input coordinates
        let proposals = &raw.rois / raw.image_scale;

        if !self.config.bbox_regression {
            let boxes = tile_boxes(&proposals.view(), num_classes)?;
            ensure_finite(&boxes, "image boxes")?;
            return Ok(boxes);
        }

        let deltas = raw.deltas.as_ref().ok_or_else(|| {
            DetectionError::ShapeMismatch(
                "box regression is enabled but the output has no deltas".to_string(),
            )
        })?;
        if deltas.dim() != (num_regions, 4 * num_classes) {
            return Err(DetectionError::ShapeMismatch(format!(
                "deltas are {:?}, expected ({num_regions}, {})",
                deltas.dim(),
                4 * num_classes
            )));
        }

        ensure_finite(deltas, "deltas")?;

        let mut boxes = decode_boxes(&proposals.view(), &deltas.view())?;
        clip_boxes(&mut boxes, width, height);
        ensure_finite(&boxes, "image boxes")?;
        Ok(boxes)
    }
}

/// Infinite coordinates or scores cannot be written to the artifact.
fn ensure_finite(values: &Array2<f32>, what: &'static str) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(DetectionError::NonFinite(what))
    }
}
