use crate::types::{BoundingBox, Detection};

/// Intersection over union of two pixel-inclusive boxes.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1) + 1.0).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1) + 1.0).max(0.0);
    let intersection = inter_w * inter_h;

    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }

    intersection / union
}

/// Greedy non-maximum suppression over one class of one image.
///
/// Returns the indices of the kept boxes, highest score first. Equal scores
/// keep their input order. A candidate is dropped when its IoU with an
/// already kept box is strictly greater than `iou_threshold`.
pub fn suppress(boxes: &[BoundingBox], scores: &[f32], iou_threshold: f32) -> Vec<usize> {
    debug_assert_eq!(boxes.len(), scores.len());
    let n = boxes.len().min(scores.len());

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; n];

    for (pos, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);

        for &j in &order[pos + 1..] {
            if !suppressed[j] && iou(&boxes[i], &boxes[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Run [`suppress`] over owned detections and return the survivors in
/// descending score order.
pub fn suppress_detections(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.len() < 2 {
        return detections;
    }

    let boxes: Vec<BoundingBox> = detections.iter().map(|d| d.bbox).collect();
    let scores: Vec<f32> = detections.iter().map(|d| d.score).collect();

    suppress(&boxes, &scores, iou_threshold)
        .into_iter()
        .map(|i| detections[i])
        .collect()
}
