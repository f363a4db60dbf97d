use crate::{DetectionError, Result};
use ndarray::{Array2, ArrayView2};

/// Upper bound on `dw`/`dh` before exponentiation, so a wild delta cannot
/// blow a box up to infinity.
pub const BBOX_XFORM_CLIP: f32 = 4.135_166_6; // ln(1000 / 16)

/// Apply per-class regression deltas to proposals.
///
/// `proposals` is `[R, 4]` (`x1, y1, x2, y2`), `deltas` is `[R, 4K]` with one
/// `(dx, dy, dw, dh)` block per class. Returns `[R, 4K]` boxes, one per
/// (proposal, class) pair. Degenerate proposals produce degenerate boxes.
pub fn decode_boxes(
    proposals: &ArrayView2<f32>,
    deltas: &ArrayView2<f32>,
) -> Result<Array2<f32>> {
    if proposals.ncols() != 4 {
        return Err(DetectionError::ShapeMismatch(format!(
            "proposals have {} columns, expected 4",
            proposals.ncols()
        )));
    }
    if deltas.nrows() != proposals.nrows() {
        return Err(DetectionError::ShapeMismatch(format!(
            "{} delta rows for {} proposals",
            deltas.nrows(),
            proposals.nrows()
        )));
    }
    if deltas.ncols() % 4 != 0 {
        return Err(DetectionError::ShapeMismatch(format!(
            "delta width {} is not a multiple of 4",
            deltas.ncols()
        )));
    }

    let mut decoded = Array2::<f32>::zeros(deltas.raw_dim());

    for (i, proposal) in proposals.outer_iter().enumerate() {
        let width = proposal[2] - proposal[0] + 1.0;
        let height = proposal[3] - proposal[1] + 1.0;
        let ctr_x = proposal[0] + 0.5 * width;
        let ctr_y = proposal[1] + 0.5 * height;

        for k in (0..deltas.ncols()).step_by(4) {
            let dx = deltas[[i, k]];
            let dy = deltas[[i, k + 1]];
            let dw = deltas[[i, k + 2]].min(BBOX_XFORM_CLIP);
            let dh = deltas[[i, k + 3]].min(BBOX_XFORM_CLIP);

            let pred_ctr_x = dx * width + ctr_x;
            let pred_ctr_y = dy * height + ctr_y;
            let pred_w = dw.exp() * width;
            let pred_h = dh.exp() * height;

            decoded[[i, k]] = pred_ctr_x - 0.5 * pred_w;
            decoded[[i, k + 1]] = pred_ctr_y - 0.5 * pred_h;
            decoded[[i, k + 2]] = pred_ctr_x + 0.5 * pred_w - 1.0;
            decoded[[i, k + 3]] = pred_ctr_y + 0.5 * pred_h - 1.0;
        }
    }

    Ok(decoded)
}

/// Clamp every box in a `[R, 4K]` array to `[0, width-1] x [0, height-1]`.
pub fn clip_boxes(boxes: &mut Array2<f32>, width: u32, height: u32) {
    let max_x = width as f32 - 1.0;
    let max_y = height as f32 - 1.0;

    for mut row in boxes.rows_mut() {
        for (j, v) in row.iter_mut().enumerate() {
            let max = if j % 2 == 0 { max_x } else { max_y };
            *v = v.min(max).max(0.0);
        }
    }
}

/// Repeat each `[R, 4]` proposal once per class, giving `[R, 4K]`.
/// Used when bounding-box regression is disabled.
pub fn tile_boxes(proposals: &ArrayView2<f32>, num_classes: usize) -> Result<Array2<f32>> {
    if proposals.ncols() != 4 {
        return Err(DetectionError::ShapeMismatch(format!(
            "proposals have {} columns, expected 4",
            proposals.ncols()
        )));
    }

    Ok(Array2::from_shape_fn(
        (proposals.nrows(), 4 * num_classes),
        |(i, j)| proposals[[i, j % 4]],
    ))
}
