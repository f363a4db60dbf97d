use ndarray::Array2;

/// Axis-aligned box in image pixels. Corners are inclusive, so `[0, 0, 9, 9]`
/// covers a 10x10 patch.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1 + 1.0
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1 + 1.0
    }

    /// Area with negative extents clamped to zero.
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// A single scored detection for one class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub class_id: usize,
}

impl Detection {
    pub fn new(bbox: BoundingBox, score: f32, class_id: usize) -> Self {
        Self {
            bbox,
            score,
            class_id,
        }
    }

    /// `(x1, y1, x2, y2, score)` row as stored in the detections artifact.
    pub fn to_row(&self) -> [f32; 5] {
        let [x1, y1, x2, y2] = self.bbox.to_array();
        [x1, y1, x2, y2, self.score]
    }

    pub fn from_row(row: [f32; 5], class_id: usize) -> Self {
        Self::new(BoundingBox::new(row[0], row[1], row[2], row[3]), row[4], class_id)
    }
}

/// Raw network output for one image, as produced by an inference backend.
#[derive(Debug, Clone)]
pub struct RawOutput {
    /// `[R, K]` class probabilities, column 0 is background.
    pub scores: Array2<f32>,
    /// `[R, 4]` proposals in network-input coordinates.
    pub rois: Array2<f32>,
    /// `[R, 4K]` per-class regression deltas `(dx, dy, dw, dh)`.
    pub deltas: Option<Array2<f32>>,
    /// Network-input size divided by original image size.
    pub image_scale: f32,
}

impl RawOutput {
    pub fn num_regions(&self) -> usize {
        self.scores.nrows()
    }

    pub fn num_classes(&self) -> usize {
        self.scores.ncols()
    }
}
