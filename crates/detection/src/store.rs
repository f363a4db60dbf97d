use crate::types::Detection;
use crate::{DetectionError, Result};

/// Run-wide detections, one slot per `(class_id, image_index)`.
///
/// Slots live in a flat class-major table sized once at construction, so the
/// detections of one class over all images are contiguous. Class 0 is the
/// background and always stays empty. Each slot can be recorded once.
#[derive(Debug, Clone)]
pub struct DetectionStore {
    num_classes: usize,
    num_images: usize,
    slots: Vec<Vec<Detection>>,
    recorded: Vec<bool>,
}

impl DetectionStore {
    pub fn new(num_classes: usize, num_images: usize) -> Self {
        let len = num_classes * num_images;
        Self {
            num_classes,
            num_images,
            slots: vec![Vec::new(); len],
            recorded: vec![false; len],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_images(&self) -> usize {
        self.num_images
    }

    fn index(&self, class_id: usize, image_index: usize) -> Result<usize> {
        if class_id >= self.num_classes || image_index >= self.num_images {
            return Err(DetectionError::SlotOutOfRange {
                class_id,
                image_index,
            });
        }
        Ok(class_id * self.num_images + image_index)
    }

    /// Store the final detections of one class for one image.
    pub fn record(
        &mut self,
        class_id: usize,
        image_index: usize,
        detections: Vec<Detection>,
    ) -> Result<()> {
        let idx = self.index(class_id, image_index)?;
        if class_id == 0 && !detections.is_empty() {
            return Err(DetectionError::BackgroundClass);
        }
        if self.recorded[idx] {
            return Err(DetectionError::SlotAlreadyRecorded {
                class_id,
                image_index,
            });
        }

        self.slots[idx] = detections;
        self.recorded[idx] = true;
        Ok(())
    }

    pub fn is_recorded(&self, class_id: usize, image_index: usize) -> bool {
        self.index(class_id, image_index)
            .map(|idx| self.recorded[idx])
            .unwrap_or(false)
    }

    /// Detections of one slot; out-of-range slots read as empty.
    pub fn get(&self, class_id: usize, image_index: usize) -> &[Detection] {
        match self.index(class_id, image_index) {
            Ok(idx) => &self.slots[idx],
            Err(_) => &[],
        }
    }

    /// All image slots of one class, indexed by image.
    pub fn class_slots(&self, class_id: usize) -> &[Vec<Detection>] {
        if class_id >= self.num_classes {
            return &[];
        }
        let start = class_id * self.num_images;
        &self.slots[start..start + self.num_images]
    }

    /// Class-major view over the whole table.
    pub fn all(&self) -> impl Iterator<Item = &[Vec<Detection>]> + '_ {
        (0..self.num_classes).map(move |class_id| self.class_slots(class_id))
    }

    pub fn image_detection_count(&self, image_index: usize) -> usize {
        (0..self.num_classes)
            .map(|class_id| self.get(class_id, image_index).len())
            .sum()
    }

    pub fn total_detections(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    /// Rebuild a store from class-major slots, marking every slot recorded.
    pub(crate) fn from_slots(
        num_classes: usize,
        num_images: usize,
        slots: Vec<Vec<Detection>>,
    ) -> Result<Self> {
        if slots.len() != num_classes * num_images {
            return Err(DetectionError::Corrupt(format!(
                "{} slots for {num_classes} classes x {num_images} images",
                slots.len()
            )));
        }
        if slots.iter().take(num_images).any(|s| !s.is_empty()) {
            return Err(DetectionError::BackgroundClass);
        }
        let recorded = vec![true; slots.len()];
        Ok(Self {
            num_classes,
            num_images,
            slots,
            recorded,
        })
    }
}

/// Two stores are equal when they hold the same detections; recording
/// bookkeeping is not compared.
impl PartialEq for DetectionStore {
    fn eq(&self, other: &Self) -> bool {
        self.num_classes == other.num_classes
            && self.num_images == other.num_images
            && self.slots == other.slots
    }
}
