use crate::store::DetectionStore;
use crate::types::Detection;
use crate::{DetectionError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const ARTIFACT_FORMAT: &str = "detections";
pub const ARTIFACT_VERSION: u32 = 1;

/// On-disk layout: `boxes[class][image]` is a list of
/// `[x1, y1, x2, y2, score]` rows.
#[derive(Serialize, Deserialize)]
struct DetectionsArtifact {
    format: String,
    version: u32,
    num_classes: usize,
    num_images: usize,
    boxes: Vec<Vec<Vec<[f32; 5]>>>,
}

impl TryFrom<&DetectionStore> for DetectionsArtifact {
    type Error = DetectionError;

    /// JSON has no encoding for infinities or NaN, so such rows are refused
    /// rather than written as `null`.
    fn try_from(store: &DetectionStore) -> Result<Self> {
        let mut boxes = Vec::with_capacity(store.num_classes());
        for (class_id, class) in store.all().enumerate() {
            let mut images = Vec::with_capacity(class.len());
            for (image_index, slot) in class.iter().enumerate() {
                let rows: Vec<[f32; 5]> = slot.iter().map(Detection::to_row).collect();
                if rows.iter().flatten().any(|v| !v.is_finite()) {
                    return Err(DetectionError::Corrupt(format!(
                        "non-finite detection for class {class_id}, image {image_index}"
                    )));
                }
                images.push(rows);
            }
            boxes.push(images);
        }

        Ok(Self {
            format: ARTIFACT_FORMAT.to_string(),
            version: ARTIFACT_VERSION,
            num_classes: store.num_classes(),
            num_images: store.num_images(),
            boxes,
        })
    }
}

impl TryFrom<DetectionsArtifact> for DetectionStore {
    type Error = DetectionError;

    fn try_from(artifact: DetectionsArtifact) -> Result<Self> {
        if artifact.format != ARTIFACT_FORMAT || artifact.version != ARTIFACT_VERSION {
            return Err(DetectionError::UnsupportedFormat {
                format: artifact.format,
                version: artifact.version,
            });
        }
        if artifact.boxes.len() != artifact.num_classes {
            return Err(DetectionError::Corrupt(format!(
                "header says {} classes, found {}",
                artifact.num_classes,
                artifact.boxes.len()
            )));
        }

        let mut slots = Vec::with_capacity(artifact.num_classes * artifact.num_images);
        for (class_id, class) in artifact.boxes.into_iter().enumerate() {
            if class.len() != artifact.num_images {
                return Err(DetectionError::Corrupt(format!(
                    "class {class_id} has {} images, expected {}",
                    class.len(),
                    artifact.num_images
                )));
            }
            slots.extend(class.into_iter().map(|rows| {
                rows.into_iter()
                    .map(|row| Detection::from_row(row, class_id))
                    .collect::<Vec<_>>()
            }));
        }

        DetectionStore::from_slots(artifact.num_classes, artifact.num_images, slots)
    }
}

pub fn to_writer<W: Write>(store: &DetectionStore, writer: W) -> Result<()> {
    let artifact = DetectionsArtifact::try_from(store)?;
    serde_json::to_writer(writer, &artifact)?;
    Ok(())
}

pub fn from_reader<R: Read>(reader: R) -> Result<DetectionStore> {
    let artifact: DetectionsArtifact = serde_json::from_reader(reader)?;
    artifact.try_into()
}

/// Write the store to `path`, replacing any previous artifact.
///
/// The data goes to a sibling temp file first and is renamed into place, so
/// a failed write never leaves a truncated artifact behind. The temp file is
/// removed again on failure.
pub fn save_detections(store: &DetectionStore, path: &Path) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");

    let written = write_file(store, &tmp_path)
        .and_then(|()| fs::rename(&tmp_path, path).map_err(Into::into));
    if let Err(e) = written {
        if tmp_path.exists() {
            let _ = fs::remove_file(&tmp_path);
        }
        return Err(e);
    }

    tracing::debug!(
        path = %path.display(),
        detections = store.total_detections(),
        "Detections saved"
    );
    Ok(())
}

fn write_file(store: &DetectionStore, path: &Path) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    to_writer(store, &mut writer)?;
    writer.flush()?;
    Ok(())
}

pub fn load_detections(path: &Path) -> Result<DetectionStore> {
    from_reader(BufReader::new(File::open(path)?))
}
