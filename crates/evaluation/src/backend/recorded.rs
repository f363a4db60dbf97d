use super::InferenceBackend;
use crate::source::Image;
use anyhow::{Context, ensure};
use detection::RawOutput;
use ndarray::Array2;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Network output captured ahead of time, one JSON file per image.
#[derive(Debug, Deserialize)]
struct RecordedOutput {
    /// `[R][K]` class probabilities
    scores: Vec<Vec<f32>>,
    /// `[R]` proposals in network-input coordinates
    rois: Vec<[f32; 4]>,
    /// `[R][4K]` regression deltas
    #[serde(default)]
    deltas: Option<Vec<Vec<f32>>>,
    #[serde(default = "unit_scale")]
    image_scale: f32,
}

fn unit_scale() -> f32 {
    1.0
}

/// Replays raw outputs stored as `<dir>/<image id>.json`.
///
/// Lets the evaluation run end to end on machines without the model.
pub struct RecordedBackend {
    dir: PathBuf,
    num_classes: usize,
}

impl RecordedBackend {
    pub fn new(dir: impl Into<PathBuf>, num_classes: usize) -> Self {
        Self {
            dir: dir.into(),
            num_classes,
        }
    }

    pub fn output_path(&self, image_id: &str) -> PathBuf {
        self.dir.join(format!("{image_id}.json"))
    }

    fn load(&self, path: &Path) -> anyhow::Result<RawOutput> {
        let file = File::open(path)
            .with_context(|| format!("No recorded output at {}", path.display()))?;
        let recorded: RecordedOutput = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Malformed recorded output {}", path.display()))?;

        let num_regions = recorded.rois.len();
        let scores = rows_to_array(recorded.scores, num_regions, self.num_classes, "scores")?;
        let rois = Array2::from_shape_vec(
            (num_regions, 4),
            recorded.rois.into_iter().flatten().collect(),
        )?;
        let deltas = recorded
            .deltas
            .map(|d| rows_to_array(d, num_regions, 4 * self.num_classes, "deltas"))
            .transpose()?;

        Ok(RawOutput {
            scores,
            rois,
            deltas,
            image_scale: recorded.image_scale,
        })
    }
}

fn rows_to_array(
    rows: Vec<Vec<f32>>,
    expected_rows: usize,
    expected_cols: usize,
    name: &str,
) -> anyhow::Result<Array2<f32>> {
    ensure!(
        rows.len() == expected_rows,
        "{name} has {} rows, expected {expected_rows}",
        rows.len()
    );
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != expected_cols) {
        anyhow::bail!(
            "{name} row {i} has {} values, expected {expected_cols}",
            row.len()
        );
    }

    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((expected_rows, expected_cols), flat)?)
}

impl InferenceBackend for RecordedBackend {
    fn infer(&mut self, image: &Image) -> anyhow::Result<RawOutput> {
        let path = self.output_path(&image.id);
        let raw = self.load(&path)?;

        tracing::trace!(
            image = %image.id,
            regions = raw.num_regions(),
            "Recorded output loaded"
        );
        Ok(raw)
    }
}
