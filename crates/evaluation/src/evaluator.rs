use anyhow::Context;
use detection::DetectionStore;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Consumes the finalized detections of a run, e.g. to compute mAP.
pub trait Evaluator {
    fn evaluate(&mut self, store: &DetectionStore, output_dir: &Path) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassSummary {
    pub class_id: usize,
    pub detections: usize,
    pub images_with_detections: usize,
    pub mean_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatistics {
    pub num_images: usize,
    pub total_detections: usize,
    pub classes: Vec<ClassSummary>,
}

impl RunStatistics {
    pub fn from_store(store: &DetectionStore) -> Self {
        let classes = store
            .all()
            .enumerate()
            .skip(1)
            .map(|(class_id, slots)| {
                let detections: usize = slots.iter().map(Vec::len).sum();
                let score_sum: f32 = slots.iter().flatten().map(|d| d.score).sum();
                ClassSummary {
                    class_id,
                    detections,
                    images_with_detections: slots.iter().filter(|s| !s.is_empty()).count(),
                    mean_score: if detections > 0 {
                        score_sum / detections as f32
                    } else {
                        0.0
                    },
                }
            })
            .collect();

        Self {
            num_images: store.num_images(),
            total_detections: store.total_detections(),
            classes,
        }
    }
}

/// Writes per-class detection statistics to `summary.json`.
///
/// Stands in for a dataset-specific metric when none is plugged in.
#[derive(Debug, Default)]
pub struct SummaryEvaluator {
    last: Option<RunStatistics>,
}

impl SummaryEvaluator {
    pub fn last(&self) -> Option<&RunStatistics> {
        self.last.as_ref()
    }
}

impl Evaluator for SummaryEvaluator {
    fn evaluate(&mut self, store: &DetectionStore, output_dir: &Path) -> anyhow::Result<()> {
        let stats = RunStatistics::from_store(store);

        for class in stats.classes.iter().filter(|c| c.detections > 0) {
            tracing::debug!(
                class_id = class.class_id,
                detections = class.detections,
                mean_score = class.mean_score,
                "Class summary"
            );
        }

        let path = output_dir.join("summary.json");
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &stats)?;
        writer.flush()?;

        tracing::info!(
            path = %path.display(),
            total_detections = stats.total_detections,
            "Evaluation summary written"
        );

        self.last = Some(stats);
        Ok(())
    }
}
