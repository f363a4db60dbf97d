use detection::{BoundingBox, DetectionStore, RawOutput, load_detections};
use evaluation::{
    DirectoryImageSource, EvalConfig, EvaluationPipeline, Evaluator, Image, ImageSource,
    InferenceBackend, PipelineError, PipelineState, RecordedBackend, SummaryEvaluator,
};
use image::{Rgb, RgbImage};
use ndarray::{Array2, array};
use std::path::{Path, PathBuf};
use tempfile::tempdir;

struct FixedBackend(RawOutput);

impl InferenceBackend for FixedBackend {
    fn infer(&mut self, _image: &Image) -> anyhow::Result<RawOutput> {
        Ok(self.0.clone())
    }
}

/// Synthetic images; loading `broken` fails.
struct SyntheticImages {
    count: usize,
    broken: Option<usize>,
}

impl SyntheticImages {
    fn new(count: usize) -> Self {
        Self {
            count,
            broken: None,
        }
    }
}

impl ImageSource for SyntheticImages {
    fn count(&self) -> usize {
        self.count
    }

    fn image_at(&mut self, index: usize) -> anyhow::Result<Image> {
        if self.broken == Some(index) {
            anyhow::bail!("corrupt file for image {index}");
        }
        Ok(Image {
            id: format!("{index:06}"),
            width: 64,
            height: 48,
            pixels: vec![0; 64 * 48 * 3],
        })
    }
}

#[derive(Default)]
struct CountingEvaluator {
    calls: usize,
    fail_first: bool,
    seen_dir: Option<PathBuf>,
}

impl Evaluator for CountingEvaluator {
    fn evaluate(&mut self, _store: &DetectionStore, output_dir: &Path) -> anyhow::Result<()> {
        self.calls += 1;
        self.seen_dir = Some(output_dir.to_path_buf());
        if self.fail_first && self.calls == 1 {
            anyhow::bail!("ground truth unavailable");
        }
        Ok(())
    }
}

fn config(output_root: &Path, num_classes: usize) -> EvalConfig {
    EvalConfig {
        output_root: output_root.to_path_buf(),
        dataset_name: "synthetic".to_string(),
        run_name: "test".to_string(),
        num_classes,
        confidence_threshold: 0.3,
        nms_threshold: 0.5,
        bbox_regression: false,
        ..EvalConfig::default()
    }
}

/// Three proposals for class 1: two overlapping at IoU 0.6 and one below
/// the confidence threshold.
fn overlapping_proposals() -> RawOutput {
    RawOutput {
        scores: array![[0.1f32, 0.9], [0.15, 0.85], [0.9, 0.1]],
        rois: array![
            [0.0f32, 0.0, 9.0, 9.0],
            [0.0, 0.0, 9.0, 5.0],
            [30.0, 30.0, 40.0, 40.0]
        ],
        deltas: None,
        image_scale: 1.0,
    }
}

#[test]
fn overlapping_proposals_collapse_to_one_detection() {
    let dir = tempdir().unwrap();
    let mut pipeline =
        EvaluationPipeline::new(FixedBackend(overlapping_proposals()), config(dir.path(), 2));
    let mut evaluator = CountingEvaluator::default();

    let summary = pipeline
        .run(&mut SyntheticImages::new(1), &mut evaluator)
        .unwrap();

    assert_eq!(pipeline.state(), PipelineState::Done);
    assert_eq!(summary.images_processed, 1);
    assert_eq!(summary.total_detections, 1);
    assert_eq!(evaluator.calls, 1);
    assert_eq!(
        evaluator.seen_dir.as_deref(),
        Some(dir.path().join("synthetic/test").as_path())
    );

    let store = pipeline.store().unwrap();
    let dets = store.get(1, 0);
    assert_eq!(dets.len(), 1);
    assert_eq!(dets[0].score, 0.9);
    assert_eq!(dets[0].bbox, BoundingBox::new(0.0, 0.0, 9.0, 9.0));
    assert!(store.get(0, 0).is_empty(), "background stays empty");
}

#[test]
fn per_image_cap_keeps_top_scores_across_classes() {
    let dir = tempdir().unwrap();
    let num_classes = 6;
    let rois = array![
        [0.0f32, 0.0, 9.0, 9.0],
        [20.0, 20.0, 29.0, 29.0],
        [40.0, 0.0, 49.0, 9.0]
    ];
    // 15 distinct scores over 5 foreground classes and 3 disjoint boxes
    let scores = Array2::from_shape_fn((3, num_classes), |(region, class_id)| {
        if class_id == 0 {
            0.0
        } else {
            0.5 + 0.02 * ((class_id - 1) * 3 + region) as f32
        }
    });
    let raw = RawOutput {
        scores,
        rois,
        deltas: None,
        image_scale: 1.0,
    };
    let mut cfg = config(dir.path(), num_classes);
    cfg.max_per_image = 10;

    let mut pipeline = EvaluationPipeline::new(FixedBackend(raw), cfg);
    let summary = pipeline
        .run(&mut SyntheticImages::new(2), &mut CountingEvaluator::default())
        .unwrap();

    assert_eq!(summary.total_detections, 20);
    let store = pipeline.store().unwrap();
    for image_index in 0..2 {
        assert_eq!(store.image_detection_count(image_index), 10);
        // class 1 and two regions of class 2 hold the five lowest scores
        assert!(store.get(1, image_index).is_empty());
        assert_eq!(store.get(2, image_index).len(), 1);
        for class_id in 3..num_classes {
            assert_eq!(store.get(class_id, image_index).len(), 3);
        }
        let lowest = store
            .all()
            .flat_map(|slots| slots[image_index].iter())
            .map(|d| d.score)
            .fold(f32::INFINITY, f32::min);
        assert!(lowest > 0.5 + 0.02 * 4.5);
    }
}

#[test]
fn image_load_failure_aborts_without_artifact() {
    let dir = tempdir().unwrap();
    let mut pipeline =
        EvaluationPipeline::new(FixedBackend(overlapping_proposals()), config(dir.path(), 2));
    let mut images = SyntheticImages {
        count: 3,
        broken: Some(1),
    };
    let mut evaluator = CountingEvaluator::default();

    let err = pipeline.run(&mut images, &mut evaluator).unwrap_err();

    assert!(matches!(err, PipelineError::ImageLoadFailure { index: 1, .. }));
    assert!(err.to_string().contains("corrupt file"), "{err}");
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert!(pipeline.store().is_none());
    assert!(!pipeline.artifact_path().exists());
    assert_eq!(evaluator.calls, 0);

    // images were not all processed, so there is nothing to retry
    let err = pipeline.retry_finalize(&mut evaluator).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState { .. }));
}

#[test]
fn overflowing_boxes_fail_inference_without_artifact() {
    let dir = tempdir().unwrap();
    // rescaling by a tiny image scale pushes x2 past f32::MAX
    let raw = RawOutput {
        scores: array![[0.1f32, 0.9]],
        rois: array![[0.0f32, 0.0, 1e30, 10.0]],
        deltas: None,
        image_scale: 1e-10,
    };
    let mut pipeline = EvaluationPipeline::new(FixedBackend(raw), config(dir.path(), 2));
    let mut evaluator = CountingEvaluator::default();

    let err = pipeline
        .run(&mut SyntheticImages::new(1), &mut evaluator)
        .unwrap_err();

    assert!(matches!(err, PipelineError::InferenceFailure { index: 0, .. }));
    assert!(err.to_string().contains("Non-finite"), "{err}");
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert!(!pipeline.artifact_path().exists());
    assert_eq!(evaluator.calls, 0);
}

#[test]
fn serialization_failure_can_be_retried() {
    let dir = tempdir().unwrap();
    let blocked_root = dir.path().join("blocked");
    std::fs::write(&blocked_root, "not a directory").unwrap();

    let mut pipeline =
        EvaluationPipeline::new(FixedBackend(overlapping_proposals()), config(&blocked_root, 2));
    let mut evaluator = CountingEvaluator::default();

    let err = pipeline
        .run(&mut SyntheticImages::new(2), &mut evaluator)
        .unwrap_err();
    assert!(matches!(err, PipelineError::SerializationFailure { .. }));
    assert!(err.is_retryable());
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(evaluator.calls, 0);

    std::fs::remove_file(&blocked_root).unwrap();
    let summary = pipeline.retry_finalize(&mut evaluator).unwrap();

    assert_eq!(pipeline.state(), PipelineState::Done);
    assert_eq!(summary.images_processed, 2);
    assert_eq!(summary.total_detections, 2);
    assert!(summary.artifact_path.exists());
    assert_eq!(evaluator.calls, 1);
}

#[test]
fn evaluation_failure_keeps_artifact_and_retries() {
    let dir = tempdir().unwrap();
    let mut pipeline =
        EvaluationPipeline::new(FixedBackend(overlapping_proposals()), config(dir.path(), 2));
    let mut evaluator = CountingEvaluator {
        fail_first: true,
        ..CountingEvaluator::default()
    };

    let err = pipeline
        .run(&mut SyntheticImages::new(1), &mut evaluator)
        .unwrap_err();
    assert!(matches!(err, PipelineError::EvaluationFailure(_)));
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert!(pipeline.artifact_path().exists());

    pipeline.retry_finalize(&mut evaluator).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Done);
    assert_eq!(evaluator.calls, 2);
}

#[test]
fn artifact_matches_in_memory_store() {
    let dir = tempdir().unwrap();
    let mut pipeline =
        EvaluationPipeline::new(FixedBackend(overlapping_proposals()), config(dir.path(), 2));

    let summary = pipeline
        .run(&mut SyntheticImages::new(4), &mut CountingEvaluator::default())
        .unwrap();

    let loaded = load_detections(&summary.artifact_path).unwrap();
    assert_eq!(&loaded, pipeline.store().unwrap());
    assert_eq!(loaded.num_images(), 4);
}

#[test]
fn directory_run_with_recorded_outputs() {
    let root = tempdir().unwrap();
    let image_dir = root.path().join("images");
    let recorded_dir = root.path().join("raw");
    std::fs::create_dir_all(&image_dir).unwrap();
    std::fs::create_dir_all(&recorded_dir).unwrap();

    for id in ["000001", "000002"] {
        RgbImage::from_pixel(50, 40, Rgb([128, 64, 32]))
            .save(image_dir.join(format!("{id}.png")))
            .unwrap();
    }
    // proposals were computed on a 2x upscaled input; the second box runs past the border
    std::fs::write(
        recorded_dir.join("000001.json"),
        r#"{
            "scores": [[0.05, 0.95, 0.0], [0.1, 0.0, 0.9]],
            "rois": [[10, 10, 40, 40], [60, 50, 120, 100]],
            "deltas": [[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]],
            "image_scale": 2.0
        }"#,
    )
    .unwrap();
    std::fs::write(
        recorded_dir.join("000002.json"),
        r#"{"scores": [], "rois": [], "deltas": [], "image_scale": 2.0}"#,
    )
    .unwrap();

    let mut cfg = config(&root.path().join("out"), 3);
    cfg.image_dir = image_dir.clone();
    cfg.recorded_output_dir = recorded_dir.clone();
    cfg.bbox_regression = true;

    let mut source = DirectoryImageSource::open(&cfg.image_dir).unwrap();
    let backend = RecordedBackend::new(&cfg.recorded_output_dir, cfg.num_classes);
    let mut evaluator = SummaryEvaluator::default();
    let mut pipeline = EvaluationPipeline::new(backend, cfg);

    let summary = pipeline.run(&mut source, &mut evaluator).unwrap();

    assert_eq!(summary.images_processed, 2);
    assert_eq!(summary.images[0].id, "000001");
    assert_eq!((summary.images[0].width, summary.images[0].height), (50, 40));

    let store = pipeline.store().unwrap();
    assert_eq!(store.get(1, 0)[0].bbox, BoundingBox::new(5.0, 5.0, 20.0, 20.0));
    assert_eq!(store.get(2, 0)[0].bbox, BoundingBox::new(30.0, 25.0, 49.0, 39.0));
    assert_eq!(store.image_detection_count(1), 0);

    let stats = evaluator.last().unwrap();
    assert_eq!(stats.total_detections, 2);
    assert!(summary.artifact_path.parent().unwrap().join("summary.json").exists());
}
