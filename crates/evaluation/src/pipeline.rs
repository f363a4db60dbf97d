use crate::{
    backend::InferenceBackend,
    config::EvalConfig,
    errors::PipelineError,
    evaluator::Evaluator,
    source::ImageSource,
    state_machine::{PipelineEvent, PipelineState, StateContext},
};
use detection::{DetectionStore, PostProcessor, save_detections};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
};
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const DETECTIONS_FILE: &str = "detections.json";

/// Identity and size of one evaluated image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub images_processed: usize,
    pub total_detections: usize,
    pub inference_time: Duration,
    pub postprocess_time: Duration,
    pub artifact_path: PathBuf,
    pub images: Vec<ImageRecord>,
}

struct PipelineMetrics {
    inference_duration: Histogram<f64>,
    postprocess_duration: Histogram<f64>,
    images: Counter<u64>,
    detections: Counter<u64>,
}

impl PipelineMetrics {
    /// Instruments on the global meter; without an installed provider they
    /// are no-ops, so recording can never fail a run.
    fn new(meter_name: &'static str) -> Self {
        let meter = global::meter(meter_name);
        let latency_buckets = vec![
            0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5, 1.0, 2.0,
        ];

        Self {
            inference_duration: meter
                .f64_histogram("evaluation_inference_duration_seconds")
                .with_description("Time spent in the inference backend per image")
                .with_unit("s")
                .with_boundaries(latency_buckets.clone())
                .build(),
            postprocess_duration: meter
                .f64_histogram("evaluation_postprocess_duration_seconds")
                .with_description("Decode, suppression and capping time per image")
                .with_unit("s")
                .with_boundaries(latency_buckets)
                .build(),
            images: meter
                .u64_counter("evaluation_images_total")
                .with_description("Total images evaluated")
                .build(),
            detections: meter
                .u64_counter("evaluation_detections_total")
                .with_description("Total detections stored")
                .build(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ImageTiming {
    inference: Duration,
    postprocess: Duration,
}

/// Drives one evaluation run over a fixed image collection.
pub struct EvaluationPipeline<B: InferenceBackend> {
    backend: B,
    config: EvalConfig,
    postprocessor: PostProcessor,
    state: StateContext,
    metrics: PipelineMetrics,
    store: Option<DetectionStore>,
    images: Vec<ImageRecord>,
    inference_time: Duration,
    postprocess_time: Duration,
}

impl<B: InferenceBackend> EvaluationPipeline<B> {
    pub fn new(backend: B, config: EvalConfig) -> Self {
        let postprocessor = PostProcessor::new(config.postprocess_config());
        Self {
            backend,
            config,
            postprocessor,
            state: StateContext::new(),
            metrics: PipelineMetrics::new("evaluation"),
            store: None,
            images: Vec::new(),
            inference_time: Duration::ZERO,
            postprocess_time: Duration::ZERO,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state.current_state()
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Finalized detections; `None` until every image has been processed.
    pub fn store(&self) -> Option<&DetectionStore> {
        self.store.as_ref()
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.config.output_dir().join(DETECTIONS_FILE)
    }

    /// Evaluate every image of `source`, persist the detections and hand
    /// them to `evaluator`. Any failure aborts the whole run.
    pub fn run<S, E>(&mut self, source: &mut S, evaluator: &mut E) -> Result<RunSummary, PipelineError>
    where
        S: ImageSource + ?Sized,
        E: Evaluator + ?Sized,
    {
        self.state.apply(PipelineEvent::Start)?;

        let num_images = source.count();
        tracing::info!(
            images = num_images,
            classes = self.config.num_classes,
            output_dir = %self.config.output_dir().display(),
            "Evaluation starting"
        );

        let mut store = DetectionStore::new(self.config.num_classes, num_images);

        for index in 0..num_images {
            match self.process_image(index, num_images, source, &mut store) {
                Ok(timing) => {
                    self.inference_time += timing.inference;
                    self.postprocess_time += timing.postprocess;
                }
                Err(e) => {
                    tracing::error!(error = %e, index, "Evaluation aborted");
                    self.state.apply(PipelineEvent::Abort)?;
                    return Err(e);
                }
            }
        }

        self.state.apply(PipelineEvent::ImagesExhausted)?;
        self.store = Some(store);
        self.finalize(evaluator)
    }

    /// Re-run serialization and evaluation after a failure that happened
    /// once all images were processed.
    pub fn retry_finalize<E>(&mut self, evaluator: &mut E) -> Result<RunSummary, PipelineError>
    where
        E: Evaluator + ?Sized,
    {
        self.state.apply(PipelineEvent::Retry)?;
        self.finalize(evaluator)
    }

    fn process_image<S>(
        &mut self,
        index: usize,
        num_images: usize,
        source: &mut S,
        store: &mut DetectionStore,
    ) -> Result<ImageTiming, PipelineError>
    where
        S: ImageSource + ?Sized,
    {
        let image = source
            .image_at(index)
            .map_err(|source| PipelineError::ImageLoadFailure { index, source })?;

        let span = tracing::info_span!("evaluate_image", index, image = %image.id);
        let _enter = span.enter();

        let start = Instant::now();
        let raw = {
            let _infer_span = common::span!("model_inference");
            self.backend
                .infer(&image)
                .map_err(|source| PipelineError::InferenceFailure { index, source })?
        };
        let inference = start.elapsed();

        if raw.num_classes() != store.num_classes() {
            return Err(PipelineError::InferenceFailure {
                index,
                source: anyhow::anyhow!(
                    "output has {} classes, dataset has {}",
                    raw.num_classes(),
                    store.num_classes()
                ),
            });
        }

        let start = Instant::now();
        let per_class = {
            let _post_span = common::span_debug!("postprocess");
            self.postprocessor
                .process(&raw, image.width, image.height)
                .map_err(|e| PipelineError::InferenceFailure {
                    index,
                    source: e.into(),
                })?
        };

        let mut detections = 0;
        for (class_id, dets) in per_class.into_iter().enumerate() {
            detections += dets.len();
            store.record(class_id, index, dets)?;
        }
        let postprocess = start.elapsed();

        self.metrics
            .inference_duration
            .record(inference.as_secs_f64(), &[]);
        self.metrics
            .postprocess_duration
            .record(postprocess.as_secs_f64(), &[]);
        self.metrics.images.add(1, &[]);
        self.metrics.detections.add(detections as u64, &[]);

        tracing::info!(
            "im_detect: {}/{} {:.3}s {:.3}s",
            index + 1,
            num_images,
            inference.as_secs_f64(),
            postprocess.as_secs_f64()
        );

        self.images.push(ImageRecord {
            id: image.id,
            width: image.width,
            height: image.height,
        });

        Ok(ImageTiming {
            inference,
            postprocess,
        })
    }

    fn finalize<E>(&mut self, evaluator: &mut E) -> Result<RunSummary, PipelineError>
    where
        E: Evaluator + ?Sized,
    {
        let Some(store) = self.store.as_ref() else {
            return Err(PipelineError::InvalidState {
                state: self.state.current_state(),
                event: PipelineEvent::Finalized,
            });
        };

        let output_dir = self.config.output_dir();
        let artifact_path = output_dir.join(DETECTIONS_FILE);

        let written = std::fs::create_dir_all(&output_dir)
            .map_err(Into::into)
            .and_then(|()| save_detections(store, &artifact_path));
        if let Err(source) = written {
            let err = PipelineError::SerializationFailure {
                path: artifact_path,
                source,
            };
            tracing::error!(error = %err, "Failed to persist detections");
            self.state.apply(PipelineEvent::Abort)?;
            return Err(err);
        }

        tracing::info!(path = %artifact_path.display(), "Evaluating detections");
        if let Err(source) = evaluator.evaluate(store, &output_dir) {
            let err = PipelineError::EvaluationFailure(source);
            tracing::error!(error = %err, "Evaluator failed");
            self.state.apply(PipelineEvent::Abort)?;
            return Err(err);
        }

        self.state.apply(PipelineEvent::Finalized)?;

        let summary = RunSummary {
            images_processed: self.images.len(),
            total_detections: store.total_detections(),
            inference_time: self.inference_time,
            postprocess_time: self.postprocess_time,
            artifact_path,
            images: self.images.clone(),
        };

        tracing::info!(
            images = summary.images_processed,
            detections = summary.total_detections,
            inference_s = summary.inference_time.as_secs_f64(),
            postprocess_s = summary.postprocess_time.as_secs_f64(),
            "Evaluation finished"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Image;
    use detection::RawOutput;
    use ndarray::{Array2, array};
    use std::path::Path;
    use tempfile::tempdir;

    struct FixedBackend {
        output: RawOutput,
        calls: usize,
    }

    impl InferenceBackend for FixedBackend {
        fn infer(&mut self, _image: &Image) -> anyhow::Result<RawOutput> {
            self.calls += 1;
            Ok(self.output.clone())
        }
    }

    struct BlankImages(usize);

    impl ImageSource for BlankImages {
        fn count(&self) -> usize {
            self.0
        }

        fn image_at(&mut self, index: usize) -> anyhow::Result<Image> {
            Ok(Image {
                id: format!("{index:06}"),
                width: 64,
                height: 48,
                pixels: vec![0; 64 * 48 * 3],
            })
        }
    }

    struct NoopEvaluator;

    impl Evaluator for NoopEvaluator {
        fn evaluate(&mut self, _store: &DetectionStore, _output_dir: &Path) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn config(output_root: &Path) -> EvalConfig {
        EvalConfig {
            output_root: output_root.to_path_buf(),
            num_classes: 2,
            bbox_regression: false,
            ..EvalConfig::default()
        }
    }

    fn one_detection() -> RawOutput {
        RawOutput {
            scores: array![[0.2f32, 0.8]],
            rois: array![[1.0f32, 2.0, 20.0, 30.0]],
            deltas: None,
            image_scale: 1.0,
        }
    }

    #[test]
    fn new_pipeline_is_idle() {
        let dir = tempdir().unwrap();
        let backend = FixedBackend {
            output: one_detection(),
            calls: 0,
        };
        let pipeline = EvaluationPipeline::new(backend, config(dir.path()));

        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert!(pipeline.store().is_none());
        assert_eq!(
            pipeline.artifact_path(),
            dir.path().join("voc_2007_test/default/detections.json")
        );
    }

    #[test]
    fn run_records_every_image_once() {
        let dir = tempdir().unwrap();
        let backend = FixedBackend {
            output: one_detection(),
            calls: 0,
        };
        let mut pipeline = EvaluationPipeline::new(backend, config(dir.path()));

        let summary = pipeline.run(&mut BlankImages(3), &mut NoopEvaluator).unwrap();

        assert_eq!(pipeline.state(), PipelineState::Done);
        assert_eq!(pipeline.backend.calls, 3);
        assert_eq!(summary.images_processed, 3);
        assert_eq!(summary.total_detections, 3);
        assert_eq!(summary.images[2].id, "000002");
        let store = pipeline.store().unwrap();
        for image_index in 0..3 {
            assert!(store.is_recorded(0, image_index));
            assert!(store.is_recorded(1, image_index));
        }
    }

    #[test]
    fn second_run_is_rejected() {
        let dir = tempdir().unwrap();
        let backend = FixedBackend {
            output: one_detection(),
            calls: 0,
        };
        let mut pipeline = EvaluationPipeline::new(backend, config(dir.path()));
        pipeline.run(&mut BlankImages(1), &mut NoopEvaluator).unwrap();

        let err = pipeline.run(&mut BlankImages(1), &mut NoopEvaluator).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
        assert_eq!(pipeline.backend.calls, 1);
    }

    #[test]
    fn class_count_mismatch_aborts() {
        let dir = tempdir().unwrap();
        let backend = FixedBackend {
            output: RawOutput {
                scores: Array2::zeros((1, 3)),
                rois: Array2::zeros((1, 4)),
                deltas: None,
                image_scale: 1.0,
            },
            calls: 0,
        };
        let mut pipeline = EvaluationPipeline::new(backend, config(dir.path()));

        let err = pipeline.run(&mut BlankImages(2), &mut NoopEvaluator).unwrap_err();

        assert!(matches!(err, PipelineError::InferenceFailure { index: 0, .. }));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(pipeline.store().is_none());
    }
}
