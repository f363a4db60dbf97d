use common::TelemetryGuard;
use evaluation::{
    DirectoryImageSource, EvalConfig, EvaluationPipeline, RecordedBackend, SummaryEvaluator,
    logging::setup_logging,
};

fn main() -> anyhow::Result<()> {
    let config = EvalConfig::from_env()?;
    let run_id = format!("{}/{}", config.dataset_name, config.run_name);

    // The OTLP exporters need a live Tokio runtime for the whole run; the
    // guard also installs the subscriber, so plain logging is the fallback.
    // Bindings drop in reverse order: the guard flushes before the runtime stops.
    let (_runtime, _telemetry) = if let Some(endpoint) = config.otel_endpoint.as_ref() {
        let rt = tokio::runtime::Runtime::new()?;
        let guard = rt.block_on(async {
            TelemetryGuard::init("evaluation", &run_id, endpoint, config.environment)
        })?;
        (Some(rt), Some(guard))
    } else {
        setup_logging(&config);
        (None, None)
    };

    tracing::info!(config = ?config, "Loaded configuration");

    let mut source = DirectoryImageSource::open(&config.image_dir)?;
    let backend = RecordedBackend::new(&config.recorded_output_dir, config.num_classes);
    let mut evaluator = SummaryEvaluator::default();

    let mut pipeline = EvaluationPipeline::new(backend, config);
    let summary = pipeline.run(&mut source, &mut evaluator)?;

    tracing::info!(
        artifact = %summary.artifact_path.display(),
        images = summary.images_processed,
        detections = summary.total_detections,
        "Run complete"
    );

    Ok(())
}
