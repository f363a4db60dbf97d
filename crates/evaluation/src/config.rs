use anyhow::ensure;
use common::{env_flag, env_or};
use detection::PostProcessConfig;
use std::env;
use std::path::PathBuf;

pub use common::Environment;

#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub environment: Environment,
    pub image_dir: PathBuf,
    pub recorded_output_dir: PathBuf,
    pub output_root: PathBuf,
    pub dataset_name: String,
    pub run_name: String,
    /// Class count including the background class.
    pub num_classes: usize,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub max_per_image: i64,
    pub bbox_regression: bool,
    pub otel_endpoint: Option<String>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        let post = PostProcessConfig::default();
        Self {
            environment: Environment::Development,
            image_dir: PathBuf::from("data/images"),
            recorded_output_dir: PathBuf::from("data/raw_outputs"),
            output_root: PathBuf::from("output"),
            dataset_name: "voc_2007_test".to_string(),
            run_name: "default".to_string(),
            num_classes: 21,
            confidence_threshold: post.confidence_threshold,
            nms_threshold: post.nms_threshold,
            max_per_image: post.max_per_image,
            bbox_regression: post.bbox_regression,
            otel_endpoint: None,
        }
    }
}

impl EvalConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let path_or = |key: &str, default: PathBuf| {
            env::var(key).map(PathBuf::from).unwrap_or(default)
        };

        let config = Self {
            environment: Environment::from_env(),
            image_dir: path_or("IMAGE_DIR", defaults.image_dir),
            recorded_output_dir: path_or("RECORDED_OUTPUT_DIR", defaults.recorded_output_dir),
            output_root: path_or("OUTPUT_ROOT", defaults.output_root),
            dataset_name: env::var("DATASET_NAME").unwrap_or(defaults.dataset_name),
            run_name: env::var("RUN_NAME").unwrap_or(defaults.run_name),
            num_classes: env_or("NUM_CLASSES", defaults.num_classes),
            confidence_threshold: env_or("CONFIDENCE_THRESHOLD", defaults.confidence_threshold),
            nms_threshold: env_or("NMS_THRESHOLD", defaults.nms_threshold),
            max_per_image: env_or("MAX_PER_IMAGE", defaults.max_per_image),
            bbox_regression: env_flag("BBOX_REG", defaults.bbox_regression),
            otel_endpoint: env::var("OTEL_ENDPOINT").ok().filter(|s| !s.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.confidence_threshold),
            "CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
            self.confidence_threshold
        );
        ensure!(
            (0.0..=1.0).contains(&self.nms_threshold),
            "NMS_THRESHOLD must be within [0, 1], got {}",
            self.nms_threshold
        );
        ensure!(
            self.num_classes >= 1,
            "NUM_CLASSES must count at least the background class"
        );
        Ok(())
    }

    /// Directory receiving the artifacts of this run.
    pub fn output_dir(&self) -> PathBuf {
        self.output_root.join(&self.dataset_name).join(&self.run_name)
    }

    pub fn postprocess_config(&self) -> PostProcessConfig {
        PostProcessConfig {
            confidence_threshold: self.confidence_threshold,
            nms_threshold: self.nms_threshold,
            max_per_image: self.max_per_image,
            bbox_regression: self.bbox_regression,
        }
    }
}
