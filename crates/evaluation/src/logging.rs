use crate::config::EvalConfig;

pub fn setup_logging(config: &EvalConfig) {
    common::setup_logging(config.environment);
}
