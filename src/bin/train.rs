use std::time::Instant;

use lagcast::{
    config_path_from_env, init_logging, log_app_finish, log_app_start, logging_config_from_env,
    CsvRawSource, PipelineConfig, PipelineRunner, RunMode,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let config_path = config_path_from_env();
    log_app_start(RunMode::Training, &logging_cfg, &config_path);

    let config = PipelineConfig::load(&config_path)?;
    let mut runner = PipelineRunner::new(config, Box::new(CsvRawSource::default()))?;
    let report = runner.run_training()?;

    println!(
        "Training complete | rows={} validation_rmse={:.4} validation_mae={:.4} trials={}/{} artifact={}",
        report.feature_rows,
        report.metrics.validation_rmse,
        report.metrics.validation_mae,
        report.metrics.trials_completed,
        report.metrics.trials_completed + report.metrics.trials_failed,
        report.artifact_path.display()
    );

    log_app_finish(RunMode::Training, started.elapsed().as_millis());
    Ok(())
}
