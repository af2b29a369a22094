use std::path::PathBuf;
use std::time::Instant;

use lagcast::{
    config_path_from_env, init_logging, log_app_finish, log_app_start, logging_config_from_env,
    run_walk_forward, CsvComparisonPlotter, CsvRawSource, PipelineConfig, PipelineRunner, RunMode,
    WalkForwardPlan,
};

const DEFAULT_COMPARISON_PATH: &str = "reports/predictions_vs_actual.csv";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started = Instant::now();
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let config_path = config_path_from_env();
    log_app_start(RunMode::Inference, &logging_cfg, &config_path);

    let config = PipelineConfig::load(&config_path)?;
    let plan = WalkForwardPlan::from_config(&config.pipeline_runner);
    let feed_path = config.data_manager.real_time_data_path.clone();
    let comparison_path = config
        .data_manager
        .comparison_output_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_COMPARISON_PATH));

    let mut runner = PipelineRunner::new(config, Box::new(CsvRawSource::default()))?;
    runner.initialize_store()?;
    let feed = runner.load_observations(&feed_path)?;

    let mut plotter = CsvComparisonPlotter::new(comparison_path);
    let summary = run_walk_forward(&mut runner, &feed, &plan, &mut plotter)?;

    println!(
        "Inference complete | steps={} predicted={} skipped={} already_predicted={} appended={} comparison={}",
        summary.steps,
        summary.predicted,
        summary.skipped_insufficient_history,
        summary.already_predicted,
        summary.observations_appended,
        plotter.path().display()
    );

    log_app_finish(RunMode::Inference, started.elapsed().as_millis());
    Ok(())
}
