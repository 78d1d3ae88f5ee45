use std::fs;

use anyhow::{Context, Result};
use symgraph_bench::{
    format_table, run_batch, Estimator, ShallowWaterConfig, ShallowWaterModel, Transcription,
    GUESSES,
};
use symgraph_core::SolveSettings;
use tracing::info;
use tracing_subscriber::EnvFilter;

const TRUE_DRAG: f64 = 2.0;
const TRUE_DEPTH: f64 = 0.01;
const TABLE_TOLERANCE: f64 = 1e-3;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let text = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str::<ShallowWaterConfig>(&text)
                .with_context(|| format!("parsing {path}"))?
        }
        None => ShallowWaterConfig::default(),
    };
    info!(?config, "shallow water configuration");

    let model = ShallowWaterModel::new(config)?;
    let measurements = model
        .simulate(TRUE_DRAG, TRUE_DEPTH)
        .context("simulating the measurements")?;

    let mut estimators = [Transcription::SingleShooting, Transcription::MultipleShooting]
        .into_iter()
        .map(|t| Estimator::new(&model, measurements.clone(), t, SolveSettings::default()))
        .collect::<Result<Vec<_>>>()?;

    let rows = run_batch(&mut estimators, &GUESSES);
    print!("{}", format_table(&rows, [TRUE_DRAG, TRUE_DEPTH], TABLE_TOLERANCE));
    Ok(())
}
