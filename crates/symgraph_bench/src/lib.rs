//! Shallow-water parameter estimation on top of `symgraph_core`.
//!
//! The model simulates a square pool disturbed by a cosine bump; the estimation layer
//! recovers drag and depth from the simulated heights with single shooting, multiple
//! shooting, or a marked single-shooting graph, and tabulates the outcome per guess.
pub mod estimation;
pub mod model;

pub use estimation::{
    format_table, run_batch, BatchRow, Estimate, Estimator, Transcription, GUESSES,
};
pub use model::{ShallowWaterConfig, ShallowWaterModel};
