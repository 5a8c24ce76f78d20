//! The training loop: trainer state machine, plus the inference passes it
//! runs for baselines and validation.

pub mod eval;
pub mod trainer;

pub use eval::{
    default_calc_metrics, evaluate, evaluate_batch, scalar_metric, CalcMetrics, MetricsPipeline,
};
pub use trainer::{Trainer, TrainerConfig, TrainingReport, CHECKPOINTS_DIR, SUMMARY_DIR};
