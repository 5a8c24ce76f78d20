//! Metric values, their normalization, and the epoch-level reducers.

mod average;
mod value;

pub use average::{
    per_batch_mean, AverageKind, Ema, Finalize, MetricsAverage, RunningMean, RunningSum,
};
pub use value::{normalize, normalize_metrics, MetricValue, Metrics};
