use std::collections::HashMap;

use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};

use super::value::{MetricValue, Metrics};

/// Streaming reducer folding per-batch metrics into epoch-level statistics.
///
/// `init` is called once at the start of every train and validation pass.
/// `accumulate` receives already normalized batch metrics. Keys the running
/// state has but the batch lacks are left unchanged; keys seen for the first
/// time are seeded with the observation itself.
pub trait MetricsAverage {
    fn init(&mut self, running: &mut Metrics);
    fn accumulate(&mut self, running: &mut Metrics, batch: &Metrics);
}

/// Exponential moving average: `running = decay * running + (1 - decay) * batch`.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    pub decay: f64,
}

impl Ema {
    pub const DEFAULT_DECAY: f64 = 0.9;

    pub fn new(decay: f64) -> Self {
        Ema { decay }
    }
}

impl Default for Ema {
    fn default() -> Self {
        Ema::new(Self::DEFAULT_DECAY)
    }
}

impl MetricsAverage for Ema {
    fn init(&mut self, running: &mut Metrics) {
        running.clear();
    }

    fn accumulate(&mut self, running: &mut Metrics, batch: &Metrics) {
        let decay = self.decay;
        fold_map(running, batch, &|old, new| decay * old + (1.0 - decay) * new);
    }
}

/// Arithmetic mean over the batches in which each key appeared.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    counts: HashMap<String, u64>,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricsAverage for RunningMean {
    fn init(&mut self, running: &mut Metrics) {
        running.clear();
        self.counts.clear();
    }

    fn accumulate(&mut self, running: &mut Metrics, batch: &Metrics) {
        for (key, value) in batch {
            let count = self.counts.entry(key.clone()).or_insert(0);
            *count += 1;
            let n = *count as f64;
            match running.get_mut(key) {
                Some(current) => fold(current, value, &|old, new| old + (new - old) / n),
                None => {
                    running.insert(key.clone(), seed(value));
                }
            }
        }
    }
}

/// Plain sum; pair with [`per_batch_mean`] to turn it into a mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningSum;

impl MetricsAverage for RunningSum {
    fn init(&mut self, running: &mut Metrics) {
        running.clear();
    }

    fn accumulate(&mut self, running: &mut Metrics, batch: &Metrics) {
        fold_map(running, batch, &|old, new| old + new);
    }
}

/// Epoch-end transform applied to `(running, batches_seen)`.
pub trait Finalize {
    fn finalize(&self, running: Metrics, batches: usize) -> Metrics;
}

impl<F: Fn(Metrics, usize) -> Metrics> Finalize for F {
    fn finalize(&self, running: Metrics, batches: usize) -> Metrics {
        self(running, batches)
    }
}

/// Divide every numeric entry by the number of batches seen.
pub fn per_batch_mean(running: Metrics, batches: usize) -> Metrics {
    if batches == 0 {
        return running;
    }
    let n = batches as f64;
    running
        .into_iter()
        .map(|(k, v)| (k, map_numeric(v, &|x| x / n)))
        .collect()
}

/// Reducer selection as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AverageKind {
    #[default]
    Ema,
    Mean,
    Sum,
}

impl AverageKind {
    pub fn build(self, ema_decay: f64) -> Box<dyn MetricsAverage> {
        match self {
            AverageKind::Ema => Box::new(Ema::new(ema_decay)),
            AverageKind::Mean => Box::new(RunningMean::new()),
            AverageKind::Sum => Box::new(RunningSum),
        }
    }

    /// Finalizer the reducer needs to yield per-batch values, if any.
    pub fn finalizer(self) -> Option<Box<dyn Finalize>> {
        match self {
            AverageKind::Sum => Some(Box::new(per_batch_mean)),
            AverageKind::Ema | AverageKind::Mean => None,
        }
    }
}

fn fold_map(running: &mut Metrics, batch: &Metrics, op: &dyn Fn(f64, f64) -> f64) {
    for (key, value) in batch {
        match running.get_mut(key) {
            Some(current) => fold(current, value, op),
            None => {
                running.insert(key.clone(), seed(value));
            }
        }
    }
}

// First observation of a key. Integers are promoted so later blends stay exact.
fn seed(value: &MetricValue) -> MetricValue {
    match value {
        MetricValue::Int(v) => MetricValue::Scalar(*v as f64),
        other => other.clone(),
    }
}

fn fold(current: &mut MetricValue, new: &MetricValue, op: &dyn Fn(f64, f64) -> f64) {
    use MetricValue::*;
    if let (Some(old), Some(obs)) = (current.as_f64(), new.as_f64()) {
        if matches!(current, Scalar(_) | Int(_)) {
            *current = Scalar(op(old, obs));
            return;
        }
    }
    match (&mut *current, new) {
        (Array(old), Array(obs)) if old.len() == obs.len() => {
            old.iter_mut().zip(obs).for_each(|(a, b)| *a = op(*a, *b));
        }
        (Tensor(old), Tensor(obs)) if old.shape == obs.shape => {
            let values: Vec<f64> = old
                .iter::<f64>()
                .zip(obs.iter::<f64>())
                .map(|(a, b)| op(a, b))
                .collect();
            *old = TensorData::new(values, old.shape.clone());
        }
        (List(old), List(obs)) | (Tuple(old), Tuple(obs)) if old.len() == obs.len() => {
            old.iter_mut().zip(obs).for_each(|(a, b)| fold(a, b, op));
        }
        (Map(old), Map(obs)) => fold_map(old, obs, op),
        _ => *current = seed(new),
    }
}

fn map_numeric(value: MetricValue, f: &dyn Fn(f64) -> f64) -> MetricValue {
    use MetricValue::*;
    match value {
        Scalar(v) => Scalar(f(v)),
        Int(v) => Scalar(f(v as f64)),
        Array(vs) => Array(vs.into_iter().map(f).collect()),
        Tensor(data) => {
            let values: Vec<f64> = data.iter::<f64>().map(f).collect();
            Tensor(TensorData::new(values, data.shape.clone()))
        }
        List(items) => List(items.into_iter().map(|v| map_numeric(v, f)).collect()),
        Tuple(items) => Tuple(items.into_iter().map(|v| map_numeric(v, f)).collect()),
        Map(map) => Map(map.into_iter().map(|(k, v)| (k, map_numeric(v, f))).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(pairs: &[(&str, MetricValue)]) -> Metrics {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn scalar(m: &Metrics, key: &str) -> f64 {
        m[key].as_f64().unwrap()
    }

    #[test]
    fn test_ema_seeds_from_first_observation() {
        let mut ema = Ema::new(0.9);
        let mut running = Metrics::new();
        ema.init(&mut running);
        ema.accumulate(&mut running, &batch(&[("loss", 2.0.into())]));
        assert_eq!(scalar(&running, "loss"), 2.0);

        ema.accumulate(&mut running, &batch(&[("loss", 1.0.into())]));
        assert!((scalar(&running, "loss") - 1.9).abs() < 1e-12);
    }

    #[test]
    fn test_missing_keys_are_left_unchanged() {
        let mut ema = Ema::default();
        let mut running = Metrics::new();
        ema.accumulate(
            &mut running,
            &batch(&[("loss", 1.0.into()), ("acc", 0.5.into())]),
        );
        ema.accumulate(&mut running, &batch(&[("loss", 0.0.into())]));
        assert_eq!(scalar(&running, "acc"), 0.5);

        // late key is seeded, not blended with zero
        ema.accumulate(&mut running, &batch(&[("f1", 0.7.into())]));
        assert_eq!(scalar(&running, "f1"), 0.7);
    }

    #[test]
    fn test_init_resets_running_state() {
        let mut mean = RunningMean::new();
        let mut running = Metrics::new();
        mean.accumulate(&mut running, &batch(&[("loss", 10.0.into())]));
        mean.init(&mut running);
        assert!(running.is_empty());
        mean.accumulate(&mut running, &batch(&[("loss", 2.0.into())]));
        mean.accumulate(&mut running, &batch(&[("loss", 4.0.into())]));
        assert_eq!(scalar(&running, "loss"), 3.0);
    }

    #[test]
    fn test_running_mean_counts_per_key() {
        let mut mean = RunningMean::new();
        let mut running = Metrics::new();
        mean.accumulate(&mut running, &batch(&[("a", 1.0.into())]));
        mean.accumulate(
            &mut running,
            &batch(&[("a", 3.0.into()), ("b", 10.0.into())]),
        );
        mean.accumulate(&mut running, &batch(&[("b", 20.0.into())]));
        assert_eq!(scalar(&running, "a"), 2.0);
        assert_eq!(scalar(&running, "b"), 15.0);
    }

    #[test]
    fn test_sum_with_per_batch_mean_finalizer() {
        let mut sum = RunningSum;
        let mut running = Metrics::new();
        for v in [1.0, 2.0, 6.0] {
            sum.accumulate(
                &mut running,
                &batch(&[("loss", v.into()), ("hist", vec![v, 2.0 * v].into())]),
            );
        }
        let finalizer = AverageKind::Sum.finalizer().unwrap();
        let out = finalizer.finalize(running, 3);
        assert_eq!(scalar(&out, "loss"), 3.0);
        assert_eq!(out["hist"], MetricValue::Array(vec![3.0, 6.0]));
    }

    #[test]
    fn test_arrays_and_tensors_blend_elementwise() {
        let mut ema = Ema::new(0.5);
        let mut running = Metrics::new();
        let t = |a: f32, b: f32| MetricValue::from(TensorData::new(vec![a, b], [2]));
        ema.accumulate(
            &mut running,
            &batch(&[("arr", vec![0.0, 4.0].into()), ("t", t(2.0, 2.0))]),
        );
        ema.accumulate(
            &mut running,
            &batch(&[("arr", vec![2.0, 0.0].into()), ("t", t(0.0, 4.0))]),
        );
        assert_eq!(running["arr"], MetricValue::Array(vec![1.0, 2.0]));
        let MetricValue::Tensor(data) = &running["t"] else {
            panic!("expected tensor");
        };
        assert_eq!(data.iter::<f64>().collect::<Vec<_>>(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_non_numeric_values_take_latest() {
        let mut ema = Ema::default();
        let mut running = Metrics::new();
        ema.accumulate(&mut running, &batch(&[("phase", "warmup".into())]));
        ema.accumulate(&mut running, &batch(&[("phase", "main".into())]));
        assert_eq!(running["phase"], MetricValue::Text("main".into()));
    }

    #[test]
    fn test_nested_maps_fold_recursively() {
        let mut mean = RunningMean::new();
        let mut running = Metrics::new();
        let nested = |v: f64| {
            let mut m = Metrics::new();
            m.insert("mae".into(), v.into());
            MetricValue::Map(m)
        };
        mean.accumulate(&mut running, &batch(&[("val", nested(1.0))]));
        mean.accumulate(&mut running, &batch(&[("val", nested(3.0))]));
        let MetricValue::Map(inner) = &running["val"] else {
            panic!("expected map");
        };
        assert_eq!(inner["mae"], MetricValue::Scalar(2.0));
    }

    #[test]
    fn test_average_kind_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            average: AverageKind,
        }
        let w: Wrapper = toml::from_str("average = \"mean\"").unwrap();
        assert_eq!(w.average, AverageKind::Mean);
        assert!(AverageKind::Ema.finalizer().is_none());
    }
}
