//! A small least-squares regression job.
//!
//! Used by the `train` binary and as a realistic end-to-end workload: a
//! linear model trained with SGD on synthetic data whose shuffling and
//! input noise are drawn from the run's [`RandomSources`].

use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::model::{
    BoxError, Dataset, Device, Loss, Optimizer, ParamGroup, Parameter, StateDict, ToDevice,
    Trainable,
};
use crate::rng::RandomSources;
use crate::step::{ForwardStep, ForwardStepBuilder};

const WEIGHT: usize = 0;
const BIAS: usize = 1;

/// Rows of features with their regression targets.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionBatch {
    pub features: Vec<Vec<f32>>,
    pub targets: Vec<f32>,
}

impl ToDevice for RegressionBatch {
    fn to_device(self, _device: Device) -> Self {
        self
    }
}

/// Mean squared error together with the residuals backward needs.
#[derive(Debug, Clone, PartialEq)]
pub struct MseLoss {
    pub value: f64,
    pub residuals: Vec<f32>,
}

impl Loss for MseLoss {
    fn item(&self) -> f64 {
        self.value
    }
}

#[allow(clippy::ptr_arg)]
pub fn mse_loss(outputs: &Vec<f32>, targets: Option<&Vec<f32>>) -> Result<MseLoss, BoxError> {
    let targets = targets.ok_or("mse loss needs targets")?;
    if outputs.len() != targets.len() {
        return Err(format!(
            "mse loss shape mismatch: {} outputs, {} targets",
            outputs.len(),
            targets.len()
        )
        .into());
    }
    if outputs.is_empty() {
        return Err("mse loss of an empty batch".into());
    }
    let residuals: Vec<f32> = outputs.iter().zip(targets).map(|(y, t)| y - t).collect();
    let value = residuals
        .iter()
        .map(|r| f64::from(*r) * f64::from(*r))
        .sum::<f64>()
        / residuals.len() as f64;
    Ok(MseLoss { value, residuals })
}

/// `y = w . x + b`
#[derive(Debug, Clone)]
pub struct LinearRegression {
    params: Vec<Parameter>,
    training: bool,
    grad_enabled: bool,
    cached_inputs: Option<Vec<Vec<f32>>>,
}

impl LinearRegression {
    /// Weights drawn from `N(0, 1/features)` on the compute source; zero bias.
    pub fn new(features: usize, rng: &mut RandomSources) -> Self {
        let scale = 1.0 / (features.max(1) as f32).sqrt();
        let weight = (0..features)
            .map(|_| {
                let z: f32 = StandardNormal.sample(rng.compute());
                z * scale
            })
            .collect();
        LinearRegression {
            params: vec![Parameter::new("weight", weight), Parameter::new("bias", vec![0.0])],
            training: true,
            grad_enabled: true,
            cached_inputs: None,
        }
    }

    pub fn features(&self) -> usize {
        self.params[WEIGHT].value.len()
    }

    pub fn weight(&self) -> &[f32] {
        &self.params[WEIGHT].value
    }

    pub fn bias(&self) -> f32 {
        self.params[BIAS].value[0]
    }

    /// Features in, MSE against the batch targets.
    pub fn forward_step() -> ForwardStep<LinearRegression> {
        ForwardStepBuilder::new(|batch: &RegressionBatch| batch.features.clone())
            .targets(|batch: &RegressionBatch| batch.targets.clone())
            .criterion(mse_loss)
            .build()
    }

    fn predict(&self, row: &[f32]) -> f32 {
        let dot: f32 = self.weight().iter().zip(row).map(|(w, x)| w * x).sum();
        dot + self.bias()
    }
}

fn accumulate(grad: &mut Option<Vec<f32>>, delta: Vec<f32>) {
    match grad {
        Some(existing) => existing.iter_mut().zip(delta).for_each(|(g, d)| *g += d),
        None => *grad = Some(delta),
    }
}

impl Trainable for LinearRegression {
    type Batch = RegressionBatch;
    type Input = Vec<Vec<f32>>;
    type Output = Vec<f32>;
    type Target = Vec<f32>;
    type Loss = MseLoss;

    fn name(&self) -> &str {
        "LinearRegression"
    }

    fn forward(&mut self, input: Vec<Vec<f32>>) -> Result<Vec<f32>, BoxError> {
        let features = self.features();
        if let Some(row) = input.iter().find(|row| row.len() != features) {
            return Err(format!("expected {features} features, got {}", row.len()).into());
        }
        let outputs = input.iter().map(|row| self.predict(row)).collect();
        self.cached_inputs = self.grad_enabled.then_some(input);
        Ok(outputs)
    }

    fn backward(&mut self, loss: &MseLoss) -> Result<(), BoxError> {
        let inputs = self
            .cached_inputs
            .take()
            .ok_or("backward without a recorded forward pass")?;
        if inputs.len() != loss.residuals.len() {
            return Err("loss does not belong to the last forward pass".into());
        }
        let n = inputs.len() as f32;
        let mut grad_w = vec![0.0f32; self.features()];
        let mut grad_b = 0.0f32;
        for (row, r) in inputs.iter().zip(&loss.residuals) {
            let coeff = 2.0 * r / n;
            grad_w.iter_mut().zip(row).for_each(|(g, x)| *g += coeff * x);
            grad_b += coeff;
        }
        accumulate(&mut self.params[WEIGHT].grad, grad_w);
        accumulate(&mut self.params[BIAS].grad, vec![grad_b]);
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn state_dict(&self) -> StateDict {
        let weight: Vec<f64> = self.weight().iter().map(|w| f64::from(*w)).collect();
        json!({ "weight": weight, "bias": f64::from(self.bias()) })
    }

    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<(), BoxError> {
        match state.get("weight") {
            Some(value) => {
                let weight: Vec<f64> = serde_json::from_value(value.clone())?;
                if weight.len() != self.features() {
                    return Err(format!(
                        "weight has {} features, model has {}",
                        weight.len(),
                        self.features()
                    )
                    .into());
                }
                self.params[WEIGHT].value = weight.into_iter().map(|w| w as f32).collect();
            }
            None if strict => return Err("missing key `weight`".into()),
            None => {}
        }
        match state.get("bias").and_then(serde_json::Value::as_f64) {
            Some(bias) => self.params[BIAS].value = vec![bias as f32],
            None if strict => return Err("missing key `bias`".into()),
            None => {}
        }
        Ok(())
    }

    fn train(&mut self) {
        self.training = true;
    }

    fn eval(&mut self) {
        self.training = false;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_grad_enabled(&mut self, enabled: bool) {
        self.grad_enabled = enabled;
        if !enabled {
            self.cached_inputs = None;
        }
    }
}

/// Plain stochastic gradient descent with L2 weight decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    pub lr: f64,
    pub weight_decay: f64,
    pub steps: u64,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Sgd {
            lr,
            weight_decay: 0.0,
            steps: 0,
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [Parameter]) -> Result<(), BoxError> {
        let lr = self.lr as f32;
        let decay = self.weight_decay as f32;
        for param in params.iter_mut() {
            let Some(grad) = &param.grad else { continue };
            if grad.len() != param.value.len() {
                return Err(format!("gradient shape mismatch for `{}`", param.name).into());
            }
            param
                .value
                .iter_mut()
                .zip(grad)
                .for_each(|(v, g)| *v -= lr * (g + decay * *v));
        }
        self.steps += 1;
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        json!({ "lr": self.lr, "weight_decay": self.weight_decay, "steps": self.steps })
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), BoxError> {
        *self = serde_json::from_value(state.clone())?;
        Ok(())
    }

    fn param_groups(&self) -> Vec<ParamGroup> {
        vec![ParamGroup::from([
            ("lr".to_string(), self.lr),
            ("weight_decay".to_string(), self.weight_decay),
        ])]
    }
}

/// In-memory regression data from a fixed random linear function.
///
/// A training split is reshuffled on every pass from the array source and
/// its features are jittered with Gaussian noise from the general source.
/// A validation split is served as is.
#[derive(Debug, Clone)]
pub struct SyntheticRegression {
    features: Vec<Vec<f32>>,
    targets: Vec<f32>,
    batch_size: usize,
    shuffle: bool,
    noise_std: f32,
}

impl SyntheticRegression {
    /// `samples` rows with `features` columns; targets carry `noise_std`
    /// label noise.
    pub fn generate<R: Rng + ?Sized>(
        samples: usize,
        features: usize,
        batch_size: usize,
        noise_std: f32,
        rng: &mut R,
    ) -> Result<Self, BoxError> {
        let truth: Vec<f32> = (0..features).map(|_| StandardNormal.sample(rng)).collect();
        Self::sample(&truth, samples, batch_size, noise_std, rng)
    }

    /// Train and validation splits drawn from the same linear function.
    pub fn generate_split<R: Rng + ?Sized>(
        samples: usize,
        val_samples: usize,
        features: usize,
        batch_size: usize,
        noise_std: f32,
        rng: &mut R,
    ) -> Result<(Self, Self), BoxError> {
        let truth: Vec<f32> = (0..features).map(|_| StandardNormal.sample(rng)).collect();
        let train = Self::sample(&truth, samples, batch_size, noise_std, rng)?;
        let val = Self::sample(&truth, val_samples, batch_size, noise_std, rng)?.for_validation();
        Ok((train, val))
    }

    fn sample<R: Rng + ?Sized>(
        truth: &[f32],
        samples: usize,
        batch_size: usize,
        noise_std: f32,
        rng: &mut R,
    ) -> Result<Self, BoxError> {
        if batch_size == 0 {
            return Err("batch size must be > 0".into());
        }
        let noise = Normal::new(0.0f32, noise_std)?;
        let mut features = Vec::with_capacity(samples);
        let mut targets = Vec::with_capacity(samples);
        for _ in 0..samples {
            let row: Vec<f32> = truth.iter().map(|_| StandardNormal.sample(rng)).collect();
            let y: f32 = truth.iter().zip(&row).map(|(w, x)| w * x).sum::<f32>() + 0.5;
            targets.push(y + noise.sample(rng));
            features.push(row);
        }
        Ok(SyntheticRegression {
            features,
            targets,
            batch_size,
            shuffle: true,
            noise_std,
        })
    }

    /// Fixed order, no input noise.
    pub fn for_validation(mut self) -> Self {
        self.shuffle = false;
        self.noise_std = 0.0;
        self
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Dataset for SyntheticRegression {
    type Batch = RegressionBatch;

    fn batches<'a>(
        &'a self,
        rng: &'a mut RandomSources,
    ) -> Box<dyn Iterator<Item = RegressionBatch> + 'a> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if self.shuffle {
            order.shuffle(rng.array());
        }
        let jitter = Normal::new(0.0f32, self.noise_std).ok().filter(|_| self.noise_std > 0.0);
        let batches: Vec<RegressionBatch> = order
            .chunks(self.batch_size)
            .map(|chunk| {
                let features = chunk
                    .iter()
                    .map(|&i| match &jitter {
                        Some(normal) => self.features[i]
                            .iter()
                            .map(|x| x + normal.sample(rng.general()))
                            .collect(),
                        None => self.features[i].clone(),
                    })
                    .collect();
                let targets = chunk.iter().map(|&i| self.targets[i]).collect();
                RegressionBatch { features, targets }
            })
            .collect();
        Box::new(batches.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model_with(weight: Vec<f32>, bias: f32) -> LinearRegression {
        let mut model = LinearRegression::new(weight.len(), &mut RandomSources::seeded(0));
        model.params[WEIGHT].value = weight;
        model.params[BIAS].value = vec![bias];
        model
    }

    #[test]
    fn test_forward_and_loss() {
        let mut model = model_with(vec![2.0, -1.0], 0.5);
        let outputs = model.forward(vec![vec![1.0, 1.0], vec![0.0, 2.0]]).unwrap();
        assert_eq!(outputs, vec![1.5, -1.5]);

        let loss = mse_loss(&outputs, Some(&vec![1.0, -1.0])).unwrap();
        assert!((loss.value - 0.25).abs() < 1e-9);
        assert_eq!(loss.residuals, vec![0.5, -0.5]);
    }

    #[test]
    fn test_mse_needs_targets() {
        assert!(mse_loss(&vec![1.0], None).is_err());
        assert!(mse_loss(&vec![1.0], Some(&vec![1.0, 2.0])).is_err());
    }

    #[test]
    fn test_backward_gradients() {
        let mut model = model_with(vec![1.0], 0.0);
        let outputs = model.forward(vec![vec![2.0]]).unwrap();
        let loss = mse_loss(&outputs, Some(&vec![1.0])).unwrap();
        model.backward(&loss).unwrap();
        // d/dw (w*2 - 1)^2 = 2 * 1 * 2
        assert_eq!(model.params[WEIGHT].grad, Some(vec![4.0]));
        assert_eq!(model.params[BIAS].grad, Some(vec![2.0]));
    }

    #[test]
    fn test_backward_needs_forward_with_grad() {
        let mut model = model_with(vec![1.0], 0.0);
        model.set_grad_enabled(false);
        let outputs = model.forward(vec![vec![2.0]]).unwrap();
        let loss = mse_loss(&outputs, Some(&vec![1.0])).unwrap();
        assert!(model.backward(&loss).is_err());
    }

    #[test]
    fn test_state_dict_round_trip_is_exact() {
        let mut rng = RandomSources::seeded(3);
        let model = LinearRegression::new(4, &mut rng);
        let mut other = LinearRegression::new(4, &mut rng);
        assert_ne!(model.weight(), other.weight());
        other.load_state_dict(&model.state_dict(), true).unwrap();
        assert_eq!(model.weight(), other.weight());
        assert_eq!(model.bias(), other.bias());
    }

    #[test]
    fn test_strict_load_rejects_missing_keys() {
        let mut model = model_with(vec![1.0], 0.25);
        let partial = json!({ "weight": [3.0] });
        assert!(model.load_state_dict(&partial, true).is_err());
        model.load_state_dict(&partial, false).unwrap();
        assert_eq!(model.weight(), &[3.0]);
        assert_eq!(model.bias(), 0.25);
    }

    #[test]
    fn test_sgd_step_and_state() {
        let mut params = vec![Parameter::new("w", vec![1.0])];
        params[0].grad = Some(vec![0.5]);
        let mut sgd = Sgd::new(0.1);
        sgd.step(&mut params).unwrap();
        assert!((params[0].value[0] - 0.95).abs() < 1e-6);
        assert_eq!(sgd.steps, 1);

        let mut restored = Sgd::new(1.0);
        restored.load_state_dict(&sgd.state_dict()).unwrap();
        assert_eq!(restored, sgd);
        assert_eq!(sgd.param_groups()[0]["lr"], 0.1);
    }

    #[test]
    fn test_training_split_shuffles_from_run_sources() {
        let mut gen = ChaCha8Rng::seed_from_u64(1);
        let data = SyntheticRegression::generate(10, 2, 4, 0.1, &mut gen).unwrap();
        let sizes: Vec<usize> = data
            .batches(&mut RandomSources::seeded(0))
            .map(|b| b.targets.len())
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let first: Vec<_> = data.batches(&mut RandomSources::seeded(5)).collect();
        let again: Vec<_> = data.batches(&mut RandomSources::seeded(5)).collect();
        assert_eq!(first, again);

        let mut random = RandomSources::seeded(5);
        let before = random.snapshot();
        let _ = data.batches(&mut random).count();
        assert_ne!(random.snapshot(), before);
    }

    #[test]
    fn test_validation_split_is_fixed() {
        let mut gen = ChaCha8Rng::seed_from_u64(1);
        let (_, val) = SyntheticRegression::generate_split(8, 6, 2, 4, 0.1, &mut gen).unwrap();
        let mut random = RandomSources::seeded(0);
        let before = random.snapshot();
        let a: Vec<_> = val.batches(&mut random).collect();
        let b: Vec<_> = val.batches(&mut RandomSources::seeded(9)).collect();
        assert_eq!(a, b);
        assert_eq!(random.snapshot(), before);
    }

    #[test]
    fn test_forward_step_computes_loss() {
        let mut model = model_with(vec![1.0], 0.0);
        let mut step = LinearRegression::forward_step();
        let batch = RegressionBatch {
            features: vec![vec![1.0], vec![2.0]],
            targets: vec![1.0, 1.0],
        };
        let result = step.call(&mut model, batch).unwrap();
        assert_eq!(result.outputs, vec![1.0, 2.0]);
        assert!((result.loss.as_ref().unwrap().value - 0.5).abs() < 1e-9);
    }
}
