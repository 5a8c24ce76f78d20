//! Collaborator contracts the training loop drives.
//!
//! The loop never computes anything numerical itself. The trainable unit,
//! its optimizer, loss scaling, datasets and checkpoint extensions all live
//! behind the traits in this module.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};

use crate::rng::RandomSources;

/// Error type returned by collaborator implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Serializable snapshot of a collaborator's state.
pub type StateDict = serde_json::Value;

/// Hyperparameters of one optimizer parameter group, e.g. `lr`, `momentum`.
pub type ParamGroup = BTreeMap<String, f64>;

/// Compute context a model and its batches live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Accelerator(usize),
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

/// A named trainable tensor with its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: Vec<f32>,
    pub grad: Option<Vec<f32>>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Vec<f32>) -> Self {
        Parameter {
            name: name.into(),
            value,
            grad: None,
        }
    }

    /// L2 norm of the accumulated gradient, if any.
    pub fn grad_norm(&self) -> Option<f32> {
        self.grad
            .as_ref()
            .map(|g| g.iter().map(|v| v * v).sum::<f32>().sqrt())
    }
}

/// Scalar view of a loss value.
pub trait Loss {
    fn item(&self) -> f64;
}

impl Loss for f64 {
    fn item(&self) -> f64 {
        *self
    }
}

impl Loss for f32 {
    fn item(&self) -> f64 {
        f64::from(*self)
    }
}

impl Loss for TensorData {
    fn item(&self) -> f64 {
        self.iter::<f64>().next().unwrap_or(f64::NAN)
    }
}

/// Moves a batch onto a compute device.
pub trait ToDevice: Sized {
    fn to_device(self, device: Device) -> Self;
}

impl<T: ToDevice> ToDevice for Vec<T> {
    fn to_device(self, device: Device) -> Self {
        self.into_iter().map(|item| item.to_device(device)).collect()
    }
}

macro_rules! host_resident {
    ($($ty:ty),*) => {
        $(impl ToDevice for $ty {
            fn to_device(self, _device: Device) -> Self {
                self
            }
        })*
    };
}

host_resident!(f32, f64, i64, usize, TensorData);

/// The trainable unit: parameters, a mode toggle, and a state snapshot pair.
pub trait Trainable {
    type Batch: ToDevice;
    type Input;
    type Output;
    type Target;
    type Loss: Loss;

    /// Name printed when training starts.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn forward(&mut self, input: Self::Input) -> Result<Self::Output, BoxError>;

    /// Accumulate gradients of `loss` into the parameters.
    fn backward(&mut self, loss: &Self::Loss) -> Result<(), BoxError>;

    fn parameters(&self) -> &[Parameter];
    fn parameters_mut(&mut self) -> &mut [Parameter];

    fn state_dict(&self) -> StateDict;
    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<(), BoxError>;

    fn train(&mut self);
    fn eval(&mut self);
    fn is_training(&self) -> bool;

    /// Toggle gradient tracking. Models without a tape can ignore this.
    fn set_grad_enabled(&mut self, _enabled: bool) {}

    fn to_device(&mut self, _device: Device) {}
}

/// Parameter-update rule with internal state.
pub trait Optimizer {
    fn step(&mut self, params: &mut [Parameter]) -> Result<(), BoxError>;

    fn zero_grad(&mut self, params: &mut [Parameter]) {
        for param in params {
            param.grad = None;
        }
    }

    fn state_dict(&self) -> StateDict;
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), BoxError>;
    fn param_groups(&self) -> Vec<ParamGroup>;
}

/// Extra module persisted alongside the model, e.g. an EMA of the weights.
///
/// `load_state_dict` receives `None` when a non-strict load finds no saved
/// state for this module.
pub trait Stateful {
    fn state_dict(&self) -> StateDict;
    fn load_state_dict(&mut self, state: Option<&StateDict>) -> Result<(), BoxError>;
}

/// A [`Stateful`] module registered under a checkpoint key.
pub struct Extension {
    pub name: String,
    pub module: Box<dyn Stateful>,
}

impl Extension {
    pub fn new(name: impl Into<String>, module: impl Stateful + 'static) -> Self {
        Extension {
            name: name.into(),
            module: Box::new(module),
        }
    }
}

/// Optional loss-scaling collaborator wrapping the backward pass.
pub trait LossScaler<M: Trainable> {
    fn backward(&mut self, model: &mut M, loss: &M::Loss) -> Result<(), BoxError>;
    fn state_dict(&self) -> StateDict;
    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), BoxError>;
}

/// Restartable, finite source of batches.
///
/// Every call to `batches` starts a new pass. Any randomness (shuffling,
/// augmentation) must be drawn from `rng` so that resumed runs replay it.
pub trait Dataset {
    type Batch;

    fn batches<'a>(
        &'a self,
        rng: &'a mut RandomSources,
    ) -> Box<dyn Iterator<Item = Self::Batch> + 'a>;
}

/// Transform applied to the parameters between backward and optimizer step.
pub trait ParamOp {
    fn apply(&mut self, params: &mut [Parameter]);
}

impl<F: FnMut(&mut [Parameter])> ParamOp for F {
    fn apply(&mut self, params: &mut [Parameter]) {
        self(params)
    }
}

/// Rescales all gradients so their joint L2 norm is at most `max_norm`.
#[derive(Debug, Clone, Copy)]
pub struct ClipGradNorm {
    pub max_norm: f32,
}

impl ClipGradNorm {
    pub fn new(max_norm: f32) -> Self {
        ClipGradNorm { max_norm }
    }
}

impl ParamOp for ClipGradNorm {
    fn apply(&mut self, params: &mut [Parameter]) {
        let total = params
            .iter()
            .filter_map(|p| p.grad.as_ref())
            .flat_map(|g| g.iter())
            .map(|v| v * v)
            .sum::<f32>()
            .sqrt();
        if total <= self.max_norm || total == 0.0 {
            return;
        }
        let scale = self.max_norm / (total + 1e-6);
        for grad in params.iter_mut().filter_map(|p| p.grad.as_mut()) {
            grad.iter_mut().for_each(|v| *v *= scale);
        }
    }
}

/// Puts a model in inference mode with gradient tracking off for the
/// guard's lifetime, then restores the previous mode.
pub struct Evaluating<'a, M: Trainable> {
    model: &'a mut M,
    was_training: bool,
}

pub fn evaluating<M: Trainable>(model: &mut M) -> Evaluating<'_, M> {
    let was_training = model.is_training();
    model.eval();
    model.set_grad_enabled(false);
    Evaluating {
        model,
        was_training,
    }
}

impl<M: Trainable> Deref for Evaluating<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        &*self.model
    }
}

impl<M: Trainable> DerefMut for Evaluating<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut *self.model
    }
}

impl<M: Trainable> Drop for Evaluating<'_, M> {
    fn drop(&mut self) {
        self.model.set_grad_enabled(true);
        if self.was_training {
            self.model.train();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;

    #[test]
    fn test_grad_norm() {
        let mut p = Parameter::new("w", vec![0.0, 0.0]);
        assert_eq!(p.grad_norm(), None);
        p.grad = Some(vec![3.0, 4.0]);
        assert!((p.grad_norm().unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_grad_norm_scales_down() {
        let mut params = vec![
            Parameter {
                name: "a".into(),
                value: vec![0.0],
                grad: Some(vec![3.0]),
            },
            Parameter {
                name: "b".into(),
                value: vec![0.0],
                grad: Some(vec![4.0]),
            },
        ];
        ClipGradNorm::new(1.0).apply(&mut params);
        let total: f32 = params
            .iter()
            .map(|p| p.grad.as_ref().unwrap()[0].powi(2))
            .sum::<f32>()
            .sqrt();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_clip_grad_norm_leaves_small_gradients() {
        let mut params = vec![Parameter {
            name: "a".into(),
            value: vec![0.0],
            grad: Some(vec![0.5]),
        }];
        ClipGradNorm::new(1.0).apply(&mut params);
        assert_eq!(params[0].grad, Some(vec![0.5]));
    }

    #[test]
    fn test_closure_param_op() {
        let mut params = vec![Parameter::new("a", vec![1.0])];
        let mut zero = |ps: &mut [Parameter]| ps.iter_mut().for_each(|p| p.value[0] = 0.0);
        zero.apply(&mut params);
        assert_eq!(params[0].value, vec![0.0]);
    }

    #[test]
    fn test_evaluating_restores_train_mode() {
        let mut model = ScriptedModel::new();
        model.train();
        {
            let guard = evaluating(&mut model);
            assert!(!guard.is_training());
            assert!(!guard.grad_enabled);
        }
        assert!(model.is_training());
        assert!(model.grad_enabled);
    }

    #[test]
    fn test_evaluating_keeps_eval_mode() {
        let mut model = ScriptedModel::new();
        model.eval();
        drop(evaluating(&mut model));
        assert!(!model.is_training());
    }

    #[test]
    fn test_tensor_loss_item() {
        let data = TensorData::new(vec![0.25f32], [1]);
        assert!((data.item() - 0.25).abs() < 1e-9);
    }
}
