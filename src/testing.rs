//! Scripted collaborators shared by the unit tests.

use std::cell::Cell;
use std::rc::Rc;

use serde_json::{json, Value};

use crate::model::{
    BoxError, Dataset, Optimizer, ParamGroup, Parameter, StateDict, Stateful, Trainable,
};
use crate::rng::RandomSources;
use crate::step::ForwardStep;

/// Batch value marking a training-set batch.
pub const TRAIN_BATCH: f64 = 0.0;
/// Batch value marking a validation-set batch.
pub const VAL_BATCH: f64 = 1.0;

/// Model whose forward pass is the identity and whose state is the running
/// sum of every loss it was trained on.
#[derive(Debug, Clone)]
pub struct ScriptedModel {
    pub weight: f64,
    pub params: Vec<Parameter>,
    pub training: bool,
    pub grad_enabled: bool,
    pub backward_calls: usize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        ScriptedModel {
            weight: 0.0,
            params: vec![Parameter::new("w", vec![0.0])],
            training: true,
            grad_enabled: true,
            backward_calls: 0,
        }
    }
}

impl Trainable for ScriptedModel {
    type Batch = f64;
    type Input = f64;
    type Output = f64;
    type Target = f64;
    type Loss = f64;

    fn name(&self) -> &str {
        "ScriptedModel"
    }

    fn forward(&mut self, input: f64) -> Result<f64, BoxError> {
        Ok(input)
    }

    fn backward(&mut self, loss: &f64) -> Result<(), BoxError> {
        self.weight += loss;
        self.backward_calls += 1;
        self.params[0].grad = Some(vec![*loss as f32]);
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn state_dict(&self) -> StateDict {
        json!({ "weight": self.weight })
    }

    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<(), BoxError> {
        match state.get("weight").and_then(Value::as_f64) {
            Some(weight) => self.weight = weight,
            None if strict => return Err("missing key `weight`".into()),
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
    }
}

/// Counts its steps; `extra_groups` adds parameter groups sharing `lr`.
#[derive(Debug, Clone)]
pub struct ScriptedOptimizer {
    pub lr: f64,
    pub steps: u64,
    pub extra_groups: usize,
}

impl ScriptedOptimizer {
    pub fn new(lr: f64) -> Self {
        ScriptedOptimizer {
            lr,
            steps: 0,
            extra_groups: 0,
        }
    }
}

impl Optimizer for ScriptedOptimizer {
    fn step(&mut self, _params: &mut [Parameter]) -> Result<(), BoxError> {
        self.steps += 1;
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        json!({ "lr": self.lr, "steps": self.steps })
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), BoxError> {
        self.lr = state
            .get("lr")
            .and_then(Value::as_f64)
            .ok_or("missing key `lr`")?;
        self.steps = state
            .get("steps")
            .and_then(Value::as_u64)
            .ok_or("missing key `steps`")?;
        Ok(())
    }

    fn param_groups(&self) -> Vec<ParamGroup> {
        (0..=self.extra_groups)
            .map(|_| ParamGroup::from([("lr".to_string(), self.lr)]))
            .collect()
    }
}

/// Extension holding one integer; resets to zero when given no state.
pub struct Counter(pub i64);

impl Stateful for Counter {
    fn state_dict(&self) -> StateDict {
        json!(self.0)
    }

    fn load_state_dict(&mut self, state: Option<&StateDict>) -> Result<(), BoxError> {
        self.0 = match state {
            Some(value) => value.as_i64().ok_or("counter state is not an integer")?,
            None => 0,
        };
        Ok(())
    }
}

/// Fixed sequence of batches, ignoring randomness.
pub struct ScriptedData(pub Vec<f64>);

impl Dataset for ScriptedData {
    type Batch = f64;

    fn batches<'a>(
        &'a self,
        _rng: &'a mut RandomSources,
    ) -> Box<dyn Iterator<Item = f64> + 'a> {
        Box::new(self.0.iter().copied())
    }
}

/// Step whose losses follow a script.
///
/// In training mode the n-th call returns `train[n]`. In inference mode a
/// [`VAL_BATCH`] returns the next entry of `val`, any other batch returns
/// `baseline`. Scripts repeat their last entry once exhausted.
pub fn scripted_step(train: Vec<f64>, val: Vec<f64>, baseline: f64) -> ForwardStep<ScriptedModel> {
    let train_calls = Rc::new(Cell::new(0usize));
    let val_calls = Rc::new(Cell::new(0usize));
    ForwardStep::new(move |model: &mut ScriptedModel, batch: &f64| {
        let next = |script: &[f64], calls: &Cell<usize>| {
            let i = calls.get();
            calls.set(i + 1);
            script
                .get(i)
                .or(script.last())
                .copied()
                .unwrap_or(f64::NAN)
        };
        let loss = if model.is_training() {
            next(&train, &train_calls)
        } else if *batch == VAL_BATCH {
            next(&val, &val_calls)
        } else {
            baseline
        };
        let outputs = model.forward(*batch)?;
        Ok::<_, BoxError>((outputs, *batch, loss))
    })
}
