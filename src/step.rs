//! Per-batch step functions and the uniform result they produce.
//!
//! User code plugs into the loop through a step function `f(model, &batch)`.
//! Whatever shape it returns is folded into a [`ForwardResult`] right here,
//! so the trainer, the metrics calculator and the summary writer only ever
//! see one record type.

use crate::model::{BoxError, Trainable};

/// Outcome of one forward step.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardResult<O, T, L> {
    pub outputs: O,
    pub targets: Option<T>,
    pub loss: Option<L>,
}

impl<O, T, L> ForwardResult<O, T, L> {
    pub fn new(outputs: O, targets: Option<T>, loss: Option<L>) -> Self {
        ForwardResult {
            outputs,
            targets,
            loss,
        }
    }

    pub fn outputs(outputs: O) -> Self {
        ForwardResult::new(outputs, None, None)
    }
}

/// [`ForwardResult`] specialised to a model's associated types.
pub type StepResult<M> = ForwardResult<
    <M as Trainable>::Output,
    <M as Trainable>::Target,
    <M as Trainable>::Loss,
>;

/// Shapes a step function may return.
#[derive(Debug, Clone, PartialEq)]
pub enum StepReturn<O, T, L> {
    Record(ForwardResult<O, T, L>),
    Tuple(O, Option<T>, Option<L>),
    Bare(O),
}

impl<O, T, L> StepReturn<O, T, L> {
    pub fn into_result(self) -> ForwardResult<O, T, L> {
        match self {
            StepReturn::Record(result) => result,
            StepReturn::Tuple(outputs, targets, loss) => ForwardResult::new(outputs, targets, loss),
            StepReturn::Bare(outputs) => ForwardResult::outputs(outputs),
        }
    }
}

impl<O, T, L> From<ForwardResult<O, T, L>> for StepReturn<O, T, L> {
    fn from(result: ForwardResult<O, T, L>) -> Self {
        StepReturn::Record(result)
    }
}

impl<O, T, L> From<(O,)> for StepReturn<O, T, L> {
    fn from((outputs,): (O,)) -> Self {
        StepReturn::Tuple(outputs, None, None)
    }
}

impl<O, T, L> From<(O, T)> for StepReturn<O, T, L> {
    fn from((outputs, targets): (O, T)) -> Self {
        StepReturn::Tuple(outputs, Some(targets), None)
    }
}

impl<O, T, L> From<(O, T, L)> for StepReturn<O, T, L> {
    fn from((outputs, targets, loss): (O, T, L)) -> Self {
        StepReturn::Tuple(outputs, Some(targets), Some(loss))
    }
}

type StepBox<M> = Box<
    dyn FnMut(&mut M, &<M as Trainable>::Batch) -> Result<StepResult<M>, BoxError>,
>;

/// Adapter around a user step function.
///
/// Remembers the most recent batch and result so epoch-end consumers (the
/// summary writer) can look at the last batch.
pub struct ForwardStep<M: Trainable> {
    step: StepBox<M>,
    last_batch: Option<M::Batch>,
    last_result: Option<StepResult<M>>,
}

impl<M: Trainable + 'static> ForwardStep<M> {
    /// Wrap a step function returning any [`StepReturn`] shape.
    pub fn new<F, R>(mut step: F) -> Self
    where
        F: FnMut(&mut M, &M::Batch) -> Result<R, BoxError> + 'static,
        R: Into<StepReturn<M::Output, M::Target, M::Loss>>,
    {
        ForwardStep {
            step: Box::new(move |model: &mut M, batch: &M::Batch| {
                let shape: StepReturn<M::Output, M::Target, M::Loss> = step(model, batch)?.into();
                Ok(shape.into_result())
            }),
            last_batch: None,
            last_result: None,
        }
    }
}

impl<M: Trainable> ForwardStep<M> {
    pub fn call(&mut self, model: &mut M, batch: M::Batch) -> Result<&StepResult<M>, BoxError> {
        let batch = self.last_batch.insert(batch);
        let result = (self.step)(model, batch)?;
        Ok(self.last_result.insert(result))
    }

    pub fn last_batch(&self) -> Option<&M::Batch> {
        self.last_batch.as_ref()
    }

    pub fn last_result(&self) -> Option<&StepResult<M>> {
        self.last_result.as_ref()
    }
}

type Getter<B, V> = Box<dyn Fn(&B) -> V>;
type Criterion<M> = Box<
    dyn Fn(
        &<M as Trainable>::Output,
        Option<&<M as Trainable>::Target>,
    ) -> Result<<M as Trainable>::Loss, BoxError>,
>;

/// Composes a [`ForwardStep`] from small pieces.
///
/// The criterion sees the raw model outputs, before `outputs_postprocess`
/// runs. When no targets getter is set it is called with `None`.
pub struct ForwardStepBuilder<M: Trainable> {
    inputs: Getter<M::Batch, M::Input>,
    targets: Option<Getter<M::Batch, M::Target>>,
    criterion: Option<Criterion<M>>,
    preprocess: Option<Box<dyn Fn(M::Input) -> M::Input>>,
    postprocess: Option<Box<dyn Fn(M::Output) -> M::Output>>,
}

impl<M: Trainable + 'static> ForwardStepBuilder<M> {
    pub fn new(inputs: impl Fn(&M::Batch) -> M::Input + 'static) -> Self {
        ForwardStepBuilder {
            inputs: Box::new(inputs),
            targets: None,
            criterion: None,
            preprocess: None,
            postprocess: None,
        }
    }

    pub fn targets(mut self, getter: impl Fn(&M::Batch) -> M::Target + 'static) -> Self {
        self.targets = Some(Box::new(getter));
        self
    }

    pub fn criterion(
        mut self,
        criterion: impl Fn(&M::Output, Option<&M::Target>) -> Result<M::Loss, BoxError> + 'static,
    ) -> Self {
        self.criterion = Some(Box::new(criterion));
        self
    }

    pub fn inputs_preprocess(mut self, f: impl Fn(M::Input) -> M::Input + 'static) -> Self {
        self.preprocess = Some(Box::new(f));
        self
    }

    pub fn outputs_postprocess(mut self, f: impl Fn(M::Output) -> M::Output + 'static) -> Self {
        self.postprocess = Some(Box::new(f));
        self
    }

    pub fn build(self) -> ForwardStep<M> {
        let ForwardStepBuilder {
            inputs,
            targets,
            criterion,
            preprocess,
            postprocess,
        } = self;
        ForwardStep::new(move |model: &mut M, batch: &M::Batch| {
            let mut input = inputs(batch);
            if let Some(pre) = &preprocess {
                input = pre(input);
            }
            let mut outputs = model.forward(input)?;
            let targets = targets.as_ref().map(|get| get(batch));
            let loss = match &criterion {
                Some(criterion) => Some(criterion(&outputs, targets.as_ref())?),
                None => None,
            };
            if let Some(post) = &postprocess {
                outputs = post(outputs);
            }
            Ok(ForwardResult::new(outputs, targets, loss))
        })
    }
}
