use std::rc::Rc;

use crate::error::TrainingError;
use crate::metrics::{normalize_metrics, Finalize, MetricValue, Metrics, MetricsAverage, RunningMean};
use crate::model::{evaluating, Device, Loss, ToDevice, Trainable};
use crate::step::{ForwardStep, StepResult};

/// Computes per-batch metrics from a step result.
pub type CalcMetrics<M> = Rc<dyn Fn(&M, &StepResult<M>) -> Metrics>;

/// `{ "loss": result.loss }`, or nothing when the step produced no loss.
pub fn default_calc_metrics<M: Trainable>(_model: &M, result: &StepResult<M>) -> Metrics {
    let mut metrics = Metrics::new();
    if let Some(loss) = &result.loss {
        metrics.insert("loss".to_string(), MetricValue::Scalar(loss.item()));
    }
    metrics
}

/// Calculator, reducer and finalizer used for one kind of pass.
pub struct MetricsPipeline<M: Trainable> {
    pub calc: CalcMetrics<M>,
    pub averager: Box<dyn MetricsAverage>,
    pub finalizer: Option<Rc<dyn Finalize>>,
}

impl<M: Trainable + 'static> MetricsPipeline<M> {
    /// Default calculator with a running mean and no finalizer.
    pub fn new() -> Self {
        MetricsPipeline {
            calc: Rc::new(default_calc_metrics::<M>),
            averager: Box::new(RunningMean::new()),
            finalizer: None,
        }
    }
}

impl<M: Trainable + 'static> Default for MetricsPipeline<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Trainable> MetricsPipeline<M> {
    /// Empty running state for a new pass.
    pub fn begin(&mut self) -> Metrics {
        let mut running = Metrics::new();
        self.averager.init(&mut running);
        running
    }

    /// Normalized metrics of one batch.
    pub fn compute(&self, model: &M, result: &StepResult<M>) -> Metrics {
        normalize_metrics((self.calc)(model, result))
    }

    pub fn observe(&mut self, running: &mut Metrics, model: &M, result: &StepResult<M>) {
        let batch = self.compute(model, result);
        self.averager.accumulate(running, &batch);
    }

    pub fn finish(&self, running: Metrics, batches: usize) -> Metrics {
        match &self.finalizer {
            Some(finalizer) => finalizer.finalize(running, batches),
            None => running,
        }
    }
}

/// Run one batch in inference mode and return its normalized metrics.
///
/// The step's result stays available through [`ForwardStep::last_result`].
pub fn evaluate_batch<M: Trainable>(
    model: &mut M,
    batch: M::Batch,
    step: &mut ForwardStep<M>,
    calc: &dyn Fn(&M, &StepResult<M>) -> Metrics,
    device: Device,
) -> Result<Metrics, TrainingError> {
    let mut model = evaluating(model);
    let result = step.call(&mut *model, batch.to_device(device))?;
    Ok(normalize_metrics(calc(&*model, result)))
}

/// Fold a full inference pass over `batches` into finalized metrics.
pub fn evaluate<M, I>(
    model: &mut M,
    batches: I,
    step: &mut ForwardStep<M>,
    pipeline: &mut MetricsPipeline<M>,
    device: Device,
) -> Result<Metrics, TrainingError>
where
    M: Trainable,
    I: IntoIterator<Item = M::Batch>,
{
    let mut model = evaluating(model);
    let mut running = pipeline.begin();
    let mut seen = 0;
    for batch in batches {
        let result = step.call(&mut *model, batch.to_device(device))?;
        pipeline.observe(&mut running, &*model, result);
        seen += 1;
    }
    if seen == 0 {
        return Err(TrainingError::EmptyDataset);
    }
    Ok(pipeline.finish(running, seen))
}

/// Scalar `name` from finalized metrics.
pub fn scalar_metric(metrics: &Metrics, name: &str) -> Result<f64, TrainingError> {
    metrics
        .get(name)
        .and_then(MetricValue::as_f64)
        .ok_or_else(|| TrainingError::MissingMetric(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{per_batch_mean, RunningSum};
    use crate::model::BoxError;
    use crate::testing::ScriptedModel;

    fn loss_is_input() -> ForwardStep<ScriptedModel> {
        ForwardStep::new(|model: &mut ScriptedModel, batch: &f64| {
            assert!(!model.is_training());
            assert!(!model.grad_enabled);
            Ok::<_, BoxError>((*batch, *batch, *batch))
        })
    }

    #[test]
    fn test_evaluate_restores_training_mode() {
        let mut model = ScriptedModel::new();
        model.train();
        let mut step = loss_is_input();
        let mut pipeline = MetricsPipeline::new();
        let metrics = evaluate(
            &mut model,
            vec![1.0, 2.0, 6.0],
            &mut step,
            &mut pipeline,
            Device::Cpu,
        )
        .unwrap();
        assert_eq!(scalar_metric(&metrics, "loss").unwrap(), 3.0);
        assert!(model.is_training());
        assert!(model.grad_enabled);
        assert_eq!(step.last_result().unwrap().outputs, 6.0);
    }

    #[test]
    fn test_evaluate_with_finalizer() {
        let mut model = ScriptedModel::new();
        let mut step = loss_is_input();
        let mut pipeline = MetricsPipeline::<ScriptedModel> {
            averager: Box::new(RunningSum),
            finalizer: Some(Rc::new(per_batch_mean)),
            ..MetricsPipeline::new()
        };
        let metrics =
            evaluate(&mut model, vec![2.0, 4.0], &mut step, &mut pipeline, Device::Cpu).unwrap();
        assert_eq!(scalar_metric(&metrics, "loss").unwrap(), 3.0);
    }

    #[test]
    fn test_evaluate_empty_dataset() {
        let mut model = ScriptedModel::new();
        let mut step = loss_is_input();
        let mut pipeline = MetricsPipeline::new();
        let err = evaluate(&mut model, Vec::new(), &mut step, &mut pipeline, Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, TrainingError::EmptyDataset));
    }

    #[test]
    fn test_evaluate_batch_normalizes() {
        let mut model = ScriptedModel::new();
        let mut step = loss_is_input();
        let calc = |_: &ScriptedModel, r: &StepResult<ScriptedModel>| {
            let mut m = Metrics::new();
            m.insert(
                "loss".into(),
                burn::tensor::TensorData::new(vec![r.outputs as f32], [1]).into(),
            );
            m
        };
        let metrics = evaluate_batch(&mut model, 0.5, &mut step, &calc, Device::Cpu).unwrap();
        assert_eq!(metrics["loss"], MetricValue::Scalar(0.5));
    }

    #[test]
    fn test_missing_loss_metric() {
        let metrics = Metrics::new();
        let err = scalar_metric(&metrics, "loss").unwrap_err();
        assert!(matches!(err, TrainingError::MissingMetric(ref name) if name == "loss"));
    }
}
