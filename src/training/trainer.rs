use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::checkpoint::{
    load_checkpoint, BestCheckpoint, BestSource, CheckpointRecord, CheckpointStore,
};
use crate::error::{ConfigError, SinkError, TrainingError};
use crate::metrics::{AverageKind, Ema, Finalize, Metrics, MetricsAverage, RunningMean};
use crate::model::{
    Dataset, Device, Extension, LossScaler, Optimizer, ParamOp, ToDevice, Trainable,
};
use crate::rng::RandomSources;
use crate::step::{ForwardStep, StepResult};
use crate::summary::{
    flush_sink, DefaultSummary, JsonlSummaryWriter, SummaryContext, SummarySink, SummaryWriter,
};
use crate::training::eval::{
    default_calc_metrics, evaluate, evaluate_batch, scalar_metric, CalcMetrics, MetricsPipeline,
};

/// Checkpoint directory under the training directory.
pub const CHECKPOINTS_DIR: &str = "ckpts";
/// Summary directory under the training directory.
pub const SUMMARY_DIR: &str = "summary";

/// Trainer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub training_dir: PathBuf,
    pub epochs_per_summary: usize,
    pub epochs_per_checkpoint: usize,
    /// Maximum number of numbered checkpoints kept; unlimited when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoints_limit: Option<usize>,
    pub seed: u64,
    pub device: Device,
    /// Fail a resume when a registered extension has no saved state.
    pub strict_resume: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            epochs: 10,
            training_dir: PathBuf::from("training"),
            epochs_per_summary: 1,
            epochs_per_checkpoint: 1,
            checkpoints_limit: None,
            seed: 0,
            device: Device::Cpu,
            strict_resume: false,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.epochs == 0 {
            return Err(ConfigError::Validation(
                "training.epochs must be > 0".into(),
            ));
        }
        if self.epochs_per_summary == 0 {
            return Err(ConfigError::Validation(
                "training.epochs_per_summary must be > 0".into(),
            ));
        }
        if self.epochs_per_checkpoint == 0 {
            return Err(ConfigError::Validation(
                "training.epochs_per_checkpoint must be > 0".into(),
            ));
        }
        CheckpointStore::validate_limit(self.checkpoints_limit)
    }
}

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    /// Step the run started from: 0 on a cold start, the checkpoint step on resume.
    pub start_step: usize,
    pub final_step: usize,
    /// Finalized training loss per epoch.
    pub losses: Vec<(usize, f64)>,
    /// Validation loss per validated epoch.
    pub val_losses: Vec<(usize, f64)>,
    pub best: Option<BestCheckpoint>,
    /// Numbered checkpoints on disk when the run finished.
    pub checkpoints: Vec<usize>,
}

type SinkFactory = Box<dyn Fn(&Path) -> Result<Box<dyn SummarySink>, SinkError>>;

fn jsonl_sink(dir: &Path) -> Result<Box<dyn SummarySink>, SinkError> {
    Ok(Box::new(JsonlSummaryWriter::open(dir)?))
}

/// Epoch-based training driver.
///
/// Owns the model, the optimizer and all collaborators for the duration of
/// a run. Everything optional is injected through the `with_*` methods;
/// anything not supplied falls back to a named default.
pub struct Trainer<M: Trainable, O: Optimizer> {
    config: TrainerConfig,
    model: M,
    optimizer: O,
    step: ForwardStep<M>,
    train_data: Box<dyn Dataset<Batch = M::Batch>>,
    val_data: Option<Box<dyn Dataset<Batch = M::Batch>>>,
    train_metrics: MetricsPipeline<M>,
    val_calc: Option<CalcMetrics<M>>,
    val_averager: Option<Box<dyn MetricsAverage>>,
    val_finalizer: Option<Rc<dyn Finalize>>,
    summary: Box<dyn SummaryWriter<M, O>>,
    param_ops: Vec<Box<dyn ParamOp>>,
    scaler: Option<Box<dyn LossScaler<M>>>,
    extensions: Vec<Extension>,
    sink_factory: SinkFactory,
    random: RandomSources,
}

impl<M, O> Trainer<M, O>
where
    M: Trainable + 'static,
    O: Optimizer + 'static,
{
    pub fn new(
        config: TrainerConfig,
        model: M,
        optimizer: O,
        step: ForwardStep<M>,
        train_data: impl Dataset<Batch = M::Batch> + 'static,
    ) -> Self {
        let mut random = RandomSources::seeded(config.seed);
        if config.device.is_accelerator() {
            random = random.with_device();
        }
        Trainer {
            config,
            model,
            optimizer,
            step,
            train_data: Box::new(train_data),
            val_data: None,
            train_metrics: MetricsPipeline {
                calc: Rc::new(default_calc_metrics::<M>),
                averager: Box::new(Ema::default()),
                finalizer: None,
            },
            val_calc: None,
            val_averager: None,
            val_finalizer: None,
            summary: Box::new(DefaultSummary),
            param_ops: Vec::new(),
            scaler: None,
            extensions: Vec::new(),
            sink_factory: Box::new(jsonl_sink),
            random,
        }
    }

    pub fn with_validation(mut self, data: impl Dataset<Batch = M::Batch> + 'static) -> Self {
        self.val_data = Some(Box::new(data));
        self
    }

    /// Per-batch metrics calculator; must produce a scalar `loss`.
    pub fn with_metrics(mut self, calc: impl Fn(&M, &StepResult<M>) -> Metrics + 'static) -> Self {
        self.train_metrics.calc = Rc::new(calc);
        self
    }

    pub fn with_averager(mut self, averager: impl MetricsAverage + 'static) -> Self {
        self.train_metrics.averager = Box::new(averager);
        self
    }

    pub fn with_finalizer(mut self, finalizer: impl Finalize + 'static) -> Self {
        self.train_metrics.finalizer = Some(Rc::new(finalizer));
        self
    }

    /// Reducer and matching finalizer picked by configuration, for both
    /// training and validation passes.
    pub fn with_average_kind(mut self, kind: AverageKind, ema_decay: f64) -> Self {
        let finalizer = kind.finalizer().map(Rc::<dyn Finalize>::from);
        self.train_metrics.averager = kind.build(ema_decay);
        self.train_metrics.finalizer = finalizer.clone();
        self.val_averager = Some(kind.build(ema_decay));
        self.val_finalizer = finalizer;
        self
    }

    pub fn with_validation_metrics(
        mut self,
        calc: impl Fn(&M, &StepResult<M>) -> Metrics + 'static,
    ) -> Self {
        self.val_calc = Some(Rc::new(calc));
        self
    }

    pub fn with_validation_averager(mut self, averager: impl MetricsAverage + 'static) -> Self {
        self.val_averager = Some(Box::new(averager));
        self
    }

    pub fn with_validation_finalizer(mut self, finalizer: impl Finalize + 'static) -> Self {
        self.val_finalizer = Some(Rc::new(finalizer));
        self
    }

    pub fn with_summary(mut self, writer: impl SummaryWriter<M, O> + 'static) -> Self {
        self.summary = Box::new(writer);
        self
    }

    /// Parameter transforms run after backward, in registration order.
    pub fn with_param_op(mut self, op: impl ParamOp + 'static) -> Self {
        self.param_ops.push(Box::new(op));
        self
    }

    pub fn with_scaler(mut self, scaler: impl LossScaler<M> + 'static) -> Self {
        self.scaler = Some(Box::new(scaler));
        self
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Where summaries go; called with `<training_dir>/summary/{train,valid}`.
    pub fn with_sink_factory(
        mut self,
        factory: impl Fn(&Path) -> Result<Box<dyn SummarySink>, SinkError> + 'static,
    ) -> Self {
        self.sink_factory = Box::new(factory);
        self
    }

    /// Replace the sources seeded from `config.seed`.
    pub fn with_random_sources(mut self, random: RandomSources) -> Self {
        self.random = random;
        self
    }
}

impl<M: Trainable, O: Optimizer> Trainer<M, O> {
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn random(&self) -> &RandomSources {
        &self.random
    }

    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    pub fn into_parts(self) -> (M, O) {
        (self.model, self.optimizer)
    }

    /// Run training up to `config.epochs`.
    ///
    /// Without `resume` the checkpoint and summary directories are wiped and
    /// a baseline inference pass is stored as checkpoint 0. With `resume`
    /// every collaborator and random source is restored from that checkpoint
    /// and training continues from its step.
    pub fn fit(&mut self, resume: Option<&Path>) -> Result<TrainingReport, TrainingError> {
        self.config.validate()?;

        let mut val_metrics = MetricsPipeline {
            calc: self
                .val_calc
                .clone()
                .unwrap_or_else(|| self.train_metrics.calc.clone()),
            averager: self
                .val_averager
                .take()
                .unwrap_or_else(|| Box::new(RunningMean::new())),
            finalizer: self.val_finalizer.clone(),
        };
        let outcome = self.run(resume, &mut val_metrics);
        self.val_averager = Some(val_metrics.averager);
        outcome
    }

    fn run(
        &mut self,
        resume: Option<&Path>,
        val_metrics: &mut MetricsPipeline<M>,
    ) -> Result<TrainingReport, TrainingError> {
        let epochs = self.config.epochs;
        self.model.to_device(self.config.device);

        let resumed = match resume {
            Some(path) => Some((path, self.restore(path)?)),
            None => None,
        };

        let training_dir = self.config.training_dir.clone();
        let checkpoint_dir = training_dir.join(CHECKPOINTS_DIR);
        let summary_dir = training_dir.join(SUMMARY_DIR);
        prepare_dir(&training_dir)?;
        if resumed.is_none() {
            wipe_dir(&checkpoint_dir)?;
            wipe_dir(&summary_dir)?;
        }
        let mut store = CheckpointStore::open(&checkpoint_dir, self.config.checkpoints_limit)?;
        store.prune()?;

        prepare_dir(&summary_dir)?;
        let mut train_sink = (self.sink_factory)(&summary_dir.join("train"))?;
        let mut valid_sink = match self.val_data {
            Some(_) => Some((self.sink_factory)(&summary_dir.join("valid"))?),
            None => None,
        };

        println!("Training started: {}", self.model.name());
        tracing::info!(dir = %training_dir.display(), epochs, "training started");

        let offset = match resumed {
            Some((path, (step, loss))) => {
                println!("epoch #{step}/{epochs} loss: {loss:.3}");
                if store.load_best_pointer()?.is_none() {
                    store.promote_best(step, loss, BestSource::Copy(path))?;
                }
                step
            }
            None => {
                self.baseline(&mut store, &mut *train_sink, valid_sink.as_mut(), val_metrics)?;
                0
            }
        };

        let mut report = TrainingReport {
            start_step: offset,
            final_step: offset.max(epochs),
            ..TrainingReport::default()
        };

        for epoch in offset + 1..=epochs {
            let started = Instant::now();
            let metrics = self.train_epoch()?;
            let loss = scalar_metric(&metrics, "loss")?;
            println!(
                "epoch #{epoch}/{epochs} loss: {loss:.3} -- elapsed {:.3} sec.",
                started.elapsed().as_secs_f64()
            );
            report.losses.push((epoch, loss));

            let summary_due = epoch % self.config.epochs_per_summary == 0;
            if summary_due {
                self.write_summary(&mut *train_sink, &metrics, epoch);
            }

            if epoch % self.config.epochs_per_checkpoint == 0 {
                let path = store.write(&self.capture(epoch, loss))?;
                if self.val_data.is_none() {
                    store.promote_best(epoch, loss, BestSource::Copy(&path))?;
                }
            }

            if let (true, Some(sink)) = (summary_due, valid_sink.as_deref_mut()) {
                if let Some(metrics) = self.validate(val_metrics)? {
                    self.write_summary(sink, &metrics, epoch);
                    let val_loss = scalar_metric(&metrics, "loss")?;
                    report.val_losses.push((epoch, val_loss));
                    // a full re-save: "last" may already be past this epoch
                    if store.best().map_or(true, |best| best.accepts(val_loss)) {
                        let record = self.capture(epoch, val_loss);
                        store.promote_best(epoch, val_loss, BestSource::Record(&record))?;
                    }
                }
            }
        }

        println!("Training finished");
        report.best = store.best();
        report.checkpoints = store.history().steps().to_vec();
        tracing::info!(best = ?report.best, "training finished");
        Ok(report)
    }

    /// Restore every collaborator from `path`; returns its `(step, loss)`.
    fn restore(&mut self, path: &Path) -> Result<(usize, f64), TrainingError> {
        let record = load_checkpoint(path)?;
        let mut restore = record
            .restore()
            .strict(self.config.strict_resume)
            .model(&mut self.model)?
            .optimizer(&mut self.optimizer)?
            .extensions(&mut self.extensions)?;
        if let Some(scaler) = self.scaler.as_deref_mut() {
            restore = restore.scaler(scaler)?;
        }
        let (step, loss) = restore.random_state(&mut self.random).finish();
        tracing::info!(step, loss, path = %path.display(), "resumed from checkpoint");
        Ok((step, loss))
    }

    /// One inference batch of each dataset, summarized at step 0 and stored
    /// as checkpoint 0 and the initial best.
    fn baseline(
        &mut self,
        store: &mut CheckpointStore,
        train_sink: &mut dyn SummarySink,
        valid_sink: Option<&mut Box<dyn SummarySink>>,
        val_metrics: &mut MetricsPipeline<M>,
    ) -> Result<f64, TrainingError> {
        let device = self.config.device;
        // inference passes never advance the run's own random sources
        let mut scratch = self.random.clone();

        let batch = self
            .train_data
            .batches(&mut scratch)
            .next()
            .ok_or(TrainingError::EmptyDataset)?;
        let metrics = evaluate_batch(
            &mut self.model,
            batch,
            &mut self.step,
            &*self.train_metrics.calc,
            device,
        )?;
        let metrics = self.train_metrics.finish(metrics, 1);
        self.write_summary(train_sink, &metrics, 0);
        let loss = scalar_metric(&metrics, "loss")?;

        let val_batch = match self.val_data.as_deref() {
            Some(data) => Some(
                data.batches(&mut scratch)
                    .next()
                    .ok_or(TrainingError::EmptyDataset)?,
            ),
            None => None,
        };
        if let (Some(batch), Some(sink)) = (val_batch, valid_sink) {
            let metrics =
                evaluate_batch(&mut self.model, batch, &mut self.step, &*val_metrics.calc, device)?;
            let metrics = val_metrics.finish(metrics, 1);
            self.write_summary(&mut **sink, &metrics, 0);
        }

        println!("epoch #0/{} loss: {loss:.3}", self.config.epochs);
        let path = store.write(&self.capture(0, loss))?;
        store.promote_best(0, loss, BestSource::Copy(&path))?;
        Ok(loss)
    }

    fn train_epoch(&mut self) -> Result<Metrics, TrainingError> {
        let device = self.config.device;
        let mut running = self.train_metrics.begin();
        self.model.train();

        let mut seen = 0;
        for batch in self.train_data.batches(&mut self.random) {
            let batch = batch.to_device(device);
            self.optimizer.zero_grad(self.model.parameters_mut());

            let result = self.step.call(&mut self.model, batch)?;
            let loss = result.loss.as_ref().ok_or(TrainingError::MissingLoss)?;
            match self.scaler.as_deref_mut() {
                Some(scaler) => scaler.backward(&mut self.model, loss)?,
                None => self.model.backward(loss)?,
            }
            for op in &mut self.param_ops {
                op.apply(self.model.parameters_mut());
            }
            self.optimizer.step(self.model.parameters_mut())?;

            self.train_metrics
                .observe(&mut running, &self.model, result);
            seen += 1;
        }
        if seen == 0 {
            return Err(TrainingError::EmptyDataset);
        }
        Ok(self.train_metrics.finish(running, seen))
    }

    fn validate(
        &mut self,
        pipeline: &mut MetricsPipeline<M>,
    ) -> Result<Option<Metrics>, TrainingError> {
        let mut scratch = self.random.clone();
        let Some(data) = self.val_data.as_deref() else {
            return Ok(None);
        };
        let metrics = evaluate(
            &mut self.model,
            data.batches(&mut scratch),
            &mut self.step,
            pipeline,
            self.config.device,
        )?;
        Ok(Some(metrics))
    }

    fn write_summary(&mut self, sink: &mut dyn SummarySink, metrics: &Metrics, step: usize) {
        let ctx = SummaryContext {
            model: &self.model,
            optimizer: &self.optimizer,
            metrics,
            step,
            batch: self.step.last_batch(),
            result: self.step.last_result(),
        };
        self.summary.write(sink, &ctx);
        flush_sink(sink);
    }

    fn capture(&self, step: usize, loss: f64) -> CheckpointRecord {
        CheckpointRecord::capture(&self.model, &self.optimizer, &self.random, step, loss)
            .with_extensions(&self.extensions)
            .with_scaler(self.scaler.as_ref().map(|s| s.state_dict()))
    }
}

fn prepare_dir(path: &Path) -> Result<(), TrainingError> {
    fs::create_dir_all(path).map_err(|source| TrainingError::Directory {
        path: path.to_path_buf(),
        source,
    })
}

fn wipe_dir(path: &Path) -> Result<(), TrainingError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(TrainingError::Directory {
            path: path.to_path_buf(),
            source,
        }),
    }
}
