//! Scalar summaries written at the end of an epoch.
//!
//! A [`SummarySink`] is a write-only `(name, value, step)` recorder. Failed
//! scalar writes are swallowed one at a time by [`write_scalar`]; gaps in a
//! dashboard never stop a run.

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::rc::Rc;

use serde::Serialize;

use crate::error::SinkError;
use crate::metrics::{MetricValue, Metrics};
use crate::model::{Optimizer, Trainable};
use crate::step::StepResult;

pub trait SummarySink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<(), SinkError>;
    fn flush(&mut self) -> Result<(), SinkError>;
}

/// Best-effort scalar write.
pub fn write_scalar(sink: &mut dyn SummarySink, name: &str, value: f64, step: usize) {
    if let Err(e) = sink.add_scalar(name, value, step) {
        tracing::trace!(name, step, error = %e, "summary write suppressed");
    }
}

/// Best-effort flush.
pub fn flush_sink(sink: &mut dyn SummarySink) {
    if let Err(e) = sink.flush() {
        tracing::trace!(error = %e, "summary flush suppressed");
    }
}

#[derive(Serialize)]
struct ScalarEvent<'a> {
    name: &'a str,
    value: f64,
    step: usize,
}

/// Appends one JSON object per scalar to `<dir>/events.jsonl`.
pub struct JsonlSummaryWriter {
    writer: BufWriter<File>,
}

impl JsonlSummaryWriter {
    pub const FILE_NAME: &'static str = "events.jsonl";

    pub fn open(dir: &Path) -> Result<Self, SinkError> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(Self::FILE_NAME))?;
        Ok(JsonlSummaryWriter {
            writer: BufWriter::new(file),
        })
    }
}

impl SummarySink for JsonlSummaryWriter {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, &ScalarEvent { name, value, step })?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory sink; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    scalars: Rc<RefCell<Vec<(String, f64, usize)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values recorded under `name`, as `(step, value)`.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.scalars
            .borrow()
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, v, s)| (*s, *v))
            .collect()
    }
}

impl SummarySink for MemorySink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<(), SinkError> {
        self.scalars
            .borrow_mut()
            .push((name.to_string(), value, step));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// What a summary writer gets to look at.
pub struct SummaryContext<'a, M: Trainable, O> {
    pub model: &'a M,
    pub optimizer: &'a O,
    pub metrics: &'a Metrics,
    pub step: usize,
    /// Last batch of the pass, if any.
    pub batch: Option<&'a M::Batch>,
    /// Result of the last batch of the pass, if any.
    pub result: Option<&'a StepResult<M>>,
}

/// Policy deciding which scalars are recorded for an epoch.
pub trait SummaryWriter<M: Trainable, O: Optimizer> {
    fn write(&mut self, sink: &mut dyn SummarySink, ctx: &SummaryContext<'_, M, O>);
}

impl<M, O, F> SummaryWriter<M, O> for F
where
    M: Trainable,
    O: Optimizer,
    F: FnMut(&mut dyn SummarySink, &SummaryContext<'_, M, O>),
{
    fn write(&mut self, sink: &mut dyn SummarySink, ctx: &SummaryContext<'_, M, O>) {
        self(sink, ctx)
    }
}

/// Gradient norms, optimizer hyperparameters and every scalar metric.
///
/// Hyperparameters are labelled `optimizer/<key>` for a single parameter
/// group and `optimizer/<index>/<key>` otherwise. Nested metric maps are
/// flattened with `/`; non-scalar metrics are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSummary;

impl<M: Trainable, O: Optimizer> SummaryWriter<M, O> for DefaultSummary {
    fn write(&mut self, sink: &mut dyn SummarySink, ctx: &SummaryContext<'_, M, O>) {
        for param in ctx.model.parameters() {
            if let Some(norm) = param.grad_norm() {
                write_scalar(
                    sink,
                    &format!("grad/{}/norm", param.name),
                    f64::from(norm),
                    ctx.step,
                );
            }
        }

        let groups = ctx.optimizer.param_groups();
        let single = groups.len() == 1;
        for (i, group) in groups.iter().enumerate() {
            for (key, value) in group {
                let label = if single {
                    format!("optimizer/{key}")
                } else {
                    format!("optimizer/{i}/{key}")
                };
                write_scalar(sink, &label, *value, ctx.step);
            }
        }

        write_metrics(sink, "", ctx.metrics, ctx.step);
    }
}

fn write_metrics(sink: &mut dyn SummarySink, prefix: &str, metrics: &Metrics, step: usize) {
    for (key, value) in metrics {
        let name = format!("{prefix}{key}");
        match value {
            MetricValue::Map(inner) => write_metrics(sink, &format!("{name}/"), inner, step),
            other => match other.as_f64() {
                Some(v) => write_scalar(sink, &name, v, step),
                None => tracing::trace!(name, "skipping non-scalar metric"),
            },
        }
    }
}
