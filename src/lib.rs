//! # epochloop
//!
//! An epoch-based training loop orchestrator. Models, optimizers and data
//! plug in through small traits; the loop owns checkpoint rotation, best
//! snapshot selection, exact resume (including every random source), and
//! streaming reduction of per-batch metrics.
//!
//! ## Modules
//!
//! - [`model`] — Collaborator traits: trainable unit, optimizer, dataset, hooks
//! - [`step`] — Forward-step adapter and its uniform result record
//! - [`metrics`] — Metric values, normalization, streaming reducers
//! - [`checkpoint`] — Checkpoint records, atomic persistence, retention, best tracking
//! - [`rng`] — Random sources captured in every checkpoint
//! - [`summary`] — Scalar summary sinks and the default summary policy
//! - [`training`] — The trainer state machine and inference passes
//! - [`linear`] — Reference linear-regression job used by the `train` binary
//! - [`config`] — TOML configuration loading and validation
//! - [`error`] — Structured error types

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod linear;
pub mod metrics;
pub mod model;
pub mod rng;
pub mod step;
pub mod summary;
pub mod training;

#[cfg(test)]
mod testing;
