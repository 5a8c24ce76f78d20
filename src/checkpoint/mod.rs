//! Checkpoint persistence: the on-disk record, atomic writes, retention and
//! best-snapshot tracking.

mod record;
mod store;

pub use record::{CheckpointRecord, Restore};
pub use store::{
    checkpoint_file_name, list_checkpoints, load_checkpoint, parse_step, prune, save_checkpoint,
    BestCheckpoint, BestSource, CheckpointHistory, CheckpointStore, CHECKPOINT_BEST,
    CHECKPOINT_LAST,
};
