use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::checkpoint::record::CheckpointRecord;
use crate::error::{CheckpointError, ConfigError};

/// Alias file always pointing at the newest checkpoint.
pub const CHECKPOINT_LAST: &str = "checkpoint_last.json";
/// File holding the best-loss snapshot.
pub const CHECKPOINT_BEST: &str = "checkpoint_best.json";

static CHECKPOINT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^checkpoint_(\d+)\.json$").expect("checkpoint pattern is a valid regex")
});

pub fn checkpoint_file_name(step: usize) -> String {
    format!("checkpoint_{step}.json")
}

/// Step embedded in a numbered checkpoint file name.
pub fn parse_step(file_name: &str) -> Option<usize> {
    CHECKPOINT_PATTERN
        .captures(file_name)
        .and_then(|caps| caps[1].parse().ok())
}

/// Serialize `record` to `path` atomically and optionally repoint `alias` at it.
///
/// The record is written to a sibling temp file, synced, then renamed over
/// `path`, so the canonical name never refers to a partial write.
pub fn save_checkpoint(
    path: &Path,
    record: &CheckpointRecord,
    alias: Option<&Path>,
) -> Result<(), CheckpointError> {
    let bytes = serde_json::to_vec_pretty(record)?;
    write_atomic(path, &bytes).map_err(|source| CheckpointError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(alias) = alias {
        update_alias(alias, path).map_err(|source| CheckpointError::Write {
            path: alias.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

pub fn load_checkpoint(path: &Path) -> Result<CheckpointRecord, CheckpointError> {
    let text = fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            CheckpointError::NotFound(path.to_path_buf())
        } else {
            CheckpointError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    serde_json::from_str(&text).map_err(|source| CheckpointError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Scan `dir` for numbered checkpoints. Non-matching names are ignored.
pub fn list_checkpoints(dir: &Path) -> Result<CheckpointHistory, CheckpointError> {
    let mut history = CheckpointHistory::default();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(step) = entry.file_name().to_str().and_then(parse_step) {
            history.push(step);
        }
    }
    Ok(history)
}

/// Evict the oldest checkpoints until at most `limit` remain.
///
/// Returns the evicted steps. Files already gone are not an error, so
/// repeated calls are harmless.
pub fn prune(
    dir: &Path,
    history: &mut CheckpointHistory,
    limit: usize,
) -> Result<Vec<usize>, CheckpointError> {
    evict(dir, history, limit, None)
}

/// Like [`prune`], but `written` is never evicted and steps past it go first.
///
/// Steps newer than `written` belong to a timeline abandoned by a resume.
/// An entry leaves the history only once its file is gone.
fn evict(
    dir: &Path,
    history: &mut CheckpointHistory,
    limit: usize,
    written: Option<usize>,
) -> Result<Vec<usize>, CheckpointError> {
    let mut evicted = Vec::new();
    while history.len() > limit {
        let Some(step) = history.next_eviction(written) else {
            break;
        };
        let path = dir.join(checkpoint_file_name(step));
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        history.remove(step);
        tracing::debug!(step, path = %path.display(), "evicted checkpoint");
        evicted.push(step);
    }
    Ok(evicted)
}

/// Checkpoint steps on disk, ascending. Index 0 is the next to be evicted
/// unless a resume rewound the run past newer entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointHistory {
    steps: Vec<usize>,
}

impl CheckpointHistory {
    /// Insert keeping ascending order; a step already present is not duplicated.
    pub fn push(&mut self, step: usize) {
        if let Err(pos) = self.steps.binary_search(&step) {
            self.steps.insert(pos, step);
        }
    }

    pub fn remove(&mut self, step: usize) -> bool {
        match self.steps.binary_search(&step) {
            Ok(pos) => {
                self.steps.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Next step to evict: the oldest past `written`, else the oldest other than it.
    fn next_eviction(&self, written: Option<usize>) -> Option<usize> {
        let mut steps = self.steps.iter().copied();
        match written {
            None => steps.next(),
            Some(written) => steps
                .clone()
                .find(|&step| step > written)
                .or_else(|| steps.find(|&step| step != written)),
        }
    }

    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// `(step, loss)` of the best checkpoint seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestCheckpoint {
    pub step: usize,
    pub loss: f64,
}

impl BestCheckpoint {
    /// Ties go to the newer candidate.
    pub fn accepts(&self, loss: f64) -> bool {
        loss <= self.loss
    }
}

/// Where the best snapshot comes from when promoting.
pub enum BestSource<'a> {
    /// Copy an already written checkpoint file.
    Copy(&'a Path),
    /// Serialize a freshly captured record.
    Record(&'a CheckpointRecord),
}

/// A directory of numbered checkpoints with retention and best tracking.
///
/// Not safe for several trainers sharing one directory.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    limit: Option<usize>,
    history: CheckpointHistory,
    best: Option<BestCheckpoint>,
}

impl CheckpointStore {
    /// Open (creating if needed) `dir` and rebuild the history from its contents.
    ///
    /// `limit` of `None` keeps every checkpoint.
    pub fn open(dir: impl Into<PathBuf>, limit: Option<usize>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let history = list_checkpoints(&dir)?;
        Ok(CheckpointStore {
            dir,
            limit,
            history,
            best: None,
        })
    }

    pub fn validate_limit(limit: Option<usize>) -> Result<(), ConfigError> {
        match limit {
            Some(0) => Err(ConfigError::Validation(
                "checkpoint retention limit must be > 0".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(checkpoint_file_name(step))
    }

    pub fn last_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_LAST)
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_BEST)
    }

    pub fn history(&self) -> &CheckpointHistory {
        &self.history
    }

    pub fn best(&self) -> Option<BestCheckpoint> {
        self.best
    }

    /// Read `(step, loss)` from an existing best file, if there is one.
    pub fn load_best_pointer(&mut self) -> Result<Option<BestCheckpoint>, CheckpointError> {
        let path = self.best_path();
        if !path.exists() {
            return Ok(None);
        }
        let record = load_checkpoint(&path)?;
        let best = BestCheckpoint {
            step: record.step,
            loss: record.loss,
        };
        self.best = Some(best);
        Ok(Some(best))
    }

    /// Append `record` to the history, evict beyond the limit, write it and
    /// repoint the "last" alias.
    ///
    /// The step being written is never evicted. After a resume from an older
    /// checkpoint, numbered files past it are evicted before older ones.
    pub fn write(&mut self, record: &CheckpointRecord) -> Result<PathBuf, CheckpointError> {
        self.history.push(record.step);
        if let Some(limit) = self.limit {
            evict(&self.dir, &mut self.history, limit, Some(record.step))?;
        }
        let path = self.path_for(record.step);
        save_checkpoint(&path, record, Some(&self.last_path()))?;
        tracing::info!(step = record.step, loss = record.loss, path = %path.display(), "saved checkpoint");
        Ok(path)
    }

    /// Enforce the retention limit on the current history.
    pub fn prune(&mut self) -> Result<Vec<usize>, CheckpointError> {
        match self.limit {
            Some(limit) => prune(&self.dir, &mut self.history, limit),
            None => Ok(Vec::new()),
        }
    }

    /// Make `(step, loss)` the best checkpoint if `loss <= best.loss`.
    ///
    /// Returns whether the candidate was promoted. The best file is always
    /// replaced atomically.
    pub fn promote_best(
        &mut self,
        step: usize,
        loss: f64,
        source: BestSource<'_>,
    ) -> Result<bool, CheckpointError> {
        if let Some(best) = self.best {
            if !best.accepts(loss) {
                return Ok(false);
            }
        }
        let target = self.best_path();
        match source {
            BestSource::Copy(from) => {
                let bytes = fs::read(from).map_err(|source| CheckpointError::Read {
                    path: from.to_path_buf(),
                    source,
                })?;
                write_atomic(&target, &bytes).map_err(|source| CheckpointError::Write {
                    path: target.clone(),
                    source,
                })?;
            }
            BestSource::Record(record) => save_checkpoint(&target, record, None)?,
        }
        tracing::info!(step, loss, "new best checkpoint");
        self.best = Some(BestCheckpoint { step, loss });
        Ok(true)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = temp_sibling(path);
    let written = fs::File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

/// Repoint `alias` at `target` without ever leaving it missing or dangling.
#[cfg(unix)]
fn update_alias(alias: &Path, target: &Path) -> io::Result<()> {
    let tmp = temp_sibling(alias);
    if tmp.symlink_metadata().is_ok() {
        fs::remove_file(&tmp)?;
    }
    // Relative link when both live in the same directory, so the directory can move.
    let link_target = match (alias.parent(), target.parent(), target.file_name()) {
        (Some(a), Some(t), Some(name)) if a == t => PathBuf::from(name),
        _ => target.to_path_buf(),
    };
    std::os::unix::fs::symlink(&link_target, &tmp)?;
    fs::rename(&tmp, alias)?;
    tracing::debug!(alias = %alias.display(), target = %link_target.display(), "updated alias");
    Ok(())
}

#[cfg(not(unix))]
fn update_alias(alias: &Path, target: &Path) -> io::Result<()> {
    let bytes = fs::read(target)?;
    write_atomic(alias, &bytes)?;
    tracing::debug!(alias = %alias.display(), target = %target.display(), "updated alias");
    Ok(())
}
