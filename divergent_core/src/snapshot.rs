use crate::ids::IdGenerator;
use crate::input::DataSource;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, trace};

pub const DEFAULT_SCRATCH_PREFIX: &str = "divergent_";

/// Fallback file name used when the base path has no final component.
const UNNAMED_STATE: &str = "state";

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to create scratch directory with prefix {prefix:?}: {source}")]
    ScratchCreate {
        prefix: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to copy {from:?} to {to:?}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to remove scratch directory {path:?}: {source}")]
    Teardown {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Produces isolated copies of a database file so that every execution in a
/// trial starts from the same pre-run state.
///
/// The snapshotter owns a scratch directory for the whole session. Snapshots
/// are never removed individually; they stay on disk until [`close`] (or drop)
/// so that reproducers can still reference them.
///
/// [`close`]: StateSnapshotter::close
#[derive(Debug)]
pub struct StateSnapshotter {
    scratch: TempDir,
    ids: IdGenerator,
    created: usize,
}

impl StateSnapshotter {
    pub fn new(prefix: &str) -> Result<Self, SnapshotError> {
        Self::with_ids(prefix, IdGenerator::from_entropy())
    }

    pub fn with_ids(prefix: &str, ids: IdGenerator) -> Result<Self, SnapshotError> {
        let scratch = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir()
            .map_err(|source| SnapshotError::ScratchCreate {
                prefix: prefix.to_string(),
                source,
            })?;
        debug!(scratch = %scratch.path().display(), "created scratch directory");
        Ok(Self {
            scratch,
            ids,
            created: 0,
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Number of snapshot files created so far.
    pub fn created(&self) -> usize {
        self.created
    }

    /// Copies the file behind `source` into the scratch directory.
    ///
    /// Returns `Ok(None)` when there is no durable state to isolate: the
    /// source is in-memory, or the file does not exist.
    pub fn snapshot(&mut self, source: &DataSource) -> Result<Option<PathBuf>, SnapshotError> {
        let base = match source {
            DataSource::InMemory => return Ok(None),
            DataSource::File(path) => path,
        };
        if !base.exists() {
            trace!(base = %base.display(), "base state missing, nothing to snapshot");
            return Ok(None);
        }

        let base_name = base
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| UNNAMED_STATE.to_string());
        let destination = self
            .scratch
            .path()
            .join(format!("{}_{}", self.ids.next_id(), base_name));

        fs::copy(base, &destination).map_err(|source| SnapshotError::Copy {
            from: base.clone(),
            to: destination.clone(),
            source,
        })?;
        self.created += 1;
        trace!(snapshot = %destination.display(), "snapshot taken");
        Ok(Some(destination))
    }

    /// Removes the scratch directory and every snapshot in it.
    pub fn close(self) -> Result<(), SnapshotError> {
        let path = self.scratch.path().to_path_buf();
        self.scratch
            .close()
            .map_err(|source| SnapshotError::Teardown { path, source })
    }

    /// Leaves the scratch directory on disk and returns its location.
    pub fn keep(self) -> PathBuf {
        self.scratch.keep()
    }
}
