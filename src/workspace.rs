//! Workspace lifecycle: the storage areas shared by workers of adjacent phases.
//!
//! A workspace is rooted at a directory and owns three areas:
//! - `intermediate/`: written by map workers, read by reduce workers
//! - `output/`: written by reduce or report workers
//! - `.shardgate/logs/`: captured stdout/stderr of every worker
//!
//! The run record lives next to the logs in `.shardgate/run.json`, so the
//! orchestrator never claims a generic name like `logs/` in a user's project.
//!
//! [`Workspace::reset`] empties all three before any worker is launched, so a
//! run never observes artifacts left behind by a previous one.

use crate::errors::WorkspaceError;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Directory under the root reserved for orchestrator state.
pub const STATE_DIR: &str = ".shardgate";

/// File name of the persisted run record inside [`STATE_DIR`].
pub const RUN_RECORD_FILE: &str = "run.json";

/// Storage areas owned by a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
    pub intermediate_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Workspace {
    /// Workspace with the conventional layout under `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            intermediate_dir: root.join("intermediate"),
            output_dir: root.join("output"),
            log_dir: root.join(STATE_DIR).join("logs"),
            root,
        }
    }

    /// Override the intermediate area location.
    pub fn with_intermediate_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.intermediate_dir = dir.into();
        self
    }

    /// Override the output area location.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Path of the run record written after each run.
    pub fn record_file(&self) -> PathBuf {
        self.root.join(STATE_DIR).join(RUN_RECORD_FILE)
    }

    /// Log file capturing one worker's output.
    pub fn log_file(&self, stem: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", stem))
    }

    fn areas(&self) -> [(&'static str, &Path); 3] {
        [
            ("intermediate", self.intermediate_dir.as_path()),
            ("output", self.output_dir.as_path()),
            ("logs", self.log_dir.as_path()),
        ]
    }

    /// Remove and recreate every area.
    ///
    /// Idempotent. Fails without touching the filesystem when two areas are the
    /// same directory or one is nested inside another.
    pub fn reset(&self) -> Result<(), WorkspaceError> {
        self.check_disjoint()?;

        std::fs::create_dir_all(&self.root).map_err(|source| WorkspaceError::CreateFailed {
            area: "root",
            path: self.root.clone(),
            source,
        })?;

        for (area, path) in self.areas() {
            clear_area(area, path)?;
            std::fs::create_dir_all(path).map_err(|source| WorkspaceError::CreateFailed {
                area,
                path: path.to_path_buf(),
                source,
            })?;
            debug!(area, path = %path.display(), "workspace area reset");
        }
        Ok(())
    }

    /// Whether every area exists and has no entries.
    pub fn is_empty(&self) -> bool {
        self.areas().iter().all(|(_, path)| {
            std::fs::read_dir(path)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false)
        })
    }

    /// Compare areas by where they actually live, so `..` segments and
    /// symlinks cannot disguise an area that contains the root or another area.
    fn check_disjoint(&self) -> Result<(), WorkspaceError> {
        let root = resolve_lexically_and_links(&self.root);
        let areas: Vec<(&'static str, PathBuf)> = self
            .areas()
            .into_iter()
            .map(|(area, path)| (area, resolve_lexically_and_links(path)))
            .collect();

        for (area, path) in &areas {
            if root.starts_with(path) {
                return Err(WorkspaceError::OverlappingAreas {
                    first: *area,
                    second: "root",
                    path: path.clone(),
                });
            }
        }
        for (i, (first, a)) in areas.iter().enumerate() {
            for (second, b) in &areas[i + 1..] {
                let inner = if a.starts_with(b) {
                    a
                } else if b.starts_with(a) {
                    b
                } else {
                    continue;
                };
                return Err(WorkspaceError::OverlappingAreas {
                    first: *first,
                    second: *second,
                    path: inner.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Absolute form of `path` with the longest existing prefix canonicalized and
/// the remaining `.`/`..` segments folded away.
fn resolve_lexically_and_links(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let components: Vec<Component<'_>> = absolute.components().collect();
    for split in (1..=components.len()).rev() {
        let prefix: PathBuf = components[..split].iter().collect();
        if let Ok(mut resolved) = prefix.canonicalize() {
            resolved.extend(&components[split..]);
            return fold_dots(&resolved);
        }
    }
    fold_dots(&absolute)
}

fn fold_dots(path: &Path) -> PathBuf {
    let mut folded = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !folded.pop() && !folded.has_root() {
                    folded.push("..");
                }
            }
            other => folded.push(other),
        }
    }
    folded
}

fn clear_area(area: &'static str, path: &Path) -> Result<(), WorkspaceError> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|source| WorkspaceError::ClearFailed {
        area,
        path: path.to_path_buf(),
        source,
    })
}
