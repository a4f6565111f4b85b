//! Per-task scratch directories under a process-wide temporary root.
//!
//! The root is created lazily on first use and lives until the process is
//! done with it; the directories handed out to tasks are the lifecycle unit.
//! Every directory is tagged with the [`TaskId`] that asked for it and is
//! removed by [`ScratchSpace::release`] once that task reaches a terminal
//! state. Statics are never dropped, so the root of [`ScratchSpace::global`]
//! stays on disk unless the owner of the process calls
//! [`ScratchSpace::teardown`] before exiting.
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::TaskId;
use crate::error::ScratchError;
use crate::utils::sanitize;

static GLOBAL: LazyLock<Arc<ScratchSpace>> = LazyLock::new(|| {
    let root = std::env::temp_dir().join(format!("taskforge-{}", std::process::id()));
    let root = Utf8PathBuf::from_path_buf(root)
        .unwrap_or_else(|path| Utf8PathBuf::from(path.to_string_lossy().into_owned()));
    Arc::new(ScratchSpace::new(root))
});

pub struct ScratchSpace {
    root: Utf8PathBuf,
    owned: Mutex<HashMap<TaskId, Vec<Utf8PathBuf>>>,
}

impl ScratchSpace {
    /// Creates a scratch space rooted at `root`. Nothing is touched on disk
    /// until the first directory is requested.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            owned: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide scratch space, `<tmp>/taskforge-<pid>`.
    pub fn global() -> Arc<ScratchSpace> {
        GLOBAL.clone()
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Creates `<root>/<hint>_<n>` for the first `n` that is not taken and
    /// tags it with `task`.
    pub fn create_dir(&self, task: TaskId, hint: &str) -> Result<Utf8PathBuf, ScratchError> {
        let mut owned = self.lock();

        fs::create_dir_all(&self.root).map_err(|e| ScratchError::Root(self.root.clone(), e))?;
        let path = create_unique_dir(&self.root, &format!("{}_", sanitize(hint)), 0)?;

        tracing::debug!(%task, %path, "created scratch directory");
        owned.entry(task).or_default().push(path.clone());

        Ok(path)
    }

    /// Directories currently tagged with `task`.
    pub fn owned_by(&self, task: TaskId) -> Vec<Utf8PathBuf> {
        self.lock().get(&task).cloned().unwrap_or_default()
    }

    /// Removes every directory tagged with `task`.
    ///
    /// Removal is best-effort: a directory that cannot be deleted is logged,
    /// left behind, and reported in the returned list. Calling this twice is
    /// harmless, the second call finds nothing to do.
    pub fn release(&self, task: TaskId) -> Vec<String> {
        let Some(paths) = self.lock().remove(&task) else {
            return Vec::new();
        };

        let mut failures = Vec::new();

        for path in paths.iter().rev() {
            match fs::remove_dir_all(path) {
                Ok(()) => tracing::debug!(%task, %path, "removed scratch directory"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(%task, %path, "couldn't remove scratch directory: {e}");
                    failures.push(format!("couldn't remove scratch directory {path}: {e}"));
                }
            }
        }

        failures
    }

    /// Removes the root if no task holds a directory in it and nothing was
    /// left behind by a failed release. Returns whether the root is gone.
    ///
    /// Meant for process exit. A later [`create_dir`](Self::create_dir)
    /// creates the root again.
    pub fn teardown(&self) -> bool {
        let owned = self.lock();

        if !owned.is_empty() {
            tracing::debug!(root = %self.root, tasks = owned.len(), "scratch root still in use");
            return false;
        }

        match fs::remove_dir(&self.root) {
            Ok(()) => {
                tracing::debug!(root = %self.root, "removed scratch root");
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(root = %self.root, "couldn't remove scratch root: {e}");
                false
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Vec<Utf8PathBuf>>> {
        self.owned.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ScratchSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchSpace")
            .field("root", &self.root)
            .finish()
    }
}

/// Creates `<parent>/<stem><n>` for the first free `n >= start`.
pub(crate) fn create_unique_dir(
    parent: &Utf8Path,
    stem: &str,
    start: usize,
) -> Result<Utf8PathBuf, ScratchError> {
    let mut n = start;

    loop {
        let path = parent.join(format!("{stem}{n}"));

        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(ScratchError::Create(path, e)),
        }
    }
}

/// Creates `<parent>/<name>`, or `<parent>/<name>_1`, `<parent>/<name>_2`, ...
/// if it already exists. Missing ancestors are created.
pub(crate) fn create_output_dir(
    parent: &Utf8Path,
    name: &str,
) -> Result<Utf8PathBuf, ScratchError> {
    fs::create_dir_all(parent).map_err(|e| ScratchError::Create(parent.to_owned(), e))?;

    let path = parent.join(name);
    match fs::create_dir(&path) {
        Ok(()) => Ok(path),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            create_unique_dir(parent, &format!("{name}_"), 1)
        }
        Err(e) => Err(ScratchError::Create(path, e)),
    }
}
