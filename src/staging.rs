//! Per-run staging directory. Nothing survives a run: the directory is
//! removed by [`StagingArea::close`], on drop, or by
//! [`remove_live_staging`] when the process is forced to exit.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tempfile::{Builder, TempDir};

use crate::config::PAYLOAD_DIR;
use crate::error::{DumperError, Result};

static LIVE_STAGING: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

fn live() -> MutexGuard<'static, Vec<PathBuf>> {
    LIVE_STAGING
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

/// Roots of staging areas that have not been closed or dropped yet.
pub fn live_staging_roots() -> Vec<PathBuf> {
    live().clone()
}

/// Removes every live staging area. For exit paths that skip destructors.
pub fn remove_live_staging() {
    let roots: Vec<PathBuf> = live().drain(..).collect();
    remove_roots(&roots);
}

fn remove_roots(roots: &[PathBuf]) {
    for root in roots {
        if let Err(err) = fs::remove_dir_all(root) {
            tracing::warn!(path = %root.display(), "remove staging area: {err}");
        }
    }
}

/// Keeps a root listed in [`live_staging_roots`] while alive.
struct Registration {
    root: PathBuf,
}

impl Registration {
    fn new(root: &Path) -> Self {
        live().push(root.to_path_buf());
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        live().retain(|root| root != &self.root);
    }
}

pub struct StagingArea {
    dir: TempDir,
    payload: PathBuf,
    registration: Registration,
}

impl StagingArea {
    /// Creates a fresh staging area under the system temp directory.
    pub fn create() -> Result<Self> {
        Self::create_in(std::env::temp_dir())
    }

    pub fn create_in(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        let dir = Builder::new()
            .prefix("ipa-dumper-")
            .tempdir_in(base)
            .map_err(|err| DumperError::from_io_error(base.display().to_string(), err))?;
        let payload = dir.path().join(PAYLOAD_DIR);
        fs::create_dir(&payload)
            .map_err(|err| DumperError::from_io_error(payload.display().to_string(), err))?;
        tracing::debug!(path = %payload.display(), "staging area created");
        let registration = Registration::new(dir.path());
        Ok(Self {
            dir,
            payload,
            registration,
        })
    }

    /// Directory artifacts are retrieved into; its name is the archive's
    /// top-level directory.
    pub fn payload_dir(&self) -> &Path {
        &self.payload
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Removes the staging area, reporting failures instead of swallowing
    /// them the way drop does.
    pub fn close(self) -> Result<()> {
        let Self {
            dir, registration, ..
        } = self;
        let path = dir.path().display().to_string();
        let closed = dir
            .close()
            .map_err(|err| DumperError::from_io_error(path, err));
        drop(registration);
        closed
    }
}
