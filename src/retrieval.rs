//! Remote copy of agent-produced artifacts into the staging area.

use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};

use crate::completion::CancelToken;
use crate::config::{BUNDLE_MODE, MODULE_MODE};
use crate::error::{DumperError, Result};

/// Progress callback handed to [`RemoteCopy::fetch`]: `(name, total_size,
/// sent_so_far)` per file. `Break` asks the copy to stop at the next chunk.
pub type ProgressFn<'a> = dyn FnMut(&str, u64, u64) -> ControlFlow<()> + 'a;

/// Synchronous "fetch remote path into local directory".
///
/// Implementations only create entries below an existing `local_dir`; they
/// never recreate missing parents.
pub trait RemoteCopy: Send {
    fn fetch(
        &self,
        remote: &str,
        local_dir: &Path,
        recursive: bool,
        progress: &mut ProgressFn<'_>,
    ) -> anyhow::Result<()>;
}

/// Reports progress and turns a stop request into an error.
pub fn report_progress(
    progress: &mut ProgressFn<'_>,
    name: &str,
    size: u64,
    sent: u64,
) -> anyhow::Result<()> {
    match progress(name, size, sent) {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => anyhow::bail!("transfer of {name} aborted"),
    }
}

/// Creates one directory level. An existing directory is fine; a missing
/// parent is an error.
pub fn create_dir_level(path: &Path) -> io::Result<()> {
    match fs::create_dir(path) {
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        other => other,
    }
}

/// Tracks bytes already reported for the current file so callbacks carrying
/// cumulative totals turn into increments.
#[derive(Debug, Default)]
struct ProgressLedger {
    last_sent: u64,
}

impl ProgressLedger {
    fn advance(&mut self, size: u64, sent: u64) -> u64 {
        let delta = sent.saturating_sub(self.last_sent);
        self.last_sent = if size == sent { 0 } else { sent };
        delta
    }
}

/// Byte progress for one remote copy, labelled with the current file name.
pub struct TransferProgress {
    bar: ProgressBar,
    ledger: ProgressLedger,
    current: Option<String>,
}

impl TransferProgress {
    pub fn new(visible: bool) -> Self {
        let bar = if visible {
            let style = ProgressStyle::default_bar()
                .template("{msg:24} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-");
            let bar = ProgressBar::new(0);
            bar.set_style(style);
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            bar,
            ledger: ProgressLedger::default(),
            current: None,
        }
    }

    pub fn update(&mut self, name: &str, size: u64, sent: u64) {
        let label = display_name(name);
        if self.current.as_deref() != Some(label.as_str()) {
            self.bar.set_position(0);
            self.bar.set_message(label.clone());
            self.current = Some(label);
        }
        self.bar.set_length(size);
        let delta = self.ledger.advance(size, sent);
        self.bar.inc(delta);
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish(self) {
        self.bar.finish_and_clear();
    }
}

fn display_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|base| base.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

/// Final path component of a remote path, trailing slash tolerated.
pub fn remote_basename(remote: &str) -> Option<String> {
    Path::new(remote)
        .file_name()
        .map(|base| base.to_string_lossy().into_owned())
}

/// Pulls artifacts into the staging root and fixes their permissions.
pub struct ArtifactFetcher<R> {
    remote: R,
    staging: PathBuf,
    show_progress: bool,
    cancel: CancelToken,
}

impl<R: RemoteCopy> ArtifactFetcher<R> {
    pub fn new(remote: R, staging: impl Into<PathBuf>, show_progress: bool) -> Self {
        Self {
            remote,
            staging: staging.into(),
            show_progress,
            cancel: CancelToken::new(),
        }
    }

    /// Aborts in-flight copies once `cancel` trips.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Copies a single decrypted module; returns its staged file name.
    pub fn fetch_module(&mut self, remote: &str) -> Result<String> {
        self.fetch(remote, false, MODULE_MODE)
    }

    /// Copies the whole bundle directory; returns its directory name.
    pub fn fetch_bundle(&mut self, remote: &str) -> Result<String> {
        self.fetch(remote, true, BUNDLE_MODE)
    }

    fn fetch(&mut self, remote: &str, recursive: bool, mode: u32) -> Result<String> {
        let name = remote_basename(remote).ok_or_else(|| DumperError::Transfer {
            path: remote.to_string(),
            source: anyhow::anyhow!("remote path has no file name"),
        })?;

        let transfer_err = |source| DumperError::Transfer {
            path: remote.to_string(),
            source,
        };
        if self.cancel.is_cancelled() {
            return Err(transfer_err(anyhow::anyhow!("dump cancelled")));
        }

        tracing::debug!(remote, recursive, "fetching artifact");
        let mut progress = TransferProgress::new(self.show_progress);
        let cancel = &self.cancel;
        let mut report = |file: &str, size: u64, sent: u64| {
            progress.update(file, size, sent);
            if cancel.is_cancelled() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };
        let copied = self.remote.fetch(remote, &self.staging, recursive, &mut report);
        progress.finish();
        copied.map_err(transfer_err)?;

        let staged = self.staging.join(&name);
        fs::set_permissions(&staged, fs::Permissions::from_mode(mode))
            .map_err(|err| DumperError::from_io_error(staged.display().to_string(), err))?;
        Ok(name)
    }
}
