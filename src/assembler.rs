//! Rebuilds the application bundle layout from staged artifacts and writes
//! the final archive.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{DumperError, Result};
use crate::router::Manifest;

/// Packs a directory tree into a single file, keeping the tree's own
/// directory name as the top-level entry.
pub trait Archiver {
    fn archive(&self, source_root: &Path, output: &Path) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ZipArchiver;

impl Archiver for ZipArchiver {
    fn archive(&self, source_root: &Path, output: &Path) -> anyhow::Result<()> {
        let prefix = source_root.parent().unwrap_or(source_root);
        let file = File::create(output).with_context(|| format!("create {}", output.display()))?;
        let mut writer = ZipWriter::new(file);

        for entry in WalkDir::new(source_root).sort_by_file_name() {
            let entry = entry?;
            let relative = entry
                .path()
                .strip_prefix(prefix)
                .with_context(|| format!("{} outside archive root", entry.path().display()))?;
            let name = archive_entry_name(relative);
            let metadata = entry
                .path()
                .symlink_metadata()
                .with_context(|| format!("stat {}", entry.path().display()))?;
            let options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(metadata.permissions().mode() & 0o7777)
                .large_file(needs_zip64(metadata.len()));

            let file_type = entry.file_type();
            if file_type.is_dir() {
                writer.add_directory(format!("{name}/"), options)?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                writer.add_symlink(name, target.to_string_lossy(), options)?;
            } else {
                writer.start_file(name, options)?;
                let mut source = File::open(entry.path())
                    .with_context(|| format!("open {}", entry.path().display()))?;
                io::copy(&mut source, &mut writer)?;
            }
        }

        writer.finish()?;
        Ok(())
    }
}

/// Entries at or past 4 GiB need ZIP64 headers.
fn needs_zip64(len: u64) -> bool {
    len >= u64::from(u32::MAX)
}

fn archive_entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Moves every staged module to `<payload>/<app>/<relative path>`.
pub fn arrange_payload(manifest: &Manifest, payload_root: &Path) -> Result<PathBuf> {
    let app_dir = manifest.app_dir().ok_or(DumperError::MissingBundle)?;
    let bundle = payload_root.join(app_dir);
    if !bundle.is_dir() {
        return Err(DumperError::Assembly(format!(
            "bundle directory {} was not staged",
            bundle.display()
        )));
    }

    for (staged_name, relative) in manifest.modules() {
        let from = payload_root.join(staged_name);
        let to = bundle.join(relative);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                DumperError::Assembly(format!("create {}: {err}", parent.display()))
            })?;
        }
        fs::rename(&from, &to).map_err(|err| {
            DumperError::Assembly(format!(
                "move {} -> {}: {err}",
                from.display(),
                to.display()
            ))
        })?;
        tracing::debug!(from = %from.display(), to = %to.display(), "module placed");
    }
    Ok(bundle)
}

/// Arranges the payload and archives it to `output`. A partially written
/// archive is removed on failure.
pub fn build_package(
    manifest: &Manifest,
    payload_root: &Path,
    output: &Path,
    archiver: &dyn Archiver,
) -> Result<PathBuf> {
    println!("[*]  Generating \"{}\"", output.display());
    arrange_payload(manifest, payload_root)?;

    if let Err(source) = archiver.archive(payload_root, output) {
        if output.exists() {
            let _ = fs::remove_file(output);
        }
        return Err(DumperError::Archive {
            path: output.display().to_string(),
            source,
        });
    }
    Ok(output.to_path_buf())
}
