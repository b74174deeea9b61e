//! Unpacking of the uploaded image archive.
//!
//! The top-level tar is unpacked into [`COMPONENT_DIR_NAME`]. Every regular
//! `*.tar` file it leaves at the top of that directory is treated as an
//! image layer: unpacked into a sibling directory named without the suffix
//! and then removed.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// Directory inside the session directory that the engine scans.
pub const COMPONENT_DIR_NAME: &str = "component";

/// Errors produced while unpacking an archive.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("archive is corrupted: {0}")]
    Corrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What an extraction produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Extracted {
    /// Entries written to disk, layers included.
    pub entries: usize,
    pub layers: usize,
    /// Entries that could not be placed (duplicates, dangling links).
    pub skipped: usize,
}

/// Unpacks `archive` into `dest`, creating it first.
pub async fn extract_component(archive: &Path, dest: &Path) -> Result<Extracted, ExtractError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
        .await
        .map_err(|e| ExtractError::Io(io::Error::other(e)))?
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<Extracted, ExtractError> {
    std::fs::create_dir_all(dest)?;
    let mut extracted = Extracted::default();

    let file = File::open(archive)?;
    unpack_all(BufReader::new(file), dest, &mut extracted)?;

    for layer in layer_archives(dest)? {
        let Some(layer_dir) = layer_dir(&layer) else {
            continue;
        };
        tracing::debug!(layer = %layer.display(), "unpacking layer");
        std::fs::create_dir_all(&layer_dir)?;
        let file = File::open(&layer)?;
        unpack_all(BufReader::new(file), &layer_dir, &mut extracted)?;
        std::fs::remove_file(&layer)?;
        extracted.layers += 1;
    }

    Ok(extracted)
}

fn unpack_all<R: Read>(reader: R, dest: &Path, extracted: &mut Extracted) -> Result<(), ExtractError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive.set_preserve_mtime(false);
    archive.set_unpack_xattrs(false);

    let entries = archive.entries().map_err(corrupted)?;
    for entry in entries {
        let mut entry = entry.map_err(corrupted)?;
        let path = entry.path().map_err(corrupted)?.to_path_buf();
        match entry.unpack_in(dest) {
            Ok(_) => extracted.entries += 1,
            Err(e) if matches!(e.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData) => {
                return Err(ExtractError::Corrupted(format!("{}: {e}", path.display())));
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::AlreadyExists | io::ErrorKind::PermissionDenied
                ) =>
            {
                tracing::warn!(path = %path.display(), "skipping entry: {e}");
                extracted.skipped += 1;
            }
            Err(e) => return Err(ExtractError::Io(e)),
        }
    }
    Ok(())
}

fn corrupted(e: io::Error) -> ExtractError {
    ExtractError::Corrupted(e.to_string())
}

/// Regular `*.tar` files directly under `dir`, in name order.
fn layer_archives(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut layers = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "tar") {
            layers.push(path);
        }
    }
    layers.sort();
    Ok(layers)
}

fn layer_dir(layer: &Path) -> Option<PathBuf> {
    let stem = layer.file_stem()?;
    Some(layer.with_file_name(stem))
}
