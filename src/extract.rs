//! Layer extraction into a jail root.
//!
//! Layers are tar archives, usually gzip-compressed, applied bottom to top.
//! Upper layers delete lower content with whiteout entries:
//!
//! - `dir/.wh.name` removes `dir/name`
//! - `dir/.wh..wh..opq` empties `dir` before the layer's own entries land
//!
//! Entries with absolute paths or `..` components are rejected with
//! [`Error::PathTraversal`]; `tar::Entry::unpack_in` additionally refuses
//! to write through symlinks that leave the root. Whiteouts resolve their
//! directory through any symlinks a lower layer planted and refuse to
//! delete anything outside the root.
//!
//! Extraction is blocking I/O; callers run it on the blocking pool.

use crate::constants::{OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
use crate::error::{Error, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Extracts one layer archive into `rootfs`.
///
/// `budget` is the number of unpacked bytes still allowed; returns the bytes
/// this layer used.
pub fn extract_layer(archive_path: &Path, digest: &str, rootfs: &Path, budget: u64) -> Result<u64> {
    let failed = |reason: String| Error::ExtractionFailed {
        digest: digest.to_string(),
        reason,
    };

    debug!("Extracting layer: {}", digest);

    let file = File::open(archive_path)
        .map_err(|e| failed(format!("open {}: {}", archive_path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let compressed = reader
        .fill_buf()
        .map_err(|e| failed(e.to_string()))?
        .starts_with(&GZIP_MAGIC);

    let stream: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    let mut archive = Archive::new(stream);
    let root = fs::canonicalize(rootfs)
        .map_err(|e| failed(format!("resolve {}: {}", rootfs.display(), e)))?;

    let mut used = 0u64;
    for entry in archive.entries().map_err(|e| failed(e.to_string()))? {
        let mut entry = entry.map_err(|e| failed(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| failed(e.to_string()))?
            .into_owned();

        // SECURITY: Check for path traversal
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(Error::PathTraversal {
                path: path.to_string_lossy().into_owned(),
            });
        }

        let parent = path.parent().unwrap_or(Path::new(""));
        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        if filename == OPAQUE_WHITEOUT {
            if let Some(dir) = resolve_inside(&root, rootfs, parent)? {
                clear_dir(&dir).map_err(|e| failed(e.to_string()))?;
            }
            continue;
        }
        if let Some(target) = filename.strip_prefix(WHITEOUT_PREFIX) {
            if target.is_empty() || target == "." || target == ".." {
                return Err(Error::PathTraversal {
                    path: path.to_string_lossy().into_owned(),
                });
            }
            if let Some(dir) = resolve_inside(&root, rootfs, parent)? {
                remove_path(&dir.join(target)).map_err(|e| failed(e.to_string()))?;
            }
            continue;
        }

        used += entry.size();
        if used > budget {
            return Err(failed(format!("unpacked size exceeds remaining budget of {} bytes", budget)));
        }

        entry
            .unpack_in(rootfs)
            .map_err(|e| failed(format!("{}: {}", path.display(), e)))?;
    }

    Ok(used)
}

/// Writes `rootfs` as a gzip-compressed tar archive to `dest`.
pub fn repackage(rootfs: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all("", rootfs)?;
    builder.into_inner()?.finish()?;
    debug!("Repackaged {} into {}", rootfs.display(), dest.display());
    Ok(())
}

/// Resolves `rootfs/parent` through symlinks and checks the result is still
/// under `root` (the canonical rootfs). `None` if the directory is missing.
fn resolve_inside(root: &Path, rootfs: &Path, parent: &Path) -> Result<Option<PathBuf>> {
    match fs::canonicalize(rootfs.join(parent)) {
        Ok(dir) if dir.starts_with(root) => Ok(Some(dir)),
        Ok(_) => Err(Error::PathTraversal {
            path: parent.to_string_lossy().into_owned(),
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Removes a file, symlink or directory tree; missing paths are fine.
fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes every entry inside `dir`, keeping `dir` itself.
fn clear_dir(dir: &Path) -> std::io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        remove_path(&entry?.path())?;
    }
    Ok(())
}
