//! Plugin bundle extraction
//!
//! A bundle is a `.tar.gz` (or `.tgz`) or `.zip` archive holding at least
//! one `*.wasm` module and one `*.yaml`/`*.yml`/`*.json` manifest. The
//! archive's basename (without suffix) becomes the extraction subdirectory
//! under the engine's output directory.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while extracting a bundle
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("unsupported archive format: {0} (expected .tar.gz, .tgz or .zip)")]
    UnsupportedFormat(PathBuf),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read zip archive {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("archive entry escapes the extraction directory: {0}")]
    EntryOutsideRoot(String),

    #[error("no manifest (*.yaml, *.yml or *.json) found in bundle {0}")]
    ManifestMissing(PathBuf),

    #[error("no *.wasm module found in bundle {0}")]
    WasmMissing(PathBuf),
}

/// What a bundle yielded after extraction and validation.
#[derive(Debug, Clone)]
pub struct BundleContents {
    /// Directory the archive was unpacked into.
    pub root: PathBuf,

    /// Every manifest file found in the unpacked subtree, in walk order.
    pub manifests: Vec<PathBuf>,

    /// Every wasm module found in the unpacked subtree, in walk order.
    pub modules: Vec<PathBuf>,
}

/// Returns true when `path` names an archive format the extractor handles.
pub fn is_supported_archive(path: &Path) -> bool {
    archive_stem(path).is_some()
}

/// Extract `archive_path` under `out_dir/<stem>/` and scan the result.
///
/// Fails when the archive is unreadable, of an unsupported format, or when
/// the unpacked subtree is missing a manifest or a wasm module. Callers
/// treat every failure as per-bundle: siblings keep loading.
pub fn extract(archive_path: &Path, out_dir: &Path) -> Result<BundleContents, ArchiveError> {
    let stem = archive_stem(archive_path)
        .ok_or_else(|| ArchiveError::UnsupportedFormat(archive_path.to_path_buf()))?;
    let dest = out_dir.join(stem);
    fs::create_dir_all(&dest).map_err(|source| ArchiveError::Io {
        path: dest.clone(),
        source,
    })?;

    let name = archive_path.to_string_lossy().to_ascii_lowercase();
    if name.ends_with(".zip") {
        extract_zip(archive_path, &dest)?;
    } else {
        extract_tar_gz(archive_path, &dest)?;
    }

    let mut manifests = Vec::new();
    let mut modules = Vec::new();
    scan_tree(&dest, &mut manifests, &mut modules)?;

    if manifests.is_empty() {
        return Err(ArchiveError::ManifestMissing(archive_path.to_path_buf()));
    }
    if modules.is_empty() {
        return Err(ArchiveError::WasmMissing(archive_path.to_path_buf()));
    }

    tracing::debug!(
        category = "archive",
        bundle = %archive_path.display(),
        manifests = manifests.len(),
        modules = modules.len(),
        "Bundle extracted"
    );

    Ok(BundleContents {
        root: dest,
        manifests,
        modules,
    })
}

/// Archive basename without its format suffix, or None for unsupported
/// formats.
fn archive_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy().to_string();
    let lower = name.to_ascii_lowercase();
    for suffix in [".tar.gz", ".tgz", ".zip"] {
        if lower.ends_with(suffix) && name.len() > suffix.len() {
            return Some(name[..name.len() - suffix.len()].to_string());
        }
    }
    None
}

fn extract_tar_gz(archive_path: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive_path).map_err(|source| ArchiveError::Io {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    // tar refuses entries that would land outside `dest`.
    tar.unpack(dest).map_err(|source| ArchiveError::Io {
        path: archive_path.to_path_buf(),
        source,
    })
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive_path).map_err(|source| ArchiveError::Io {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let mut zip = zip::ZipArchive::new(file).map_err(|source| ArchiveError::Zip {
        path: archive_path.to_path_buf(),
        source,
    })?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(|source| ArchiveError::Zip {
            path: archive_path.to_path_buf(),
            source,
        })?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ArchiveError::EntryOutsideRoot(entry.name().to_string()))?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|source| ArchiveError::Io {
                path: out_path.clone(),
                source,
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|source| ArchiveError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut out = File::create(&out_path).map_err(|source| ArchiveError::Io {
            path: out_path.clone(),
            source,
        })?;
        io::copy(&mut entry, &mut out).map_err(|source| ArchiveError::Io {
            path: out_path.clone(),
            source,
        })?;
    }

    Ok(())
}

/// Recursive walk collecting manifest and module paths.
fn scan_tree(
    dir: &Path,
    manifests: &mut Vec<PathBuf>,
    modules: &mut Vec<PathBuf>,
) -> Result<(), ArchiveError> {
    let entries = fs::read_dir(dir).map_err(|source| ArchiveError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| ArchiveError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            scan_tree(&path, manifests, modules)?;
            continue;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") | Some("json") => manifests.push(path),
            Some("wasm") => modules.push(path),
            _ => {}
        }
    }

    Ok(())
}
