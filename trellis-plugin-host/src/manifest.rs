//! Manifest loading and admission
//!
//! Manifests are YAML or JSON documents describing a plugin and its
//! contributions (see [`PluginManifest`]). Admission is strict: a manifest
//! without an id, or whose `version`/`minVersion` fails the semver rule,
//! never reaches the registry.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use trellis_plugin_api::{semver, PluginManifest};

/// Errors that can occur while loading a manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("manifest {path} has an unsupported extension (expected .yaml, .yml or .json)")]
    UnsupportedExtension { path: PathBuf },

    #[error("failed to parse JSON manifest {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse YAML manifest {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("manifest {path} is missing a plugin id")]
    MissingId { path: PathBuf },

    #[error("manifest {path}: {field} {value:?} is not a valid MAJOR.MINOR.PATCH version")]
    InvalidVersion {
        path: PathBuf,
        field: &'static str,
        value: String,
    },
}

/// Load and admit a manifest file, dispatching on its extension.
pub fn load_manifest(path: &Path) -> Result<PluginManifest, ManifestError> {
    let raw = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let manifest = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw).map_err(|source| ManifestError::Json {
            path: path.to_path_buf(),
            source,
        })?,
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&raw).map_err(|source| ManifestError::Yaml {
                path: path.to_path_buf(),
                source,
            })?
        }
        _ => {
            return Err(ManifestError::UnsupportedExtension {
                path: path.to_path_buf(),
            })
        }
    };

    admit(&manifest, path)?;
    Ok(manifest)
}

/// Admission checks shared by file loading and runtime registration.
pub fn admit(manifest: &PluginManifest, path: &Path) -> Result<(), ManifestError> {
    if manifest.id.trim().is_empty() {
        return Err(ManifestError::MissingId {
            path: path.to_path_buf(),
        });
    }
    if !semver::is_valid(&manifest.version) {
        return Err(ManifestError::InvalidVersion {
            path: path.to_path_buf(),
            field: "version",
            value: manifest.version.clone(),
        });
    }
    if let Some(min) = &manifest.min_version {
        if !semver::is_valid(min) {
            return Err(ManifestError::InvalidVersion {
                path: path.to_path_buf(),
                field: "minVersion",
                value: min.clone(),
            });
        }
    }
    Ok(())
}
