//! The engine facade
//!
//! [`Engine`] orchestrates the full plugin lifecycle: `load` extracts
//! bundles and admits manifests, `start` instantiates load-on-start
//! plugins and fires start-on-load extension points, `call_extension`
//! routes a payload to a resolved extension with lazy instantiation.
//!
//! Locking discipline: the registry sits behind one mutex, every live
//! instance behind its own. No lock is ever held across a call into the
//! sandbox — lookups are snapshotted before the call, instance handles are
//! committed after it. That is what lets a plugin call `callExtension`
//! against a not-yet-instantiated plugin from inside its own call frame.

use crate::archive;
use crate::hostcalls::HostFunction;
use crate::manifest;
use crate::registry::{
    EpHandler, EpOrigin, NativeEpCallback, PluginKey, Registry, RegistryError,
};
use crate::sandbox::{InstanceHandle, SandboxConfig, SandboxError, SandboxManager};
use crate::{events, lock};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use trellis_plugin_api::{Event, ExtensionDecl, ExtensionPointDecl, PluginManifest};
use wasmtime_wasi::preview1::WasiP1Ctx;

/// Errors surfaced by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("output directory {path} unavailable: {source}")]
    OutputDirUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unknown extension: {0}")]
    ExtensionUnknown(String),

    #[error("extension is not resolved: {0}")]
    ExtensionUnresolved(String),

    #[error("unknown plugin: {0}")]
    PluginUnknown(PluginKey),

    #[error("plugin call failed for extension {extension}: {source}")]
    PluginCallFailed {
        extension: String,
        #[source]
        source: SandboxError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where bundles get extracted. Created on construction (`0o770` on
    /// unix).
    pub output_dir: PathBuf,

    /// Engine verbosity; at `DEBUG` and above, plugin stdout/stderr are
    /// inherited by the host process.
    pub log_level: tracing::Level,

    /// Per-instance sandbox limits.
    pub sandbox: SandboxConfig,
}

impl EngineConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            log_level: tracing::Level::INFO,
            sandbox: SandboxConfig::default(),
        }
    }

    pub fn log_level(mut self, level: tracing::Level) -> Self {
        self.log_level = level;
        self
    }

    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.sandbox.fuel_limit = fuel;
        self
    }
}

/// Read-only projection of a registered plugin.
#[derive(Debug, Clone)]
pub struct PluginStatus {
    pub key: PluginKey,
    pub manifest: PluginManifest,
    pub module_path: PathBuf,
    pub instantiated: bool,
    pub resolved: bool,
}

/// State shared between the facade and host functions running inside
/// plugin calls. Host functions hold it through a weak reference in each
/// store, so dropping the engine releases everything.
pub(crate) struct EngineShared {
    pub registry: Mutex<Registry>,
    pub sandbox: SandboxManager,
    pub host_funcs: Vec<HostFunction>,
    pub output_dir: PathBuf,
}

/// Per-store state: WASI context plus the identity of the plugin the store
/// belongs to.
pub(crate) struct StoreState {
    pub wasi: WasiP1Ctx,
    pub shared: Weak<EngineShared>,
    pub plugin: PluginKey,
}

impl StoreState {
    pub(crate) fn context(&self) -> anyhow::Result<(Arc<EngineShared>, PluginKey)> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("engine has been dropped"))?;
        Ok((shared, self.plugin.clone()))
    }
}

/// The WASM plugin engine. Cheap to clone-share via its interior `Arc`;
/// all operations take `&self`.
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Create an engine: the output directory is created (fatal on
    /// failure), the registry starts empty, and the built-in host
    /// functions are appended to `host_funcs`.
    pub fn new(config: EngineConfig, host_funcs: Vec<HostFunction>) -> Result<Self, EngineError> {
        fs::create_dir_all(&config.output_dir).map_err(|source| {
            EngineError::OutputDirUnavailable {
                path: config.output_dir.clone(),
                source,
            }
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&config.output_dir, fs::Permissions::from_mode(0o770)).map_err(
                |source| EngineError::OutputDirUnavailable {
                    path: config.output_dir.clone(),
                    source,
                },
            )?;
        }

        let mut sandbox_config = config.sandbox.clone();
        sandbox_config.inherit_stdio = config.log_level >= tracing::Level::DEBUG;
        let sandbox = SandboxManager::new(sandbox_config)?;

        tracing::info!(
            category = "engine",
            output_dir = %config.output_dir.display(),
            host_funcs = host_funcs.len(),
            "Engine created"
        );

        Ok(Self {
            shared: Arc::new(EngineShared {
                registry: Mutex::new(Registry::new()),
                sandbox,
                host_funcs,
                output_dir: config.output_dir,
            }),
        })
    }

    /// Register an extension point owned by the host application (no
    /// owning plugin, no dispatch handler) and re-run resolution.
    pub fn register_host_extension_point(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) {
        let decl = ExtensionPointDecl::new(id, version)
            .name(name)
            .description(description);
        lock(&self.shared.registry).add_host_extension_point(decl, None);
    }

    /// Register a host-owned extension point with a native callback; a
    /// start-on-load point's callback receives the extensions resolved
    /// against it during [`start`](Self::start).
    pub fn register_host_extension_point_with(
        &self,
        decl: ExtensionPointDecl,
        callback: NativeEpCallback,
    ) {
        lock(&self.shared.registry).add_host_extension_point(decl, Some(callback));
    }

    /// Load plugins from `path`, resolved against the process working
    /// directory: every supported archive in the tree is extracted into
    /// the output directory and its manifests admitted; loose manifests
    /// sitting next to a `*.wasm` in the tree are admitted directly.
    ///
    /// Bundle and manifest failures are contained: logged, siblings
    /// continue. An unreadable tree is an error.
    ///
    /// `http`/`https` sources are not implemented; they log and return Ok.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        let lower = path.to_string_lossy().to_ascii_lowercase();
        if lower.starts_with("http") {
            tracing::info!(
                category = "load",
                url = %path.display(),
                "URL plugin sources are not supported yet; skipping"
            );
            return Ok(());
        }

        let root = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|source| EngineError::Io {
                    path: path.to_path_buf(),
                    source,
                })?
                .join(path)
        };

        let mut files = Vec::new();
        if root.is_file() {
            files.push(root.clone());
        } else {
            walk_files(&root, &mut files)?;
        }

        for file in files.iter().filter(|f| archive::is_supported_archive(f)) {
            match archive::extract(file, &self.shared.output_dir) {
                Ok(bundle) => {
                    for manifest_path in &bundle.manifests {
                        self.admit_manifest(manifest_path, &bundle.modules);
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        category = "archive",
                        bundle = %file.display(),
                        error = %error,
                        "Bundle rejected"
                    );
                }
            }
        }

        // Loose manifests: only directories that also hold a module are
        // considered, so stray YAML/JSON files in the tree stay quiet.
        let modules: Vec<PathBuf> = files
            .iter()
            .filter(|f| f.extension().is_some_and(|e| e == "wasm"))
            .cloned()
            .collect();
        for manifest_path in files.iter().filter(|f| is_manifest_file(f)) {
            let siblings: Vec<PathBuf> = modules
                .iter()
                .filter(|m| m.parent() == manifest_path.parent())
                .cloned()
                .collect();
            if siblings.is_empty() {
                continue;
            }
            self.admit_manifest(manifest_path, &siblings);
        }

        lock(&self.shared.registry).resolve();
        Ok(())
    }

    /// Parse, admit and register one manifest, choosing its module from
    /// `modules` (same directory preferred, then matching stem).
    fn admit_manifest(&self, manifest_path: &Path, modules: &[PathBuf]) {
        let manifest = match manifest::load_manifest(manifest_path) {
            Ok(manifest) => manifest,
            Err(error) => {
                tracing::warn!(
                    category = "manifest",
                    manifest = %manifest_path.display(),
                    error = %error,
                    "Manifest rejected"
                );
                return;
            }
        };

        let module_path = match pick_module(manifest_path, modules) {
            Some(module) => module,
            None => {
                tracing::warn!(
                    category = "manifest",
                    manifest = %manifest_path.display(),
                    "No module found for manifest"
                );
                return;
            }
        };

        // The file may have been overwritten by re-extraction.
        self.shared.sandbox.invalidate(&module_path);

        let result = lock(&self.shared.registry).add_plugin(manifest, module_path);
        match result {
            Ok((_, orphaned)) => drop(orphaned),
            Err(error) => {
                tracing::warn!(
                    category = "registry",
                    manifest = %manifest_path.display(),
                    error = %error,
                    "Plugin rejected"
                );
            }
        }
    }

    /// Instantiate every plugin marked load-on-start, then fire
    /// start-on-load extension points. Per-plugin failures are contained.
    pub fn start(&self) -> Result<(), EngineError> {
        let keys: Vec<PluginKey> = {
            let registry = lock(&self.shared.registry);
            registry
                .plugin_keys()
                .into_iter()
                .filter(|key| {
                    registry
                        .plugin(key)
                        .is_some_and(|rec| rec.manifest.load_on_start && rec.instance.is_none())
                })
                .collect()
        };

        for key in keys {
            if let Err(error) = EngineShared::ensure_instance(&self.shared, &key) {
                tracing::warn!(
                    category = "sandbox",
                    plugin = %key,
                    error = %error,
                    "Load-on-start instantiation failed"
                );
            }
        }

        let points = lock(&self.shared.registry).start_on_load_points();
        for (decl, origin, handler, extensions) in points {
            match handler {
                EpHandler::Native(callback) => {
                    if let Err(error) = callback(&extensions) {
                        tracing::warn!(
                            category = "engine",
                            extension_point = %decl.id,
                            error = %error,
                            "Start-on-load callback failed"
                        );
                    }
                }
                EpHandler::Wasm { func_name: Some(func) } => {
                    if let EpOrigin::Plugin(owner) = origin {
                        if let Err(error) =
                            EngineShared::call_plugin_func(&self.shared, &owner, &func, &[])
                        {
                            tracing::warn!(
                                category = "engine",
                                extension_point = %decl.id,
                                plugin = %owner,
                                func = %func,
                                error = %error,
                                "Start-on-load dispatch failed"
                            );
                        }
                    }
                }
                EpHandler::Wasm { func_name: None } => {}
            }
        }

        Ok(())
    }

    /// Call a resolved extension with `payload`, instantiating its owner
    /// if needed, and return the response bytes.
    pub fn call_extension(
        &self,
        extension_id: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        EngineShared::call_extension(&self.shared, extension_id, payload)
    }

    /// Dispatch an event from the host application; returns the number of
    /// listeners that completed.
    pub fn send_event(&self, event: &Event) -> usize {
        events::dispatch(&self.shared, event)
    }

    /// The resolved extension registered under `extension_id`.
    pub fn extension_for_id(&self, extension_id: &str) -> Option<ExtensionDecl> {
        lock(&self.shared.registry)
            .extension(extension_id)
            .map(|ext| ext.decl.clone())
    }

    /// Every registered plugin, sorted by id then version.
    pub fn plugins(&self) -> Vec<PluginStatus> {
        let registry = lock(&self.shared.registry);
        registry
            .plugin_keys()
            .into_iter()
            .filter_map(|key| {
                registry.plugin(&key).map(|rec| PluginStatus {
                    manifest: rec.manifest.clone(),
                    module_path: rec.module_path.clone(),
                    instantiated: rec.instance.is_some(),
                    resolved: rec.resolved,
                    key,
                })
            })
            .collect()
    }

    /// Resolved extensions attached to an extension point; empty filter
    /// means "first point registered under the id", one element is an
    /// exact version match, two elements are reserved range syntax.
    pub fn extensions_for_extension_point(
        &self,
        extension_point_id: &str,
        version_filter: &[&str],
    ) -> Result<Vec<ExtensionDecl>, EngineError> {
        Ok(lock(&self.shared.registry)
            .extensions_for_extension_point(extension_point_id, version_filter)?)
    }

    /// Remove a plugin record; its extensions leave the indices and
    /// extensions resolved against its points go back to pending.
    pub fn remove_plugin(&self, key: &PluginKey) {
        let orphaned = lock(&self.shared.registry).remove_plugin(key);
        drop(orphaned);
    }

    /// Number of extensions still waiting for their extension point.
    pub fn pending_extension_count(&self) -> usize {
        lock(&self.shared.registry).pending_len()
    }
}

impl EngineShared {
    /// Route a call to `extension_id`. Surfaces `ExtensionUnknown` /
    /// `ExtensionUnresolved` synchronously; call failures come back
    /// annotated with the extension id.
    pub(crate) fn call_extension(
        shared: &Arc<Self>,
        extension_id: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let (owner, func_name) = {
            let registry = lock(&shared.registry);
            match registry.extension(extension_id) {
                Some(ext) => (ext.owner.clone(), ext.decl.func_name.clone()),
                None => {
                    return Err(if registry.is_pending(extension_id) {
                        EngineError::ExtensionUnresolved(extension_id.to_string())
                    } else {
                        EngineError::ExtensionUnknown(extension_id.to_string())
                    });
                }
            }
        };

        Self::call_plugin_func(shared, &owner, &func_name, payload).map_err(|error| match error {
            EngineError::Sandbox(
                source @ (SandboxError::Call { .. }
                | SandboxError::FuelExhausted
                | SandboxError::ExportNotFound(_)
                | SandboxError::MemoryAccess(_)),
            ) => EngineError::PluginCallFailed {
                extension: extension_id.to_string(),
                source,
            },
            other => other,
        })
    }

    /// Invoke an export on a plugin, instantiating it first if needed.
    pub(crate) fn call_plugin_func(
        shared: &Arc<Self>,
        key: &PluginKey,
        func: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let handle = Self::ensure_instance(shared, key)?;
        let mut instance = lock(&handle);
        Ok(instance.call(func, payload)?)
    }

    /// Get the plugin's live instance, creating one when absent. The
    /// registry lock is released around instantiation (whose `start` may
    /// re-enter the registry through `registerPlugin`); the handle is
    /// committed afterwards, first writer wins.
    pub(crate) fn ensure_instance(
        shared: &Arc<Self>,
        key: &PluginKey,
    ) -> Result<InstanceHandle, EngineError> {
        let (existing, module_path) = {
            let registry = lock(&shared.registry);
            let record = registry
                .plugin(key)
                .ok_or_else(|| EngineError::PluginUnknown(key.clone()))?;
            (record.instance.clone(), record.module_path.clone())
        };
        if let Some(handle) = existing {
            return Ok(handle);
        }

        let handle = shared.sandbox.instantiate(shared, key.clone(), &module_path)?;

        let mut registry = lock(&shared.registry);
        Ok(match registry.plugin_mut(key) {
            Some(record) => record.instance.get_or_insert_with(|| handle).clone(),
            // The record was replaced while we instantiated; serve this
            // call with the fresh instance and let it retire.
            None => handle,
        })
    }

    /// Runtime self-description from `registerPlugin`: admit the manifest
    /// under the calling plugin's module path.
    pub(crate) fn register_manifest(&self, caller: &PluginKey, manifest: PluginManifest) {
        let mut registry = lock(&self.registry);
        let module_path = match registry.plugin(caller) {
            Some(record) => record.module_path.clone(),
            None => {
                tracing::warn!(
                    category = "registry",
                    plugin = %caller,
                    "registerPlugin from a plugin the registry does not know"
                );
                return;
            }
        };
        match registry.add_plugin(manifest, module_path) {
            Ok((key, orphaned)) => {
                if orphaned.is_some() {
                    tracing::debug!(
                        category = "registry",
                        plugin = %key,
                        "Previous instance orphaned by runtime registration"
                    );
                }
            }
            Err(error) => {
                tracing::warn!(
                    category = "registry",
                    plugin = %caller,
                    error = %error,
                    "Runtime manifest rejected"
                );
            }
        }
    }
}

fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

/// Prefer a module in the manifest's directory with a matching stem, then
/// any module in the same directory, then the first module at all.
fn pick_module(manifest_path: &Path, modules: &[PathBuf]) -> Option<PathBuf> {
    let dir = manifest_path.parent();
    let stem = manifest_path.file_stem();
    modules
        .iter()
        .find(|m| m.parent() == dir && m.file_stem() == stem)
        .or_else(|| modules.iter().find(|m| m.parent() == dir))
        .or_else(|| modules.first())
        .cloned()
}

fn walk_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), EngineError> {
    let entries = fs::read_dir(dir).map_err(|source| EngineError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| EngineError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            walk_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}
