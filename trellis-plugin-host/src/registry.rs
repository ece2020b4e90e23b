//! Plugin registry and extension resolver
//!
//! The registry is the single owner of all plugin state. It keeps five
//! indices:
//!
//! - `plugins`: plugin id → version → record
//! - `extension_points`: point id → contributed points, in insertion order
//! - `extensions`: extension id → resolved extension record
//! - `pending`: FIFO queue of extensions whose point is not yet registered
//! - `owner_of`: extension id → owning plugin key (the call index)
//!
//! Records reference each other by key/id, never by owning pointer: an
//! extension point lists the ids of its attached extensions, an extension
//! carries its owner's [`PluginKey`]. The registry is the arena.

use crate::sandbox::InstanceHandle;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use trellis_plugin_api::{semver, ExtensionDecl, ExtensionPointDecl, PluginManifest};

/// Errors surfaced by registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("plugin id must not be empty")]
    IdMissing,

    #[error("{0:?} is not a valid MAJOR.MINOR.PATCH version")]
    VersionInvalid(String),

    #[error("version filter accepts at most two elements, got {0}")]
    VersionFilterInvalid(usize),
}

/// Identity of a plugin record: id plus exact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PluginKey {
    pub id: String,
    pub version: String,
}

impl PluginKey {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Native callback run when a host-owned, start-on-load extension point
/// fires; receives the extensions resolved against the point.
pub type NativeEpCallback = Arc<dyn Fn(&[ExtensionDecl]) -> anyhow::Result<()> + Send + Sync>;

/// Who contributed an extension point.
#[derive(Clone)]
pub(crate) enum EpOrigin {
    Plugin(PluginKey),
    Host,
}

/// How a start-on-load extension point is dispatched.
#[derive(Clone)]
pub(crate) enum EpHandler {
    /// A plugin export named by the point's `funcName`.
    Wasm { func_name: Option<String> },
    /// A host-application callback.
    Native(NativeEpCallback),
}

pub(crate) struct PluginRecord {
    pub manifest: PluginManifest,
    pub module_path: PathBuf,
    pub instance: Option<InstanceHandle>,
    /// True once every extension this plugin declared has resolved.
    pub resolved: bool,
}

#[derive(Clone)]
pub(crate) struct ExtensionRecord {
    pub decl: ExtensionDecl,
    pub owner: PluginKey,
    pub resolved: bool,
}

pub(crate) struct ExtensionPointRecord {
    pub decl: ExtensionPointDecl,
    pub origin: EpOrigin,
    pub handler: EpHandler,
    /// Ids of extensions attached by the resolver, in resolution order.
    pub extensions: Vec<String>,
}

#[derive(Clone)]
pub(crate) struct ListenerBinding {
    pub plugin: PluginKey,
    pub func: String,
}

/// The engine's plugin/extension state. Callers hold it behind a mutex and
/// must never keep that mutex across a sandbox call.
#[derive(Default)]
pub(crate) struct Registry {
    plugins: HashMap<String, HashMap<String, PluginRecord>>,
    extension_points: HashMap<String, Vec<ExtensionPointRecord>>,
    extensions: HashMap<String, ExtensionRecord>,
    pending: VecDeque<ExtensionRecord>,
    owner_of: HashMap<String, PluginKey>,
    listeners: HashMap<String, Vec<ListenerBinding>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a plugin record and enqueue its contributions.
    ///
    /// A record already present at the same `(id, version)` is replaced:
    /// its extensions and extension points leave the indices, extensions of
    /// *other* plugins that were resolved against the removed points go
    /// back to pending, and the old instance handle is returned for
    /// disposal once in-flight calls complete.
    ///
    /// Ends with a [`resolve`](Self::resolve) pass.
    pub fn add_plugin(
        &mut self,
        manifest: PluginManifest,
        module_path: PathBuf,
    ) -> Result<(PluginKey, Option<InstanceHandle>), RegistryError> {
        if manifest.id.trim().is_empty() {
            return Err(RegistryError::IdMissing);
        }
        if !semver::is_valid(&manifest.version) {
            return Err(RegistryError::VersionInvalid(manifest.version.clone()));
        }
        if let Some(min) = &manifest.min_version {
            if !semver::is_valid(min) {
                return Err(RegistryError::VersionInvalid(min.clone()));
            }
        }

        let key = PluginKey::new(manifest.id.clone(), manifest.version.clone());
        let orphaned = self.evict(&key);

        for ext in &manifest.extensions {
            self.pending.push_back(ExtensionRecord {
                decl: ext.clone(),
                owner: key.clone(),
                resolved: false,
            });
        }

        for ep in &manifest.extension_points {
            self.extension_points
                .entry(ep.id.clone())
                .or_default()
                .push(ExtensionPointRecord {
                    decl: ep.clone(),
                    origin: EpOrigin::Plugin(key.clone()),
                    handler: EpHandler::Wasm {
                        func_name: ep.func_name.clone(),
                    },
                    extensions: Vec::new(),
                });
        }

        for listener in &manifest.listeners {
            self.listeners
                .entry(listener.event.clone())
                .or_default()
                .push(ListenerBinding {
                    plugin: key.clone(),
                    func: listener.func.clone(),
                });
        }

        let record = PluginRecord {
            resolved: manifest.extensions.is_empty(),
            manifest,
            module_path,
            instance: None,
        };
        self.plugins
            .entry(key.id.clone())
            .or_default()
            .insert(key.version.clone(), record);

        tracing::info!(category = "registry", plugin = %key, "Plugin registered");
        self.resolve();
        Ok((key, orphaned))
    }

    /// Register an extension point contributed by the host application.
    pub fn add_host_extension_point(
        &mut self,
        decl: ExtensionPointDecl,
        callback: Option<NativeEpCallback>,
    ) {
        let handler = match callback {
            Some(cb) => EpHandler::Native(cb),
            None => EpHandler::Wasm { func_name: None },
        };
        tracing::info!(category = "registry", extension_point = %decl.id, "Host extension point registered");
        self.extension_points
            .entry(decl.id.clone())
            .or_default()
            .push(ExtensionPointRecord {
                decl,
                origin: EpOrigin::Host,
                handler,
                extensions: Vec::new(),
            });
        self.resolve();
    }

    /// Remove a plugin record entirely. Returns the orphaned instance
    /// handle, if any.
    pub fn remove_plugin(&mut self, key: &PluginKey) -> Option<InstanceHandle> {
        let orphaned = self.evict(key);
        tracing::info!(category = "registry", plugin = %key, "Plugin removed");
        self.resolve();
        orphaned
    }

    /// Shared eviction path for replacement and removal: drops the record,
    /// purges everything it owned, and re-enqueues foreign extensions that
    /// were resolved against its extension points.
    fn evict(&mut self, key: &PluginKey) -> Option<InstanceHandle> {
        let record = match self.plugins.get_mut(&key.id) {
            Some(versions) => versions.remove(&key.version),
            None => None,
        };
        if self.plugins.get(&key.id).is_some_and(|v| v.is_empty()) {
            self.plugins.remove(&key.id);
        }
        let record = record?;

        // Extensions owned by the evicted plugin leave every index.
        self.extensions.retain(|_, ext| &ext.owner != key);
        self.owner_of.retain(|_, owner| owner != key);
        self.pending.retain(|ext| &ext.owner != key);
        for listeners in self.listeners.values_mut() {
            listeners.retain(|binding| &binding.plugin != key);
        }
        self.listeners.retain(|_, bindings| !bindings.is_empty());

        // Extension points contributed by the evicted plugin disappear;
        // extensions of other plugins that were attached to them become
        // pending again.
        let mut displaced: Vec<ExtensionRecord> = Vec::new();
        {
            let extensions = &mut self.extensions;
            let owner_of = &mut self.owner_of;
            for points in self.extension_points.values_mut() {
                points.retain(|point| {
                    let owned = matches!(&point.origin, EpOrigin::Plugin(owner) if owner == key);
                    if owned {
                        for ext_id in &point.extensions {
                            if let Some(mut ext) = extensions.remove(ext_id) {
                                owner_of.remove(ext_id);
                                ext.resolved = false;
                                displaced.push(ext);
                            }
                        }
                    }
                    !owned
                });
            }
        }
        self.extension_points.retain(|_, points| !points.is_empty());
        for ext in displaced {
            let owner = ext.owner.clone();
            self.pending.push_back(ext);
            if let Some(rec) = self.plugin_mut(&owner) {
                rec.resolved = false;
            }
        }

        // Attachment lists may still name purged extensions of the evicted
        // plugin; scrub them.
        {
            let extensions = &self.extensions;
            for points in self.extension_points.values_mut() {
                for point in points.iter_mut() {
                    point
                        .extensions
                        .retain(|ext_id| extensions.contains_key(ext_id));
                }
            }
        }

        record.instance
    }

    /// Walk the pending queue and attach every extension whose point is
    /// registered. An extension stays pending only when *no* point with a
    /// matching id exists after the full scan. Idempotent.
    pub fn resolve(&mut self) {
        let mut leftover = VecDeque::new();

        while let Some(mut ext) = self.pending.pop_front() {
            let has_point = self
                .extension_points
                .get(&ext.decl.extension_point)
                .is_some_and(|points| !points.is_empty());
            if !has_point {
                leftover.push_back(ext);
                continue;
            }

            // A duplicate id replaces the previous resolution entirely:
            // the stale attachment leaves whichever point held it, so the
            // id maps to exactly one extension and one point afterwards.
            if self.extensions.remove(&ext.decl.id).is_some() {
                tracing::warn!(
                    category = "registry",
                    extension = %ext.decl.id,
                    "Duplicate extension id; replacing previous resolution"
                );
                for points in self.extension_points.values_mut() {
                    for point in points.iter_mut() {
                        point.extensions.retain(|id| id != &ext.decl.id);
                    }
                }
            }

            // Multiple points may share the id; the first registered wins.
            if let Some(points) = self.extension_points.get_mut(&ext.decl.extension_point) {
                points[0].extensions.push(ext.decl.id.clone());
            }
            ext.resolved = true;
            tracing::debug!(
                category = "registry",
                extension = %ext.decl.id,
                extension_point = %ext.decl.extension_point,
                "Extension resolved"
            );
            self.owner_of
                .insert(ext.decl.id.clone(), ext.owner.clone());
            self.extensions.insert(ext.decl.id.clone(), ext);
        }

        self.pending = leftover;

        // A plugin is resolved once none of its extensions remain pending.
        for versions in self.plugins.values_mut() {
            for (version, record) in versions.iter_mut() {
                let key = PluginKey::new(record.manifest.id.clone(), version.clone());
                record.resolved = !self.pending.iter().any(|ext| ext.owner == key);
            }
        }
    }

    /// Extension points registered under `id`, narrowed by a version
    /// filter: empty filter → the first point registered; one element →
    /// exact version match; two elements → both bounds must be valid
    /// semver, range matching is reserved and yields nothing.
    pub fn find_extension_points(
        &self,
        id: &str,
        version_filter: &[&str],
    ) -> Result<Vec<&ExtensionPointRecord>, RegistryError> {
        match version_filter {
            [] => {}
            [single] => {
                if !semver::is_valid(single) {
                    return Err(RegistryError::VersionInvalid(single.to_string()));
                }
            }
            [lo, hi] => {
                if !semver::is_valid(lo) {
                    return Err(RegistryError::VersionInvalid(lo.to_string()));
                }
                if !semver::is_valid(hi) {
                    return Err(RegistryError::VersionInvalid(hi.to_string()));
                }
                // Range filters are reserved syntax: validated, never matched.
                return Ok(Vec::new());
            }
            more => return Err(RegistryError::VersionFilterInvalid(more.len())),
        }

        let points = match self.extension_points.get(id) {
            Some(points) => points,
            None => return Ok(Vec::new()),
        };

        Ok(match version_filter.first() {
            None => points.iter().take(1).collect(),
            Some(version) => points
                .iter()
                .filter(|point| point.decl.version == *version)
                .collect(),
        })
    }

    /// Resolved extensions attached to the points selected by
    /// [`find_extension_points`], in attachment order.
    pub fn extensions_for_extension_point(
        &self,
        id: &str,
        version_filter: &[&str],
    ) -> Result<Vec<ExtensionDecl>, RegistryError> {
        let points = self.find_extension_points(id, version_filter)?;
        let mut out = Vec::new();
        for point in points {
            for ext_id in &point.extensions {
                if let Some(ext) = self.extensions.get(ext_id) {
                    out.push(ext.decl.clone());
                }
            }
        }
        Ok(out)
    }

    pub fn owner_of(&self, extension_id: &str) -> Option<&PluginKey> {
        self.owner_of.get(extension_id)
    }

    pub fn extension(&self, extension_id: &str) -> Option<&ExtensionRecord> {
        self.extensions.get(extension_id)
    }

    pub fn is_pending(&self, extension_id: &str) -> bool {
        self.pending.iter().any(|ext| ext.decl.id == extension_id)
    }

    pub fn plugin(&self, key: &PluginKey) -> Option<&PluginRecord> {
        self.plugins.get(&key.id)?.get(&key.version)
    }

    pub fn plugin_mut(&mut self, key: &PluginKey) -> Option<&mut PluginRecord> {
        self.plugins.get_mut(&key.id)?.get_mut(&key.version)
    }

    pub fn plugin_keys(&self) -> Vec<PluginKey> {
        let mut keys: Vec<PluginKey> = self
            .plugins
            .iter()
            .flat_map(|(id, versions)| {
                versions
                    .keys()
                    .map(|version| PluginKey::new(id.clone(), version.clone()))
            })
            .collect();
        keys.sort_by(|a, b| (&a.id, &a.version).cmp(&(&b.id, &b.version)));
        keys
    }

    pub fn listeners_for(&self, event_id: &str) -> Vec<ListenerBinding> {
        self.listeners.get(event_id).cloned().unwrap_or_default()
    }

    /// Snapshot of every start-on-load extension point, in registration
    /// order per id.
    pub fn start_on_load_points(&self) -> Vec<(ExtensionPointDecl, EpOrigin, EpHandler, Vec<ExtensionDecl>)> {
        let mut out = Vec::new();
        let mut ids: Vec<&String> = self.extension_points.keys().collect();
        ids.sort();
        for id in ids {
            for point in &self.extension_points[id] {
                if !point.decl.start_on_load {
                    continue;
                }
                let attached = point
                    .extensions
                    .iter()
                    .filter_map(|ext_id| self.extensions.get(ext_id))
                    .map(|ext| ext.decl.clone())
                    .collect();
                out.push((
                    point.decl.clone(),
                    point.origin.clone(),
                    point.handler.clone(),
                    attached,
                ));
            }
        }
        out
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
