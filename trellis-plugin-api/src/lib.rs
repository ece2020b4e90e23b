//! trellis-plugin-api: Shared types for the trellis plugin engine
//!
//! This crate defines the contract between the host engine and WASM plugins:
//! the manifest model (plugins, extension points, extensions, listeners),
//! the event type carried by the engine's event bus, the semver rule used
//! for manifest admission, and the packed-pointer memory ABI helpers.
//!
//! Manifests are declarative YAML or JSON documents; the same types also
//! travel as JSON through the `registerPlugin` and
//! `getExtensionsForExtensionPoint` host functions, so the serde field
//! names here *are* the wire format.

use serde::{Deserialize, Serialize};

pub mod abi;
pub mod semver;

/// Declarative description of a plugin: its identity plus the extension
/// points and extensions it contributes.
///
/// Parsed from a bundle's manifest file at load time and re-sent as JSON by
/// the plugin's `start` export through the `registerPlugin` host function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier. Reverse-domain ids are conventional
    /// (`org.example.editor`), but any non-empty string works.
    pub id: String,

    /// Display name, not to be confused with the id.
    #[serde(default)]
    pub name: String,

    /// Plugin version, `MAJOR.MINOR.PATCH`. Gate for admission.
    pub version: String,

    /// Minimum engine version this plugin requires, `MAJOR.MINOR.PATCH`.
    #[serde(default, rename = "minVersion", skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,

    #[serde(default)]
    pub description: String,

    /// When true the engine instantiates this plugin during `start()`
    /// instead of waiting for the first extension call.
    #[serde(default, rename = "loadOnStart")]
    pub load_on_start: bool,

    /// Extension points this plugin contributes.
    #[serde(default, rename = "extensionPoints")]
    pub extension_points: Vec<ExtensionPointDecl>,

    /// Extensions this plugin attaches to extension points.
    #[serde(default)]
    pub extensions: Vec<ExtensionDecl>,

    /// Event listeners: named plugin exports invoked when a matching event
    /// is dispatched.
    #[serde(default)]
    pub listeners: Vec<ListenerDecl>,
}

impl PluginManifest {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            version: version.into(),
            min_version: None,
            description: String::new(),
            load_on_start: false,
            extension_points: Vec::new(),
            extensions: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn load_on_start(mut self) -> Self {
        self.load_on_start = true;
        self
    }

    pub fn extension_point(mut self, ep: ExtensionPointDecl) -> Self {
        self.extension_points.push(ep);
        self
    }

    pub fn extension(mut self, ext: ExtensionDecl) -> Self {
        self.extensions.push(ext);
        self
    }

    pub fn listener(mut self, event: impl Into<String>, func: impl Into<String>) -> Self {
        self.listeners.push(ListenerDecl {
            event: event.into(),
            func: func.into(),
        });
        self
    }
}

/// A named anchor that extensions attach to.
///
/// The id is the matching key: an extension resolves against every point
/// sharing its `extensionPoint` id, regardless of which plugin (or the
/// host) contributed the point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionPointDecl {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub version: String,

    /// When true, the engine dispatches this point once all plugins are
    /// loaded and resolved: a plugin-owned point has its `funcName` export
    /// invoked, a host-owned point has its native callback run.
    #[serde(default, rename = "startOnLoad")]
    pub start_on_load: bool,

    /// Export inside the owning plugin invoked on start-on-load dispatch.
    /// Irrelevant for host-owned points.
    #[serde(default, rename = "funcName", skip_serializing_if = "Option::is_none")]
    pub func_name: Option<String>,

    /// Expected payload/response shape for extensions attaching here.
    /// Opaque to the engine; interpreted by the point's owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDecl>,
}

impl ExtensionPointDecl {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            version: version.into(),
            start_on_load: false,
            func_name: None,
            schema: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn start_on_load(mut self, func_name: impl Into<String>) -> Self {
        self.start_on_load = true;
        self.func_name = Some(func_name.into());
        self
    }
}

/// Payload schema attached to an extension point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDecl {
    /// Schema dialect, e.g. `"jsonschema"`.
    #[serde(rename = "type")]
    pub schema_type: String,

    /// The schema document itself, opaque bytes.
    #[serde(default)]
    pub schema: Vec<u8>,
}

/// A binding of a named plugin export to an extension point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionDecl {
    /// Globally unique across the live registry; the handle callers use
    /// with `callExtension`.
    pub id: String,

    /// Id of the extension point this extension attaches to.
    #[serde(rename = "extensionPoint")]
    pub extension_point: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Name of the WASM export in the owning plugin. Called with the
    /// payload bytes, returns response bytes.
    #[serde(rename = "funcName")]
    pub func_name: String,

    /// Static data for the receiving extension point to consume without
    /// calling the extension function (menu labels, help entries, ...).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<u8>,
}

impl ExtensionDecl {
    pub fn new(
        id: impl Into<String>,
        extension_point: impl Into<String>,
        func_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            extension_point: extension_point.into(),
            name: String::new(),
            description: String::new(),
            func_name: func_name.into(),
            metadata: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// An event listener declared in a manifest: when `event` is dispatched,
/// the engine invokes the `func` export on the declaring plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerDecl {
    pub event: String,
    pub func: String,
}

/// An event traveling through the engine's event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,

    /// Originator: a plugin id or a host-chosen label.
    #[serde(default)]
    pub source: String,

    /// Optional addressee; empty means every listener of `id`.
    #[serde(default)]
    pub target: String,

    #[serde(default)]
    pub data: Vec<u8>,
}

impl Event {
    pub fn new(id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            source: String::new(),
            target: String::new(),
            data: data.into(),
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}
