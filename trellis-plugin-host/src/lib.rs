//! trellis-plugin-host: WASM plugin engine built around extension points
//!
//! This crate is the host side of the trellis plugin model. Plugins are
//! sandboxed WASM modules shipped as `.tar.gz`/`.zip` bundles together with
//! a YAML or JSON manifest. A manifest declares *extension points* (named
//! anchors other code can attach to) and *extensions* (bindings of a plugin
//! export to an extension point). The engine loads bundles, reconciles
//! extensions against extension points, instantiates plugins on first use,
//! and routes host↔plugin calls through a small set of host functions.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Your Application                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Engine                                                     │
//! │  ├─ load("./bundles")         extract + admit manifests     │
//! │  ├─ start()                   instantiate load-on-start     │
//! │  ├─ call_extension("id", b)   lazy instantiation + invoke   │
//! │  └─ send_event(event)         fan-out to listeners          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Registry + Resolver                                        │
//! │  └─ plugins / extension points / extensions / pending       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SandboxManager (wasmtime)                                  │
//! │  ├─ shared engine + module cache                            │
//! │  ├─ WASI Preview 1, fuel + stack limits                     │
//! │  └─ host functions: registerPlugin, callExtension, ...      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use trellis_plugin_host::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::new("./work"), Vec::new())?;
//! engine.register_host_extension_point("menu.top", "Top menu", "1.0.0", "");
//! engine.load("./bundles")?;
//! engine.start()?;
//!
//! let response = engine.call_extension("org.example.menus.about", b"{}")?;
//! ```
//!
//! Plugins may call back into the engine while executing: an extension
//! function that invokes the `callExtension` host function can reach an
//! extension of a plugin that has never run — the engine instantiates it on
//! the spot. Per-plugin failures (bad bundles, rejected manifests, traps in
//! `start`) are contained and logged; per-call failures surface to the
//! caller.

pub mod archive;
pub mod engine;
pub mod events;
pub mod hostcalls;
pub mod manifest;
pub mod registry;
pub mod sandbox;

pub use archive::{ArchiveError, BundleContents};
pub use engine::{Engine, EngineConfig, EngineError, PluginStatus};
pub use hostcalls::HostFunction;
pub use manifest::ManifestError;
pub use registry::{NativeEpCallback, PluginKey, RegistryError};
pub use sandbox::{SandboxConfig, SandboxError};

pub use trellis_plugin_api::{
    abi, semver, Event, ExtensionDecl, ExtensionPointDecl, ListenerDecl, PluginManifest,
    SchemaDecl,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock that survives a poisoned mutex; engine state stays reachable even
/// if a host thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
