//! Sandboxed plugin instantiation and invocation
//!
//! One `wasmtime::Engine` is shared by every plugin so compiled code is
//! cached across instantiations; compiled modules are additionally memoized
//! per module path, so replacing or re-instantiating a plugin skips
//! recompilation. Each instance gets its own store with a WASI Preview 1
//! context, a fuel budget, and the host-function table linked in.
//!
//! Instances are not safe for parallel entry: callers serialize access
//! through the per-instance mutex in [`InstanceHandle`] and must never hold
//! the registry lock across a call into here.

use crate::engine::{EngineShared, StoreState};
use crate::hostcalls;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use trellis_plugin_api::abi;
use wasmtime::{Config, Engine, Instance, Linker, Memory, Module, Store, Trap, TypedFunc};
use wasmtime_wasi::WasiCtxBuilder;

/// Errors that can occur while instantiating or calling a plugin
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("failed to read module {path}: {source}")]
    ModuleRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("module compilation failed for {path}: {source}")]
    Compilation {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("export not found: {0}")]
    ExportNotFound(String),

    #[error("start export failed: {0}")]
    Start(#[source] anyhow::Error),

    #[error("call to export {function} failed: {source}")]
    Call {
        function: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,

    #[error("memory access error: {0}")]
    MemoryAccess(String),
}

/// Sandbox limits, applied to every plugin instance.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Fuel budget per export call (CPU limit).
    pub fuel_limit: u64,

    /// Maximum WASM stack size in bytes.
    pub max_wasm_stack: usize,

    /// Whether plugin stdout/stderr are inherited by the host process.
    pub inherit_stdio: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            fuel_limit: 10_000_000,
            max_wasm_stack: 1024 * 1024,
            inherit_stdio: true,
        }
    }
}

/// A live plugin: its store, instance and the ABI exports the engine needs.
pub(crate) struct PluginInstance {
    store: Store<StoreState>,
    instance: Instance,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    dealloc: TypedFunc<(i32, i32), ()>,
    fuel_limit: u64,
}

/// Shared handle to a live instance; the mutex serializes entry.
pub(crate) type InstanceHandle = Arc<Mutex<PluginInstance>>;

/// Owns the shared wasmtime engine and the per-path module cache.
pub(crate) struct SandboxManager {
    engine: Engine,
    config: SandboxConfig,
    modules: Mutex<HashMap<PathBuf, Module>>,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        engine_config.max_wasm_stack(config.max_wasm_stack);
        engine_config.wasm_memory64(false);

        let engine = Engine::new(&engine_config).map_err(SandboxError::EngineCreation)?;

        Ok(Self {
            engine,
            config,
            modules: Mutex::new(HashMap::new()),
        })
    }

    /// Compile `module_path`, reusing a previously compiled module when the
    /// path was seen before.
    fn module_for(&self, module_path: &Path) -> Result<Module, SandboxError> {
        if let Some(module) = crate::lock(&self.modules).get(module_path) {
            return Ok(module.clone());
        }

        let bytes = std::fs::read(module_path).map_err(|source| SandboxError::ModuleRead {
            path: module_path.to_path_buf(),
            source,
        })?;
        let module =
            Module::new(&self.engine, &bytes).map_err(|source| SandboxError::Compilation {
                path: module_path.to_path_buf(),
                source,
            })?;

        crate::lock(&self.modules)
            .insert(module_path.to_path_buf(), module.clone());
        Ok(module)
    }

    /// Drop the cached module for `module_path`; the next instantiation
    /// recompiles from disk. Used when a plugin record is replaced.
    pub fn invalidate(&self, module_path: &Path) {
        crate::lock(&self.modules).remove(module_path);
    }

    /// Create a live instance for the plugin identified by `key`:
    /// compile, link WASI + host functions, instantiate, and run the
    /// `start` export.
    ///
    /// The registry must not be locked by the caller: `start` typically
    /// calls back into the engine through `registerPlugin`.
    pub fn instantiate(
        &self,
        shared: &Arc<EngineShared>,
        key: crate::registry::PluginKey,
        module_path: &Path,
    ) -> Result<InstanceHandle, SandboxError> {
        let module = self.module_for(module_path)?;

        let mut wasi = WasiCtxBuilder::new();
        if self.config.inherit_stdio {
            wasi.inherit_stdout().inherit_stderr();
        }
        let state = StoreState {
            wasi: wasi.build_p1(),
            shared: Arc::downgrade(shared),
            plugin: key.clone(),
        };

        let mut store = Store::new(&self.engine, state);
        store
            .set_fuel(self.config.fuel_limit)
            .map_err(SandboxError::EngineCreation)?;

        let mut linker: Linker<StoreState> = Linker::new(&self.engine);
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state| &mut state.wasi)
            .map_err(SandboxError::Instantiation)?;
        hostcalls::add_user_functions(&mut linker, &shared.host_funcs)
            .map_err(SandboxError::Instantiation)?;
        hostcalls::add_builtin_functions(&mut linker).map_err(SandboxError::Instantiation)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(SandboxError::Instantiation)?;

        let memory = instance
            .get_memory(&mut store, abi::EXPORT_MEMORY)
            .ok_or_else(|| SandboxError::ExportNotFound(abi::EXPORT_MEMORY.to_string()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, abi::EXPORT_ALLOC)
            .map_err(|_| SandboxError::ExportNotFound(abi::EXPORT_ALLOC.to_string()))?;
        let dealloc = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, abi::EXPORT_DEALLOC)
            .map_err(|_| SandboxError::ExportNotFound(abi::EXPORT_DEALLOC.to_string()))?;

        let start = instance
            .get_typed_func::<(), ()>(&mut store, abi::EXPORT_START)
            .map_err(|_| SandboxError::ExportNotFound(abi::EXPORT_START.to_string()))?;
        start.call(&mut store, ()).map_err(|e| {
            if is_out_of_fuel(&e) {
                SandboxError::FuelExhausted
            } else {
                SandboxError::Start(e)
            }
        })?;

        tracing::debug!(
            category = "sandbox",
            plugin = %key,
            module = %module_path.display(),
            "Plugin instantiated"
        );

        Ok(Arc::new(Mutex::new(PluginInstance {
            store,
            instance,
            memory,
            alloc,
            dealloc,
            fuel_limit: self.config.fuel_limit,
        })))
    }
}

impl PluginInstance {
    /// Invoke the export `function` with `payload` bytes and return the
    /// response bytes (empty when the export returned 0).
    ///
    /// The fuel budget is reset before each call.
    pub fn call(&mut self, function: &str, payload: &[u8]) -> Result<Vec<u8>, SandboxError> {
        let func = self
            .instance
            .get_typed_func::<(i32, i32), i64>(&mut self.store, function)
            .map_err(|_| SandboxError::ExportNotFound(function.to_string()))?;

        self.store
            .set_fuel(self.fuel_limit)
            .map_err(SandboxError::EngineCreation)?;

        let (payload_ptr, payload_len) = if payload.is_empty() {
            (0, 0)
        } else {
            let len = i32::try_from(payload.len()).map_err(|_| {
                SandboxError::MemoryAccess(format!("payload too large: {} bytes", payload.len()))
            })?;
            let ptr = self.alloc.call(&mut self.store, len).map_err(|e| {
                if is_out_of_fuel(&e) {
                    SandboxError::FuelExhausted
                } else {
                    SandboxError::Call {
                        function: abi::EXPORT_ALLOC.to_string(),
                        source: e,
                    }
                }
            })?;
            self.memory
                .write(&mut self.store, ptr as usize, payload)
                .map_err(|e| SandboxError::MemoryAccess(e.to_string()))?;
            (ptr, len)
        };

        let packed = func
            .call(&mut self.store, (payload_ptr, payload_len))
            .map_err(|e| {
                if is_out_of_fuel(&e) {
                    SandboxError::FuelExhausted
                } else {
                    SandboxError::Call {
                        function: function.to_string(),
                        source: e,
                    }
                }
            })?;

        let response = if packed == 0 {
            Vec::new()
        } else {
            let (ptr, len) = abi::unpack_ptr_len(packed);
            let bytes = read_memory(&self.store, &self.memory, ptr, len)?;
            self.dealloc.call(&mut self.store, (ptr, len)).ok();
            bytes
        };

        if payload_len > 0 {
            self.dealloc
                .call(&mut self.store, (payload_ptr, payload_len))
                .ok();
        }

        Ok(response)
    }
}

fn is_out_of_fuel(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}

/// Bounds-checked copy out of guest memory.
fn read_memory(
    store: &Store<StoreState>,
    memory: &Memory,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, SandboxError> {
    if ptr < 0 || len < 0 {
        return Err(SandboxError::MemoryAccess(format!(
            "negative pointer or length: ptr={ptr}, len={len}"
        )));
    }
    let (ptr, len) = (ptr as usize, len as usize);
    let data = memory.data(store);
    let end = ptr
        .checked_add(len)
        .ok_or_else(|| SandboxError::MemoryAccess(format!("overflow: ptr={ptr}, len={len}")))?;
    if end > data.len() {
        return Err(SandboxError::MemoryAccess(format!(
            "out of bounds: ptr={ptr}, len={len}, memory_size={}",
            data.len()
        )));
    }
    Ok(data[ptr..end].to_vec())
}
