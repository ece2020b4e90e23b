//! Host functions callable from plugin code
//!
//! Every plugin linker gets two import namespaces: `host/user` for the
//! functions an embedding application may also extend, and
//! `host/pluginengine` for engine-owned plumbing. All parameters and
//! results are packed i64 memory references (see [`abi`]); `0` stands for
//! "no buffer".
//!
//! Domain failures inside a host function (unknown extension point, broken
//! manifest JSON, unreadable file) never trap the calling plugin: they are
//! logged and reported as `0`. Only a malformed memory reference traps,
//! which the engine surfaces to the outer caller as a failed plugin call.

use crate::engine::{EngineShared, StoreState};
use std::fmt;
use std::sync::Arc;
use trellis_plugin_api::{abi, Event, PluginManifest};
use wasmtime::{Caller, Extern, Linker, Memory};

/// Callback type for user-supplied host functions: input bytes in,
/// response bytes out (empty response → `0` on the wire).
pub type HostCallback = Arc<dyn Fn(&[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// A host function contributed by the embedding application, importable by
/// every plugin as `<namespace>.<name>` with wasm type `(i64) -> i64`.
#[derive(Clone)]
pub struct HostFunction {
    pub namespace: String,
    pub name: String,
    callback: HostCallback,
}

impl HostFunction {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        callback: impl Fn(&[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            callback: Arc::new(callback),
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Bind the application-supplied host functions.
pub(crate) fn add_user_functions(
    linker: &mut Linker<StoreState>,
    funcs: &[HostFunction],
) -> anyhow::Result<()> {
    for func in funcs {
        let callback = Arc::clone(&func.callback);
        let label = format!("{}.{}", func.namespace, func.name);
        linker.func_wrap(
            &func.namespace,
            &func.name,
            move |mut caller: Caller<'_, StoreState>, input: i64| -> anyhow::Result<i64> {
                let input = read_ref(&mut caller, input)?;
                match callback(&input) {
                    Ok(response) if response.is_empty() => Ok(0),
                    Ok(response) => write_bytes(&mut caller, &response),
                    Err(error) => {
                        tracing::warn!(
                            category = "host_func",
                            function = %label,
                            error = %error,
                            "User host function failed"
                        );
                        Ok(0)
                    }
                }
            },
        )?;
    }
    Ok(())
}

/// Bind the engine's built-in host functions. Registered after the user
/// table; the reserved names always resolve to the engine.
pub(crate) fn add_builtin_functions(linker: &mut Linker<StoreState>) -> anyhow::Result<()> {
    linker.allow_shadowing(true);
    linker.func_wrap(abi::NS_USER, "registerPlugin", register_plugin)?;
    linker.func_wrap(
        abi::NS_USER,
        "getExtensionsForExtensionPoint",
        get_extensions_for_extension_point,
    )?;
    linker.func_wrap(abi::NS_USER, "sendEvent", send_event)?;
    linker.func_wrap(abi::NS_ENGINE, "callExtension", call_extension)?;
    linker.func_wrap(abi::NS_ENGINE, "loadFile", load_file)?;
    Ok(())
}

/// `registerPlugin(manifest: json) -> ()`
///
/// A plugin re-describes itself at runtime, conventionally from its
/// `start` export. The manifest lands in the registry bound to the calling
/// plugin's module path; same-identity registration replaces the record.
fn register_plugin(
    mut caller: Caller<'_, StoreState>,
    manifest_ref: i64,
) -> anyhow::Result<()> {
    let bytes = read_ref(&mut caller, manifest_ref)?;
    let (shared, plugin) = caller.data().context()?;
    match serde_json::from_slice::<PluginManifest>(&bytes) {
        Ok(manifest) => shared.register_manifest(&plugin, manifest),
        Err(error) => {
            tracing::warn!(
                category = "host_func",
                plugin = %plugin,
                error = %error,
                "registerPlugin received invalid manifest JSON"
            );
        }
    }
    Ok(())
}

/// `getExtensionsForExtensionPoint(id: string, version?: string) -> json`
///
/// Returns a JSON array of the extensions resolved against the named
/// point, or `0` when there are none (or the point/version is unknown).
fn get_extensions_for_extension_point(
    mut caller: Caller<'_, StoreState>,
    point_ref: i64,
    version_ref: i64,
) -> anyhow::Result<i64> {
    let point_id = read_string(&mut caller, point_ref)?;
    let version = if version_ref == 0 {
        None
    } else {
        Some(read_string(&mut caller, version_ref)?).filter(|v| !v.is_empty())
    };
    let (shared, plugin) = caller.data().context()?;

    let filter: Vec<&str> = version.as_deref().into_iter().collect();
    let extensions = {
        let registry = crate::lock(&shared.registry);
        registry.extensions_for_extension_point(&point_id, &filter)
    };

    match extensions {
        Ok(extensions) if extensions.is_empty() => Ok(0),
        Ok(extensions) => {
            let json = serde_json::to_vec(&extensions)?;
            write_bytes(&mut caller, &json)
        }
        Err(error) => {
            tracing::warn!(
                category = "host_func",
                plugin = %plugin,
                extension_point = %point_id,
                error = %error,
                "getExtensionsForExtensionPoint failed"
            );
            Ok(0)
        }
    }
}

/// `callExtension(id: string, payload: bytes) -> bytes`
///
/// Routes a call to another plugin's extension function, instantiating the
/// owner on demand. The engine releases every lock before crossing the
/// sandbox boundary, so nested calls from inside a running plugin are
/// safe (for targets other than the calling plugin itself).
fn call_extension(
    mut caller: Caller<'_, StoreState>,
    extension_ref: i64,
    payload_ref: i64,
) -> anyhow::Result<i64> {
    let extension_id = read_string(&mut caller, extension_ref)?;
    let payload = read_ref(&mut caller, payload_ref)?;
    let (shared, plugin) = caller.data().context()?;

    match EngineShared::call_extension(&shared, &extension_id, &payload) {
        Ok(response) if response.is_empty() => Ok(0),
        Ok(response) => write_bytes(&mut caller, &response),
        Err(error) => {
            tracing::warn!(
                category = "host_func",
                plugin = %plugin,
                extension = %extension_id,
                error = %error,
                "callExtension failed"
            );
            Ok(0)
        }
    }
}

/// `loadFile(path: string) -> bytes`
///
/// Reads a file from the host filesystem into the calling plugin's memory.
/// The path is not confined; embedders who care should front this with a
/// capability check. Returns `0` on any read failure.
fn load_file(mut caller: Caller<'_, StoreState>, path_ref: i64) -> anyhow::Result<i64> {
    let path = read_string(&mut caller, path_ref)?;
    let (_, plugin) = caller.data().context()?;

    match std::fs::read(&path) {
        Ok(contents) if contents.is_empty() => Ok(0),
        Ok(contents) => write_bytes(&mut caller, &contents),
        Err(error) => {
            tracing::warn!(
                category = "host_func",
                plugin = %plugin,
                path = %path,
                error = %error,
                "loadFile failed"
            );
            Ok(0)
        }
    }
}

/// `sendEvent(id: string, data: bytes) -> ()`
///
/// Synchronous fan-out to every listener registered for the event id, in
/// registration order. Listener failures are logged and do not stop the
/// fan-out.
fn send_event(
    mut caller: Caller<'_, StoreState>,
    event_ref: i64,
    data_ref: i64,
) -> anyhow::Result<()> {
    let event_id = read_string(&mut caller, event_ref)?;
    let data = read_ref(&mut caller, data_ref)?;
    let (shared, plugin) = caller.data().context()?;

    let event = Event::new(event_id, data).source(plugin.id.clone());
    crate::events::dispatch(&shared, &event);
    Ok(())
}

fn caller_memory(caller: &mut Caller<'_, StoreState>) -> anyhow::Result<Memory> {
    caller
        .get_export(abi::EXPORT_MEMORY)
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow::anyhow!("plugin does not export linear memory"))
}

/// Copy the bytes behind a packed memory reference out of guest memory.
fn read_ref(caller: &mut Caller<'_, StoreState>, packed: i64) -> anyhow::Result<Vec<u8>> {
    if packed == 0 {
        return Ok(Vec::new());
    }
    let (ptr, len) = abi::unpack_ptr_len(packed);
    if ptr < 0 || len < 0 {
        anyhow::bail!("negative memory reference: ptr={ptr}, len={len}");
    }
    if len == 0 {
        return Ok(Vec::new());
    }
    let memory = caller_memory(caller)?;
    let data = memory.data(&caller);
    let (ptr, len) = (ptr as usize, len as usize);
    let end = ptr
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "memory reference out of bounds: ptr={ptr}, len={len}, memory_size={}",
                data.len()
            )
        })?;
    Ok(data[ptr..end].to_vec())
}

fn read_string(caller: &mut Caller<'_, StoreState>, packed: i64) -> anyhow::Result<String> {
    let bytes = read_ref(caller, packed)?;
    String::from_utf8(bytes).map_err(|e| anyhow::anyhow!("invalid UTF-8 in memory reference: {e}"))
}

/// Allocate in the calling plugin via its own `plugin_alloc` export and
/// write `bytes` there; returns the packed reference.
fn write_bytes(caller: &mut Caller<'_, StoreState>, bytes: &[u8]) -> anyhow::Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    let memory = caller_memory(caller)?;
    let alloc = caller
        .get_export(abi::EXPORT_ALLOC)
        .and_then(Extern::into_func)
        .ok_or_else(|| anyhow::anyhow!("plugin does not export {}", abi::EXPORT_ALLOC))?
        .typed::<i32, i32>(&*caller)?;

    let len = i32::try_from(bytes.len())
        .map_err(|_| anyhow::anyhow!("response too large: {} bytes", bytes.len()))?;
    let ptr = alloc.call(&mut *caller, len)?;
    memory.write(&mut *caller, ptr as usize, bytes)?;
    Ok(abi::pack_ptr_len(ptr, len))
}
