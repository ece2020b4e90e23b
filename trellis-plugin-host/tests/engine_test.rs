//! End-to-end tests driving the engine through real (WAT-sourced) plugin
//! modules: bundle loading, lazy instantiation, re-entrant cross-plugin
//! calls, runtime registration, events, and failure containment.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use trellis_plugin_host::{
    Engine, EngineConfig, EngineError, Event, ExtensionDecl, ExtensionPointDecl, HostFunction,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Common module shell: exported memory, bump allocator, a `start` body
/// and extension functions. The heap starts at 4096; data segments live
/// below it.
fn module_wat(imports: &str, data: &str, start_body: &str, funcs: &str) -> String {
    format!(
        r#"(module
  {imports}
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 4096))
  {data}
  (func $alloc (export "plugin_alloc") (param $len i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $ptr))
  (func (export "plugin_dealloc") (param i32 i32) nop)
  (func (export "start") {start_body})
  {funcs}
)"#
    )
}

/// Packed (ptr, len) reference to a static data segment as a WAT constant.
fn static_ref(ptr: u32, len: usize) -> i64 {
    ((ptr as i64) << 32) | len as i64
}

/// Function body snippet packing the (ptr, len) params into an i64.
const PACK_PARAMS: &str = r#"(i64.or
      (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
      (i64.extend_i32_u (local.get $len)))"#;

/// `echo`: returns its payload unchanged.
fn echo_func() -> String {
    format!(
        r#"(func (export "echo") (param $ptr i32) (param $len i32) (result i64)
    {PACK_PARAMS})"#
    )
}

/// `shout`: ignores the payload, answers a static string.
fn shout_func() -> String {
    let msg = "from-b";
    format!(
        r#"(func (export "shout") (param i32 i32) (result i64)
    (local $out i32)
    (local.set $out (call $alloc (i32.const {len})))
    (memory.copy (local.get $out) (i32.const 0) (i32.const {len}))
    (i64.or (i64.shl (i64.extend_i32_u (local.get $out)) (i64.const 32)) (i64.const {len})))"#,
        len = msg.len()
    )
}

/// Write a loose plugin: `<name>.yaml` next to `<name>.wasm` (the module
/// file holds WAT text; the runtime detects and compiles it).
fn write_plugin(dir: &Path, name: &str, wat: &str, manifest_yaml: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(format!("{name}.yaml")), manifest_yaml).unwrap();
    fs::write(dir.join(format!("{name}.wasm")), wat).unwrap();
}

fn new_engine(temp: &TempDir, host_funcs: Vec<HostFunction>) -> Engine {
    init_tracing();
    Engine::new(EngineConfig::new(temp.path().join("work")), host_funcs).unwrap()
}

/// Host function that records every payload it receives.
fn recorder() -> (HostFunction, Arc<Mutex<Vec<Vec<u8>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let func = HostFunction::new("host/app", "note", move |input: &[u8]| {
        sink.lock().unwrap().push(input.to_vec());
        Ok(Vec::new())
    });
    (func, seen)
}

fn provider_plugin(dir: &Path) {
    let wat = module_wat(
        "",
        r#"(data (i32.const 0) "from-b")"#,
        "nop",
        &format!("{}\n  {}", echo_func(), shout_func()),
    );
    write_plugin(
        dir,
        "b",
        &wat,
        r#"
id: b
name: Provider
version: 1.0.0
extensions:
  - id: b.echo
    extensionPoint: svc.text
    funcName: echo
  - id: b.shout
    extensionPoint: svc.text
    funcName: shout
"#,
    );
}

#[test]
fn lazy_call_instantiates_owner_and_passes_payload() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");
    provider_plugin(&plugins);

    let engine = new_engine(&temp, Vec::new());
    engine.register_host_extension_point("svc.text", "Text services", "1.0.0", "");
    engine.load(&plugins).unwrap();

    let before = engine.plugins();
    assert_eq!(before.len(), 1);
    assert!(!before[0].instantiated);
    assert!(before[0].resolved);

    let response = engine.call_extension("b.echo", &[0x01, 0x02]).unwrap();
    assert_eq!(response, vec![0x01, 0x02]);

    let after = engine.plugins();
    assert!(after[0].instantiated);

    // Static response path.
    let response = engine.call_extension("b.shout", b"ignored").unwrap();
    assert_eq!(response, b"from-b");
}

#[test]
fn reentrant_call_reaches_uninstantiated_plugin() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");
    provider_plugin(&plugins);

    // `relay` forwards its payload to b.echo through the callExtension
    // host function and returns whatever comes back.
    let relay = module_wat(
        r#"(import "host/pluginengine" "callExtension" (func $call_extension (param i64 i64) (result i64)))"#,
        r#"(data (i32.const 0) "b.echo")"#,
        "nop",
        &format!(
            r#"(func (export "relay") (param $ptr i32) (param $len i32) (result i64)
    (call $call_extension
      (i64.const {id_ref})
      {PACK_PARAMS}))"#,
            id_ref = static_ref(0, "b.echo".len()),
        ),
    );
    write_plugin(
        &plugins,
        "a",
        &relay,
        r#"
id: a
version: 1.0.0
extensions:
  - id: a.relay
    extensionPoint: svc.relay
    funcName: relay
"#,
    );

    let engine = new_engine(&temp, Vec::new());
    engine.register_host_extension_point("svc.text", "Text services", "1.0.0", "");
    engine.register_host_extension_point("svc.relay", "Relay", "1.0.0", "");
    engine.load(&plugins).unwrap();

    // Neither plugin is live; the nested callExtension must instantiate b
    // while a is mid-call.
    assert!(engine.plugins().iter().all(|p| !p.instantiated));

    let response = engine.call_extension("a.relay", b"ping-pong").unwrap();
    assert_eq!(response, b"ping-pong");

    assert!(engine.plugins().iter().all(|p| p.instantiated));
}

#[test]
fn start_instantiates_only_load_on_start_plugins() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");
    provider_plugin(&plugins);

    let starter = module_wat(
        r#"(import "host/app" "note" (func $note (param i64) (result i64)))"#,
        r#"(data (i32.const 0) "boot")"#,
        &format!("(drop (call $note (i64.const {})))", static_ref(0, 4)),
        "",
    );
    write_plugin(
        &plugins,
        "s",
        &starter,
        r#"
id: s
version: 1.0.0
loadOnStart: true
"#,
    );

    let (note, seen) = recorder();
    let engine = new_engine(&temp, vec![note]);
    engine.register_host_extension_point("svc.text", "Text services", "1.0.0", "");
    engine.load(&plugins).unwrap();

    assert!(engine.plugins().iter().all(|p| !p.instantiated));

    engine.start().unwrap();

    for plugin in engine.plugins() {
        match plugin.key.id.as_str() {
            "s" => assert!(plugin.instantiated),
            "b" => assert!(!plugin.instantiated),
            other => panic!("unexpected plugin {other}"),
        }
    }
    assert_eq!(seen.lock().unwrap().as_slice(), &[b"boot".to_vec()]);

    // A second start pass does not re-run `start` exports.
    engine.start().unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn start_export_registers_runtime_manifest() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");

    let manifest_json = r#"{"id":"runtime","version":"2.0.0","extensions":[{"id":"runtime.echo","extensionPoint":"ep.rt","funcName":"echo"}]}"#;
    let escaped = manifest_json.replace('"', "\\\"");
    let registrar = module_wat(
        r#"(import "host/user" "registerPlugin" (func $register (param i64)))"#,
        &format!(r#"(data (i32.const 0) "{escaped}")"#),
        &format!(
            "(call $register (i64.const {}))",
            static_ref(0, manifest_json.len())
        ),
        &echo_func(),
    );
    write_plugin(
        &plugins,
        "r",
        &registrar,
        r#"
id: r
version: 1.0.0
loadOnStart: true
"#,
    );

    let engine = new_engine(&temp, Vec::new());
    engine.register_host_extension_point("ep.rt", "Runtime services", "1.0.0", "");
    engine.load(&plugins).unwrap();
    engine.start().unwrap();

    let ids: Vec<String> = engine.plugins().iter().map(|p| p.key.id.clone()).collect();
    assert!(ids.contains(&"r".to_string()));
    assert!(ids.contains(&"runtime".to_string()));

    // The runtime-registered extension is callable; its owner (sharing
    // r's module) instantiates lazily.
    let response = engine.call_extension("runtime.echo", b"ping").unwrap();
    assert_eq!(response, b"ping");
}

#[test]
fn guest_can_query_extensions_for_extension_point() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");

    let provider = module_wat("", "", "nop", &echo_func());
    write_plugin(
        &plugins,
        "menus",
        &provider,
        r#"
id: menus
version: 1.0.0
extensions:
  - id: e1
    extensionPoint: menu.top
    name: About entry
    funcName: echo
"#,
    );

    let prober = module_wat(
        r#"(import "host/user" "getExtensionsForExtensionPoint" (func $get_exts (param i64 i64) (result i64)))"#,
        r#"(data (i32.const 0) "menu.top")"#,
        "nop",
        &format!(
            r#"(func (export "probe") (param i32 i32) (result i64)
    (call $get_exts (i64.const {ep_ref}) (i64.const 0)))"#,
            ep_ref = static_ref(0, "menu.top".len()),
        ),
    );
    write_plugin(
        &plugins,
        "g",
        &prober,
        r#"
id: g
version: 1.0.0
extensions:
  - id: g.probe
    extensionPoint: svc.probe
    funcName: probe
"#,
    );

    let engine = new_engine(&temp, Vec::new());
    engine.register_host_extension_point("menu.top", "Top menu", "1.0.0", "");
    engine.register_host_extension_point("svc.probe", "Probing", "1.0.0", "");
    engine.load(&plugins).unwrap();

    let response = engine.call_extension("g.probe", &[]).unwrap();
    let listed: Vec<ExtensionDecl> = serde_json::from_slice(&response).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "e1");
    assert_eq!(listed[0].func_name, "echo");

    // The same projection is available host-side.
    let host_side = engine
        .extensions_for_extension_point("menu.top", &[])
        .unwrap();
    assert_eq!(host_side, listed);
}

#[test]
fn load_file_host_function_reads_host_files() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");

    let reader = module_wat(
        r#"(import "host/pluginengine" "loadFile" (func $load_file (param i64) (result i64)))"#,
        "",
        "nop",
        &format!(
            r#"(func (export "slurp") (param $ptr i32) (param $len i32) (result i64)
    (call $load_file {PACK_PARAMS}))"#
        ),
    );
    write_plugin(
        &plugins,
        "f",
        &reader,
        r#"
id: f
version: 1.0.0
extensions:
  - id: f.slurp
    extensionPoint: svc.files
    funcName: slurp
"#,
    );

    let secret = temp.path().join("config.txt");
    fs::write(&secret, b"secret-bytes").unwrap();

    let engine = new_engine(&temp, Vec::new());
    engine.register_host_extension_point("svc.files", "Files", "1.0.0", "");
    engine.load(&plugins).unwrap();

    let path_bytes = secret.to_string_lossy().into_owned().into_bytes();
    let response = engine.call_extension("f.slurp", &path_bytes).unwrap();
    assert_eq!(response, b"secret-bytes");

    // Unreadable path: soft failure, empty response.
    let response = engine
        .call_extension("f.slurp", b"/definitely/not/a/file")
        .unwrap();
    assert!(response.is_empty());
}

#[test]
fn events_fan_out_to_listeners() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");

    let listener = module_wat(
        r#"(import "host/app" "note" (func $note (param i64) (result i64)))"#,
        "",
        "nop",
        &format!(
            r#"(func (export "on_tick") (param $ptr i32) (param $len i32) (result i64)
    (drop (call $note {PACK_PARAMS}))
    (i64.const 0))"#
        ),
    );
    write_plugin(
        &plugins,
        "l",
        &listener,
        r#"
id: l
version: 1.0.0
listeners:
  - event: tick
    func: on_tick
"#,
    );

    let emitter = module_wat(
        r#"(import "host/user" "sendEvent" (func $send_event (param i64 i64)))"#,
        r#"(data (i32.const 0) "tick")"#,
        "nop",
        &format!(
            r#"(func (export "emit") (param $ptr i32) (param $len i32) (result i64)
    (call $send_event (i64.const {event_ref}) {PACK_PARAMS})
    (i64.const 0))"#,
            event_ref = static_ref(0, 4),
        ),
    );
    write_plugin(
        &plugins,
        "e",
        &emitter,
        r#"
id: e
version: 1.0.0
extensions:
  - id: e.emit
    extensionPoint: svc.emit
    funcName: emit
"#,
    );

    let (note, seen) = recorder();
    let engine = new_engine(&temp, vec![note]);
    engine.register_host_extension_point("svc.emit", "Emitters", "1.0.0", "");
    engine.load(&plugins).unwrap();

    // Plugin-originated event: the listener plugin instantiates lazily.
    engine.call_extension("e.emit", b"evt-data").unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), &[b"evt-data".to_vec()]);

    // Host-originated event through the same bus.
    let delivered = engine.send_event(&Event::new("tick", b"host-data".to_vec()));
    assert_eq!(delivered, 1);
    assert_eq!(seen.lock().unwrap().len(), 2);

    // Unknown event id reaches nobody.
    assert_eq!(engine.send_event(&Event::new("tock", Vec::new())), 0);
}

#[test]
fn trapping_plugin_call_is_contained() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");
    provider_plugin(&plugins);

    let trapper = module_wat(
        "",
        "",
        "nop",
        r#"(func (export "boom") (param i32 i32) (result i64)
    unreachable)"#,
    );
    write_plugin(
        &plugins,
        "t",
        &trapper,
        r#"
id: t
version: 1.0.0
extensions:
  - id: t.boom
    extensionPoint: svc.text
    funcName: boom
"#,
    );

    let engine = new_engine(&temp, Vec::new());
    engine.register_host_extension_point("svc.text", "Text services", "1.0.0", "");
    engine.load(&plugins).unwrap();

    match engine.call_extension("t.boom", &[]) {
        Err(EngineError::PluginCallFailed { extension, .. }) => assert_eq!(extension, "t.boom"),
        other => panic!("expected PluginCallFailed, got {other:?}"),
    }

    // The engine keeps serving other plugins.
    let response = engine.call_extension("b.echo", b"still-alive").unwrap();
    assert_eq!(response, b"still-alive");
}

#[test]
fn bad_semver_manifest_is_rejected_and_siblings_survive() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");
    provider_plugin(&plugins);

    let broken = module_wat("", "", "nop", &echo_func());
    write_plugin(
        &plugins,
        "broken",
        &broken,
        r#"
id: broken
version: "1.0"
"#,
    );

    let engine = new_engine(&temp, Vec::new());
    engine.register_host_extension_point("svc.text", "Text services", "1.0.0", "");
    engine.load(&plugins).unwrap();

    let ids: Vec<String> = engine.plugins().iter().map(|p| p.key.id.clone()).collect();
    assert_eq!(ids, vec!["b".to_string()]);
}

#[test]
fn unknown_and_unresolved_extensions_error_synchronously() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");

    let orphan = module_wat("", "", "nop", &echo_func());
    write_plugin(
        &plugins,
        "o",
        &orphan,
        r#"
id: o
version: 1.0.0
extensions:
  - id: o.echo
    extensionPoint: ep.nobody-registered
    funcName: echo
"#,
    );

    let engine = new_engine(&temp, Vec::new());
    engine.load(&plugins).unwrap();

    assert_eq!(engine.pending_extension_count(), 1);
    assert!(matches!(
        engine.call_extension("o.echo", &[]),
        Err(EngineError::ExtensionUnresolved(_))
    ));
    assert!(matches!(
        engine.call_extension("never-heard-of-it", &[]),
        Err(EngineError::ExtensionUnknown(_))
    ));

    // Registering the point late unblocks the call.
    engine.register_host_extension_point("ep.nobody-registered", "Late", "1.0.0", "");
    assert_eq!(engine.pending_extension_count(), 0);
    let response = engine.call_extension("o.echo", b"now").unwrap();
    assert_eq!(response, b"now");
}

#[test]
fn start_on_load_host_point_receives_resolved_extensions() {
    let temp = TempDir::new().unwrap();
    let plugins = temp.path().join("plugins");

    let provider = module_wat("", "", "nop", &echo_func());
    write_plugin(
        &plugins,
        "menus",
        &provider,
        r#"
id: menus
version: 1.0.0
extensions:
  - id: e1
    extensionPoint: menu.top
    funcName: echo
"#,
    );

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback = Arc::new(move |extensions: &[ExtensionDecl]| -> anyhow::Result<()> {
        let mut seen = sink.lock().unwrap();
        seen.extend(extensions.iter().map(|e| e.id.clone()));
        Ok(())
    });

    let engine = new_engine(&temp, Vec::new());
    let mut decl = ExtensionPointDecl::new("menu.top", "1.0.0").name("Top menu");
    decl.start_on_load = true;
    engine.register_host_extension_point_with(decl, callback);

    engine.load(&plugins).unwrap();
    engine.start().unwrap();

    assert_eq!(seen.lock().unwrap().as_slice(), &["e1".to_string()]);
}

#[test]
fn tar_gz_bundle_loads_end_to_end() {
    let temp = TempDir::new().unwrap();
    let bundles = temp.path().join("bundles");
    fs::create_dir_all(&bundles).unwrap();

    let wat = module_wat("", "", "nop", &echo_func());
    let manifest = r#"
id: bundled
version: 1.0.0
extensions:
  - id: bundled.echo
    extensionPoint: svc.text
    funcName: echo
"#;

    let archive = bundles.join("bundled.tar.gz");
    let file = File::create(&archive).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, contents) in [
        ("bundled.yaml", manifest.as_bytes()),
        ("bundled.wasm", wat.as_bytes()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();

    let engine = new_engine(&temp, Vec::new());
    engine.register_host_extension_point("svc.text", "Text services", "1.0.0", "");
    engine.load(&bundles).unwrap();

    let response = engine.call_extension("bundled.echo", b"via-tar").unwrap();
    assert_eq!(response, b"via-tar");
}

#[test]
fn zip_bundle_loads_end_to_end() {
    let temp = TempDir::new().unwrap();
    let bundles = temp.path().join("bundles");
    fs::create_dir_all(&bundles).unwrap();

    let wat = module_wat("", "", "nop", &echo_func());
    let manifest = r#"{
  "id": "zipped",
  "version": "1.0.0",
  "extensions": [
    {"id": "zipped.echo", "extensionPoint": "svc.text", "funcName": "echo"}
  ]
}"#;

    let archive = bundles.join("zipped.zip");
    let file = File::create(&archive).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    writer.start_file("zipped.json", options).unwrap();
    writer.write_all(manifest.as_bytes()).unwrap();
    writer.start_file("zipped.wasm", options).unwrap();
    writer.write_all(wat.as_bytes()).unwrap();
    writer.finish().unwrap();

    let engine = new_engine(&temp, Vec::new());
    engine.register_host_extension_point("svc.text", "Text services", "1.0.0", "");
    engine.load(&bundles).unwrap();

    let response = engine.call_extension("zipped.echo", b"via-zip").unwrap();
    assert_eq!(response, b"via-zip");
}
