//! End-to-end pipeline tests.
//!
//! A fake compiler script installs the `plgpu-loopback` fixture as the
//! "compiled" procedure, so the whole handler path (expand, compose, cache,
//! marshal, fork/exec, materialize) runs on machines without a device
//! toolchain.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pgaccel_core::arena::Arena;
use pgaccel_core::catalog::{MemCatalog, OwnerId, ProcId, ProcRecord};
use pgaccel_core::config::AccelConfig;
use pgaccel_core::types::{varlena, HostType, Value};
use pgaccel_plgpu::handler::ProcedureHandler;

const COMPUTE_CAPABILITY: i32 = 601;

struct TestEnv {
    root: PathBuf,
    handler: ProcedureHandler,
}

fn setup(tag: &str, procs: Vec<ProcRecord>) -> TestEnv {
    let root = std::env::temp_dir().join(format!("plgpu_{}_{}", tag, std::process::id()));
    fs::create_dir_all(&root).expect("test root");

    let compiler = install_fake_compiler(&root);

    let mut config = AccelConfig::default();
    config.base_dir = root.join("cache").display().to_string();
    config.compiler_path = compiler.display().to_string();
    config.include_dir = root.display().to_string();

    let catalog = MemCatalog::new();
    for proc in procs {
        catalog.insert(proc);
    }

    let handler = ProcedureHandler::new(
        Arc::new(config),
        Arc::new(catalog),
        COMPUTE_CAPABILITY,
    );
    TestEnv { root, handler }
}

/// Shell stub standing in for nvcc: copies the loopback fixture to the `-o`
/// target and appends one line to a build counter.
fn install_fake_compiler(root: &Path) -> PathBuf {
    let loopback = env!("CARGO_BIN_EXE_plgpu-loopback");
    let script = root.join("fake-nvcc");
    let counter = root.join("compile-count");
    let body = format!(
        "#!/bin/sh\n\
         set -e\n\
         target=\"\"\n\
         while [ \"$#\" -gt 1 ]; do\n\
         \x20 if [ \"$1\" = \"-o\" ]; then target=\"$2\"; fi\n\
         \x20 shift\n\
         done\n\
         cp \"{loopback}\" \"$target\"\n\
         echo build >> \"{counter}\"\n",
        loopback = loopback,
        counter = counter.display(),
    );
    fs::write(&script, body).expect("write compiler script");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
    script
}

fn ident4(id: u32) -> ProcRecord {
    ProcRecord {
        id: ProcId(id),
        name: "ident4".to_string(),
        namespace: "public".to_string(),
        owner: OwnerId(10),
        arg_types: vec![HostType::Int4],
        ret_type: HostType::Int4,
        ret_set: false,
        source: "#plgpu_begin\n  retval = arg1;\n#plgpu_end\n".to_string(),
    }
}

fn echo_bytea(id: u32) -> ProcRecord {
    ProcRecord {
        id: ProcId(id),
        name: "echo".to_string(),
        namespace: "public".to_string(),
        owner: OwnerId(10),
        arg_types: vec![HostType::Bytea],
        ret_type: HostType::Bytea,
        ret_set: false,
        source: "#plgpu_begin\n  retval = arg1;\n#plgpu_end\n".to_string(),
    }
}

#[cfg(target_os = "linux")]
fn leftover_segments(func_id: u32) -> Vec<String> {
    let needle = format!(".plgpu_{func_id}_");
    fs::read_dir("/dev/shm")
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.contains(&needle))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn identity_scalar_roundtrip() {
    let env = setup("ident", vec![ident4(3001)]);
    let results = Arena::new("results");

    let value = env
        .handler
        .call_scalar(ProcId(3001), &[Value::Int4(17)], &results)
        .expect("call");
    assert_eq!(value, Value::Int4(17));

    // SQL NULL argument travels as the __null__ token; the child exits 1
    let value = env
        .handler
        .call_scalar(ProcId(3001), &[Value::Null], &results)
        .expect("null call");
    assert_eq!(value, Value::Null);

    #[cfg(target_os = "linux")]
    assert!(leftover_segments(3001).is_empty(), "segments leaked");

    let _ = fs::remove_dir_all(&env.root);
}

#[test]
fn variable_length_echo() {
    let env = setup("echo", vec![echo_bytea(3002)]);
    let results = Arena::new("results");

    let payload: Vec<u8> = (0..40 * 1024).map(|i| (i % 251) as u8).collect();
    let carrier = varlena::make(&payload);
    let arg = Value::Varlena(Arc::from(carrier.as_slice()));

    let value = env
        .handler
        .call_scalar(ProcId(3002), &[arg], &results)
        .expect("call");
    match value {
        Value::Varlena(bytes) => {
            assert_eq!(&bytes[..], carrier.as_slice(), "round-trip must be byte-exact");
            assert_eq!(varlena::payload(&bytes).expect("payload"), payload.as_slice());
        }
        other => panic!("unexpected result {other:?}"),
    }

    #[cfg(target_os = "linux")]
    assert!(leftover_segments(3002).is_empty(), "segments leaked");

    let _ = fs::remove_dir_all(&env.root);
}

#[test]
fn compile_cache_returns_existing_binary() {
    let env = setup("cache", vec![ident4(3003)]);
    let results = Arena::new("results");

    // validation primes the cache (no inclusions, so it compiles eagerly)
    let report = env.handler.validate(ProcId(3003)).expect("validate");
    assert!(!report.deferred);

    let counter = env.root.join("compile-count");
    let builds = || {
        fs::read_to_string(&counter)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    };
    assert_eq!(builds(), 1);

    env.handler
        .call_scalar(ProcId(3003), &[Value::Int4(1)], &results)
        .expect("first call");

    // locate the cached binary and record its mtime
    let cache_dir = env.root.join("cache").join("pgsql_tmp");
    let binary = fs::read_dir(&cache_dir)
        .expect("cache dir")
        .flatten()
        .map(|e| e.path())
        .find(|p| p.extension().is_none())
        .expect("cached binary");
    let mtime = fs::metadata(&binary).expect("metadata").modified().expect("mtime");

    // second invocation with different arguments: same digest, no rebuild
    env.handler
        .call_scalar(ProcId(3003), &[Value::Int4(2)], &results)
        .expect("second call");

    assert_eq!(builds(), 1, "the compiler must not run again");
    let mtime_after = fs::metadata(&binary).expect("metadata").modified().expect("mtime");
    assert_eq!(mtime, mtime_after, "binary was rewritten");

    let _ = fs::remove_dir_all(&env.root);
}

#[test]
fn inclusion_cycle_warns_at_validation_and_fails_at_call() {
    use pgaccel_plgpu::source::SourceErrorKind;
    use pgaccel_plgpu::PlGpuError;

    let text_helper = |id: u32, name: &str| ProcRecord {
        id: ProcId(id),
        name: name.to_string(),
        namespace: "public".to_string(),
        owner: OwnerId(10),
        arg_types: vec![HostType::Int4],
        ret_type: HostType::Text,
        ret_set: false,
        source: String::new(),
    };

    let root = std::env::temp_dir().join(format!("plgpu_cycle_{}", std::process::id()));
    fs::create_dir_all(&root).expect("test root");
    let compiler = install_fake_compiler(&root);

    let mut config = AccelConfig::default();
    config.base_dir = root.join("cache").display().to_string();
    config.compiler_path = compiler.display().to_string();

    let catalog = MemCatalog::new();
    catalog.insert(ProcRecord {
        id: ProcId(3006),
        name: "cyclic".to_string(),
        namespace: "public".to_string(),
        owner: OwnerId(10),
        arg_types: vec![HostType::Int4],
        ret_type: HostType::Int4,
        ret_set: false,
        source: "#plgpu_begin\n#plgpu_include helper_a\n  retval = arg1;\n#plgpu_end\n"
            .to_string(),
    });
    catalog.insert_helper(text_helper(3007, "helper_a"), |_| {
        Some("#plgpu_include helper_b".to_string())
    });
    catalog.insert_helper(text_helper(3008, "helper_b"), |_| {
        Some("#plgpu_include helper_a".to_string())
    });

    let handler = ProcedureHandler::new(
        Arc::new(config),
        Arc::new(catalog),
        COMPUTE_CAPABILITY,
    );

    // creation succeeds; the cycle only surfaces as a warning
    let report = handler.validate(ProcId(3006)).expect("validate");
    assert!(report.deferred);
    let warnings = report.warnings.expect("cycle must be reported");
    assert!(warnings.contains("leads infinite inclusion"));

    // execution fails with the same kind
    let results = Arena::new("results");
    match handler.call_scalar(ProcId(3006), &[Value::Int4(1)], &results) {
        Err(PlGpuError::Source(diags)) => {
            assert!(diags.contains(SourceErrorKind::InfiniteInclusion))
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn validation_defers_when_inclusions_exist() {
    let catalog_proc = ProcRecord {
        id: ProcId(3004),
        name: "with_include".to_string(),
        namespace: "public".to_string(),
        owner: OwnerId(10),
        arg_types: vec![HostType::Int4],
        ret_type: HostType::Int4,
        ret_set: false,
        source: "#plgpu_begin\n#plgpu_include snippet\n  retval = arg1;\n#plgpu_end\n"
            .to_string(),
    };
    let helper = ProcRecord {
        id: ProcId(3005),
        name: "snippet".to_string(),
        namespace: "public".to_string(),
        owner: OwnerId(10),
        arg_types: vec![HostType::Int4],
        ret_type: HostType::Text,
        ret_set: false,
        source: String::new(),
    };

    let root = std::env::temp_dir().join(format!("plgpu_defer_{}", std::process::id()));
    fs::create_dir_all(&root).expect("test root");
    let compiler = install_fake_compiler(&root);

    let mut config = AccelConfig::default();
    config.base_dir = root.join("cache").display().to_string();
    config.compiler_path = compiler.display().to_string();

    let catalog = MemCatalog::new();
    catalog.insert(catalog_proc);
    catalog.insert_helper(helper, |_| Some("int included = 1;".to_string()));

    let handler = ProcedureHandler::new(
        Arc::new(config),
        Arc::new(catalog),
        COMPUTE_CAPABILITY,
    );

    let report = handler.validate(ProcId(3004)).expect("validate");
    assert!(report.deferred, "inclusions defer compilation to run time");
    assert_eq!(
        fs::read_to_string(root.join("compile-count"))
            .map(|s| s.lines().count())
            .unwrap_or(0),
        0
    );

    let _ = fs::remove_dir_all(&root);
}
