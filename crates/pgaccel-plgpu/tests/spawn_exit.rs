//! Exit-status classification of supervised children.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use pgaccel_plgpu::spawn::{exec_procedure, ChildStatus};
use pgaccel_plgpu::PlGpuError;

fn script(dir: &PathBuf, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

#[test]
fn exit_status_classification() {
    let dir = std::env::temp_dir().join(format!("plgpu_exit_{}", std::process::id()));
    fs::create_dir_all(&dir).expect("test dir");
    let tokens = vec!["v:2a".to_string()];

    // exit 0: a result is present
    let ok = script(&dir, "ok", "exit 0");
    assert_eq!(
        exec_procedure(&ok, None, None, &tokens).expect("run"),
        ChildStatus::Value
    );

    // exit 1: the null value
    let null = script(&dir, "null", "exit 1");
    assert_eq!(
        exec_procedure(&null, None, None, &tokens).expect("run"),
        ChildStatus::Null
    );

    // any other exit code is an abnormal termination
    let abnormal = script(&dir, "abnormal", "exit 3");
    match exec_procedure(&abnormal, None, None, &tokens) {
        Err(PlGpuError::ScriptAbnormalExit(3)) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }

    // a signalled child is classified by signal number
    let signalled = script(&dir, "signalled", "kill -KILL $$");
    match exec_procedure(&signalled, None, None, &tokens) {
        Err(PlGpuError::ScriptSignalled(signum)) => assert_eq!(signum, libc::SIGKILL),
        other => panic!("unexpected outcome: {other:?}"),
    }

    // a missing binary fails inside the child with the exec error status
    let missing = dir.join("does-not-exist");
    match exec_procedure(&missing, None, None, &tokens) {
        Err(PlGpuError::ScriptAbnormalExit(2)) => {}
        other => panic!("unexpected outcome: {other:?}"),
    }

    let _ = fs::remove_dir_all(&dir);
}
