use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::tempdir;

fn ferrule() -> Command {
    Command::cargo_bin("ferrule").expect("binary exists")
}

#[test]
fn ferrule_run_hello() {
    let mut cmd = ferrule();
    cmd.arg("run").arg("demos/hello.fer");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Hello, Ferrule!"))
        .stdout(predicate::str::contains("7"));
}

#[test]
fn ferrule_run_binds_options() {
    let mut cmd = ferrule();
    cmd.arg("run").arg("demos/hello.fer").arg("name=world");
    cmd.assert().success().stdout(predicate::str::contains("Hello, world!"));
}

#[test]
fn ferrule_run_rejects_unknown_option() {
    let mut cmd = ferrule();
    cmd.arg("run").arg("demos/hello.fer").arg("colour=blue");
    cmd.assert().failure().stderr(predicate::str::contains("colour"));
}

#[test]
fn ferrule_run_coroutines() {
    let mut cmd = ferrule();
    cmd.arg("run").arg("demos/workers.fer");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("slow"))
        .stdout(predicate::str::contains("fast"));
}

#[test]
fn ferrule_runtime_error_exits_nonzero() {
    let mut cmd = ferrule();
    cmd.arg("run").arg("demos/fault.fer");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("division by zero"))
        .stderr(predicate::str::contains("at Divide"));
}

#[test]
fn ferrule_check_and_disasm() {
    let mut cmd = ferrule();
    cmd.arg("check").arg("demos/hello.fer");
    cmd.assert().success().stdout(predicate::str::contains("ok"));

    let mut cmd = ferrule();
    cmd.arg("disasm").arg("demos/hello.fer");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("-- Start --"))
        .stdout(predicate::str::contains("CallHost"));
}

#[test]
fn ferrule_check_reports_type_errors() {
    let dir = tempdir().expect("create temp dir");
    let script = dir.path().join("broken.fer");
    fs::write(&script, "int Start() {\n  return \"nope\";\n}\n").expect("write script");

    let mut cmd = ferrule();
    cmd.arg("check").arg(&script);
    cmd.assert().failure().stderr(predicate::str::contains("broken.fer:2"));
}

#[test]
fn ferrule_custom_start_and_persist_path() {
    let dir = tempdir().expect("create temp dir");
    let script = dir.path().join("tally.fer");
    let state = dir.path().join("state.bin");
    fs::write(&script, "persist int n;\nint Main() { n += 1; return n; }\n").expect("write script");

    for expected in ["1", "2"] {
        let mut cmd = ferrule();
        cmd.arg("run").arg(&script).arg("--start").arg("Main").arg("--persist").arg(&state);
        cmd.assert().success().stdout(predicate::str::contains(expected));
    }
    assert!(state.exists());
}
