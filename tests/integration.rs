//! End-to-end tests against the mock adapter
//!
//! These tests exercise the complete workflow:
//! 1. Spawning the adapter and waiting for its handshake line
//! 2. Connecting and running the launch sequence
//! 3. Following stops, inspecting variable trees and waiting for exit

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde_json::json;

use dap_harness::common::config::{AdapterConfig, Config, DEFAULT_HANDSHAKE};
use dap_harness::dap::{SessionOptions, StartOptions};
use dap_harness::harness::Harness;
use dap_harness::inspect::{Expected, VariableTree};
use dap_harness::launch::{BreakpointLocation, Expander, LaunchDocument};
use dap_harness::supervisor::AdapterProcess;
use dap_harness::{DapSession, Error};

fn mock_adapter() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mock_adapter"))
}

fn spawn_mock(extra: &[&str]) -> AdapterProcess {
    let mut args = vec!["--port".to_string(), "0".to_string()];
    args.extend(extra.iter().map(|a| a.to_string()));
    AdapterProcess::spawn(&mock_adapter(), &args, &HashMap::new()).expect("spawn mock adapter")
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.adapter = AdapterConfig {
        path: mock_adapter(),
        args: vec!["--port".to_string(), "0".to_string()],
        env: HashMap::new(),
        handshake: DEFAULT_HANDSHAKE.to_string(),
    };
    config.timeouts.handshake_ms = 5_000;
    config.timeouts.request_ms = 5_000;
    config
}

fn launch_document(arguments: serde_json::Value) -> LaunchDocument {
    serde_json::from_value(arguments).expect("valid launch document")
}

fn handshake_pattern() -> regex::Regex {
    AdapterConfig::default().handshake_regex().unwrap()
}

/// Spawn the mock and connect a bare session to it
async fn connect_session(process: &AdapterProcess) -> DapSession {
    let handshake = process
        .await_handshake(&handshake_pattern(), Duration::from_secs(5))
        .await
        .expect("handshake");
    DapSession::connect(
        process,
        handshake.port().unwrap(),
        Duration::from_secs(2),
        SessionOptions {
            request_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        },
    )
    .await
    .expect("connect")
}

#[tokio::test]
async fn test_launch_stop_inspect_exit() {
    let config = test_config();
    let launch = launch_document(json!({
        "program": "/mock/app",
        "exitCode": 7,
        "breakpoints": ["/mock/src/main.rs:10", "/mock/src/main.rs:14"]
    }))
    .resolve(&Expander::with_env(HashMap::new()))
    .unwrap();

    let process = spawn_mock(&[]);
    let mut harness = Harness::start(&config, process, &launch).await.unwrap();
    assert!(harness.capabilities().supports_set_variable);

    // The initial stop is filtered, so the first stop is the breakpoint
    let stop = harness.await_stop(Duration::from_secs(5)).await.unwrap();
    assert_eq!(stop.reason, "breakpoint");
    assert_eq!(stop.frame.as_ref().map(|f| f.line), Some(10));

    let locals = harness.locals(0).await.unwrap();
    let expected = Expected::from_json(&json!({
        "a": 1,
        "ratio": 2.5,
        "name": "\"hello\"",
        "s": { "$": "{x:1, inner:{...}}", "x": 1, "inner": { "deep": true } },
        "v": [10, 20, 30]
    }))
    .unwrap();
    harness.variables().compare_tree(locals, &expected).await.unwrap();

    let wrong = Expected::from_json(&json!({ "a": 1, "name": "x", "s": { "x": 5 } })).unwrap();
    match harness.variables().compare_tree(locals, &wrong).await {
        Err(Error::Mismatch(report)) => {
            let mut paths = report.paths();
            paths.sort();
            assert_eq!(paths, vec!["name", "s.x"]);
        }
        other => panic!("expected mismatch, got {other:?}"),
    }

    let sum = harness.evaluate("a + 41", 0).await.unwrap();
    assert_eq!(sum["result"], "42");

    // Second stop; references from the first are stale
    harness.resume().await.unwrap();
    let stop = harness.await_stop(Duration::from_secs(5)).await.unwrap();
    assert_eq!(stop.frame.as_ref().map(|f| f.line), Some(14));

    assert!(matches!(
        harness.variables().list_children(locals).await,
        Err(Error::InvalidReference { .. })
    ));
    let locals = harness.locals(0).await.unwrap();
    let expected = Expected::from_json(&json!({ "a": 2, "s": { "x": 2 } })).unwrap();
    harness.variables().compare_tree(locals, &expected).await.unwrap();

    harness.resume().await.unwrap();
    assert_eq!(harness.await_exit(Duration::from_secs(5)).await.unwrap(), 7);

    let exit = harness.shutdown().await;
    assert!(exit.code.is_some() || exit.signal.is_some());
}

#[tokio::test]
async fn test_adapter_crash_before_handshake() {
    let process = spawn_mock(&["--crash"]);

    let err = process
        .await_handshake(&handshake_pattern(), Duration::from_secs(5))
        .await
        .unwrap_err();

    match err {
        Error::PrematureExit { exit, output } => {
            assert_eq!(exit.code, Some(3));
            assert!(output.contains("failed to load liblldb"), "output: {output}");
        }
        other => panic!("expected PrematureExit, got {other:?}"),
    }
}

#[tokio::test]
async fn test_silent_adapter_times_out_and_is_killed() {
    let process = spawn_mock(&["--silent"]);

    let err = process
        .await_handshake(&handshake_pattern(), Duration::from_millis(300))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::HandshakeTimeout(300)));
    assert!(!process.is_alive());
}

#[tokio::test]
async fn test_missing_initialized_event() {
    let mut config = test_config();
    config.adapter.args.push("--no-initialized".to_string());
    config.timeouts.initialize_ms = 300;

    let launch = launch_document(json!({ "program": "/mock/app" }))
        .resolve(&Expander::with_env(HashMap::new()))
        .unwrap();
    let process = AdapterProcess::from_config(&config.adapter, &Expander::new()).unwrap();

    let err = Harness::start(&config, process, &launch).await.err().unwrap();
    assert!(matches!(err, Error::Handshake(_)), "got {err:?}");
}

#[tokio::test]
async fn test_launch_failure_is_reported() {
    let config = test_config();
    let launch = launch_document(json!({ "cwd": "/tmp" }))
        .resolve(&Expander::with_env(HashMap::new()))
        .unwrap();
    let process = spawn_mock(&[]);

    let err = Harness::start(&config, process, &launch).await.err().unwrap();
    assert!(
        matches!(err, Error::DapRequestFailed { ref command, ref message } if command == "launch" && message == "No program specified"),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_adapter_death_fails_requests() {
    let process = spawn_mock(&[]);
    let session = connect_session(&process).await;

    let stopped = session.wait_for_event("stopped", |_| true);
    session
        .launch(json!({ "program": "/mock/app" }), &StartOptions::default())
        .await
        .unwrap();
    stopped.timeout(Duration::from_secs(5)).await.unwrap();

    let waiting = session.wait_for_event("stopped", |_| true);
    process.terminate().await;

    assert!(matches!(
        session.threads().await,
        Err(Error::SessionTerminated(_))
    ));
    assert!(matches!(waiting.await, Err(Error::SessionTerminated(_))));
}

#[tokio::test]
async fn test_session_commands() {
    let process = spawn_mock(&[]);
    let session = connect_session(&process).await;

    let stopped = session.wait_for_event("stopped", |body| body["reason"] == "breakpoint");
    let options = StartOptions {
        breakpoints: vec![BreakpointLocation::parse("main").unwrap()],
        ..Default::default()
    };
    session
        .launch(json!({ "program": "/mock/app" }), &options)
        .await
        .unwrap();
    let body = stopped.timeout(Duration::from_secs(5)).await.unwrap();
    let thread_id = body["threadId"].as_i64().unwrap();

    let threads = session.threads().await.unwrap();
    assert_eq!(threads[0].id, thread_id);

    let tree = VariableTree::new(&session);
    let locals = tree.frame_locals(thread_id, 0).await.unwrap();

    let set = session.set_variable(locals, "a", "99").await.unwrap();
    assert_eq!(set.value, "99");
    let nodes = tree.list_children(locals).await.unwrap();
    assert_eq!(nodes[0].name, "a");
    assert_eq!(nodes[0].value, "99");

    assert!(matches!(
        session.set_variable(locals, "s", "1").await,
        Err(Error::DapRequestFailed { .. })
    ));

    let frames = session.stack_trace(thread_id, None).await.unwrap();
    let evaluated = session
        .evaluate("ratio", Some(frames[0].id), "watch")
        .await
        .unwrap();
    assert_eq!(evaluated.result, "2.5");
    assert!(matches!(
        session.evaluate("nope", Some(frames[0].id), "watch").await,
        Err(Error::DapRequestFailed { ref message, .. }) if message == "undeclared identifier 'nope'"
    ));

    assert!(session.source(1).await.unwrap().contains("fn main"));

    // Outer frame has an empty locals scope
    let outer = tree.frame_locals(thread_id, 1).await.unwrap();
    assert!(tree.list_children(outer).await.unwrap().is_empty());

    session.shutdown().await;
    assert!(session.is_terminated());
    process.terminate().await;
}

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn test_scenario_runner() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "launch.json",
        r#"{ "program": "/mock/app", "exitCode": 0, "breakpoints": ["/mock/src/main.rs:10"] }"#,
    );
    let passing = write(
        dir.path(),
        "passing.yaml",
        r#"
name: two stops
launch: launch.json
steps:
  - action: await_stop
    reason: breakpoint
    function: main
    line: 10
  - action: compare_locals
    expected:
      a: 1
      s: { "$": "{x:1, inner:{...}}", inner: { deep: true } }
      v: [10, 20, 30]
  - action: evaluate
    expression: a + 1
    result: "2"
  - action: evaluate
    expression: missing
    success: false
  - action: continue
  - action: await_stop
    line: 14
  - action: continue
  - action: expect_exit
    code: 0
"#,
    );
    let failing = write(
        dir.path(),
        "failing.yaml",
        r#"
name: wrong locals
launch:
  program: /mock/app
steps:
  - action: await_stop
  - action: compare_locals
    expected:
      a: 5
"#,
    );

    let config = test_config();

    let result = dap_harness::testing::run_scenario(&passing, &config, false)
        .await
        .unwrap();
    assert!(result.passed, "scenario failed: {:?}", result.error);
    assert_eq!(result.steps_run, 8);

    let result = dap_harness::testing::run_scenario(&failing, &config, false)
        .await
        .unwrap();
    assert!(!result.passed);
    assert_eq!(result.steps_run, 2);
    assert!(result.error.unwrap().contains("a: expected 5, got \"1\""));
}

fn write_config(dir: &Path) -> PathBuf {
    write(
        dir,
        "config.toml",
        &format!(
            "[adapter]\npath = {:?}\nargs = [\"--port\", \"0\"]\n\n[timeouts]\nrequest_ms = 5000\n",
            mock_adapter().display().to_string()
        ),
    )
}

#[test]
fn test_cli_expand() {
    let dir = tempfile::tempdir().unwrap();
    let launch = write(
        dir.path(),
        "launch.json",
        r#"{
            "dbgconfig": { "root": "${env:HARNESS_ROOT}", "bin": "${dbgconfig:root}/bin" },
            "program": "${dbgconfig:bin}/app",
            "breakpoints": ["${dbgconfig:root}/main.rs:3"]
        }"#,
    );

    let output = Command::new(env!("CARGO_BIN_EXE_dap-harness"))
        .arg("--config")
        .arg(write_config(dir.path()))
        .arg("expand")
        .arg(&launch)
        .env("HARNESS_ROOT", "/work")
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let expanded: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(expanded["program"], "/work/bin/app");
    assert_eq!(expanded["request"], "launch");
    assert_eq!(expanded["breakpoints"], json!(["/work/main.rs:3"]));
}

#[test]
fn test_cli_expand_reports_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let launch = write(
        dir.path(),
        "launch.json",
        r#"{ "dbgconfig": { "a": "${dbgconfig:b}", "b": "${dbgconfig:a}" }, "program": "x" }"#,
    );

    let output = Command::new(env!("CARGO_BIN_EXE_dap-harness"))
        .arg("--config")
        .arg(write_config(dir.path()))
        .arg("expand")
        .arg(&launch)
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Cyclic reference"));
}

#[test]
fn test_cli_run_to_exit() {
    let dir = tempfile::tempdir().unwrap();
    let launch = write(dir.path(), "launch.json", r#"{ "program": "/mock/app" }"#);

    let output = Command::new(env!("CARGO_BIN_EXE_dap-harness"))
        .arg("--config")
        .arg(write_config(dir.path()))
        .arg("run")
        .arg(&launch)
        .output()
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("main.rs:10"), "stdout: {stdout}");
    assert!(stdout.contains("main.rs:14"), "stdout: {stdout}");
    assert!(stdout.contains("exit code 0"), "stdout: {stdout}");
}
