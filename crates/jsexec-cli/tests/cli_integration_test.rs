//! CLI Integration Tests
//!
//! Runs the built `jsexec` binary and checks exit codes and output.

use std::process::{Command, Output};

fn jsexec(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_jsexec"))
        .args(args)
        .env_remove("JSEXEC_QUEUE_TYPE")
        .env_remove("JSEXEC_MAX_ACTIVE_SCRIPTS")
        .env_remove("JSEXEC_CONFIG")
        .env_remove("JSEXEC_KAFKA_SERVERS")
        .output()
        .expect("failed to run jsexec binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn test_help_lists_subcommands() {
    let output = jsexec(&["--help"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("run"));
    assert!(text.contains("eval"));
}

#[test]
fn test_run_help_mentions_environment() {
    let output = jsexec(&["run", "--help"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("JSEXEC_MAX_ACTIVE_SCRIPTS"));
}

#[test]
fn test_eval_prints_result() {
    let output = jsexec(&["eval", "(a, b) => a * b", "6", "7"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "42");
}

#[test]
fn test_eval_json_arguments() {
    let output = jsexec(&["eval", "(m) => m.items.length", r#"{"items": [1, 2, 3]}"#]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "3");
}

#[test]
fn test_eval_syntax_error_fails() {
    let output = jsexec(&["eval", "x => {"]);
    assert!(!output.status.success());
    assert!(stdout(&output).is_empty());
    assert!(!stderr(&output).is_empty());
}

#[test]
fn test_eval_runaway_script_times_out() {
    let output = jsexec(&["eval", "-t", "100", "() => { while (true) {} }"]);
    assert!(!output.status.success());
}

#[test]
fn test_run_rejects_invalid_queue_type() {
    let output = jsexec(&["run", "--queue-type", "carrier-pigeon"]);
    assert!(!output.status.success());
}

#[test]
fn test_run_rejects_zero_cache_capacity() {
    let output = jsexec(&["run", "--max-active-scripts", "0"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("max_active_scripts"), "stderr: {}", stderr(&output));
}

#[test]
fn test_run_rejects_bad_environment_value() {
    let output = Command::new(env!("CARGO_BIN_EXE_jsexec"))
        .arg("run")
        .env("JSEXEC_MAX_ACTIVE_SCRIPTS", "lots")
        .output()
        .expect("failed to run jsexec binary");
    assert!(!output.status.success());
    assert!(stderr(&output).contains("JSEXEC_MAX_ACTIVE_SCRIPTS"));
}

#[test]
fn test_run_without_built_in_broker_fails() {
    let output = jsexec(&["run", "--queue-type", "pubsub", "--http-bind", "127.0.0.1:0"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("pubsub"));
}

#[test]
fn test_kafka_requires_servers() {
    let output = jsexec(&["run", "--queue-type", "kafka", "--kafka-servers", " "]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("kafka servers"), "stderr: {}", stderr(&output));
}
