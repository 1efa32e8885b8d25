//! End-to-end tests of the cellvm binary

use std::io::Write;
use std::process::Command;

fn cellvm() -> Command {
    Command::new(env!("CARGO_BIN_EXE_cellvm"))
}

#[test]
fn test_expr_prints_result() {
    let output = cellvm().args(["--expr", "1 + 2 * 3"]).output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "== 9");
}

#[test]
fn test_script_file_runs_and_prints() {
    let mut script = tempfile::NamedTempFile::new().unwrap();
    writeln!(script, "greet: func [name] [print name]").unwrap();
    writeln!(script, "greet \"hello\"").unwrap();
    let output = cellvm().arg(script.path()).output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
}

#[test]
fn test_error_is_reported_with_exit_code() {
    let output = cellvm().args(["--expr", "add 1 nothing-here"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("** Script Error:"), "{stderr}");
    assert!(stderr.contains("nothing-here"), "{stderr}");
}

#[test]
fn test_missing_input_is_usage_error() {
    let output = cellvm().output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_stats_go_to_stderr() {
    let output = cellvm().args(["--stats", "--expr", "recycle"]).output().unwrap();
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("arena:"), "{stderr}");
}
