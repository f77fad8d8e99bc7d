//! End-to-end tests that exercise the built `rivet` binary directly.

use std::io::Write;
use std::process::Command;

fn rivet() -> Command {
    Command::new(env!("CARGO_BIN_EXE_rivet"))
}

fn write_script(body: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".rvt").tempfile().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

#[test]
fn runs_a_file_and_exits_zero() {
    let file = write_script("let x = 1 + 2;");
    let status = rivet().arg(file.path()).status().unwrap();
    assert!(status.success());
}

#[test]
fn exits_nonzero_and_prints_to_stderr_on_a_compile_error() {
    let file = write_script("let x = ;");
    let output = rivet().arg(file.path()).output().unwrap();
    assert!(!output.status.success());
    assert!(!output.stderr.is_empty());
}

#[test]
fn no_arguments_prints_the_repl_notice_and_exits_zero() {
    let output = rivet().output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("REPL isn't implemented yet"));
}

#[test]
fn version_flag_prints_a_version_line() {
    let output = rivet().arg("--version").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("rivet "));

    let output = rivet().arg("-v").output().unwrap();
    assert!(output.status.success());
}
