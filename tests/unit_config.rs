//! Tests for the CLI surface and configuration loading, driving the
//! real binary.

use std::process::Command;

fn ccon() -> Command {
    Command::new(env!("CARGO_BIN_EXE_ccon"))
}

#[test]
fn help_goes_to_stdout_and_exits_zero() {
    let output = ccon().arg("--help").output().expect("failed to execute ccon --help");

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ccon"), "help should mention ccon, got: {stdout}");
    assert!(stdout.contains("--config"), "help should list options, got: {stdout}");
}

#[test]
fn version_prints_the_exact_string() {
    let output = ccon().arg("--version").output().expect("failed to execute ccon --version");

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "ccon 0.2.0\n");
}

#[test]
fn short_version_flag_matches_the_long_one() {
    let output = ccon().arg("-v").output().expect("failed to execute ccon -v");

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "ccon 0.2.0\n");
}

#[test]
fn unknown_arguments_print_usage_to_stderr_and_exit_one() {
    let output = ccon().arg("--bogus").output().expect("failed to execute ccon --bogus");

    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.is_empty(), "usage should be printed to stderr");
}

#[test]
fn missing_config_file_is_silent_without_verbose() {
    let output = ccon()
        .args(["-c", "/nonexistent/ccon-config.json"])
        .output()
        .expect("failed to execute ccon");

    assert_eq!(output.status.code(), Some(1));
    assert!(output.stderr.is_empty(), "non-verbose runs are silent");
}

#[test]
fn missing_config_file_is_named_in_verbose_mode() {
    let output = ccon()
        .args(["-V", "-c", "/nonexistent/ccon-config.json"])
        .output()
        .expect("failed to execute ccon");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("/nonexistent/ccon-config.json"),
        "verbose diagnostics should name the file, got: {stderr}"
    );
}

#[test]
fn invalid_inline_json_exits_one() {
    let output = ccon()
        .args(["-V", "-s", "{\"version\""])
        .output()
        .expect("failed to execute ccon");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("inline configuration"),
        "diagnostics should name the input kind, got: {stderr}"
    );
}

#[test]
fn unsupported_version_exits_one() {
    let output = ccon()
        .args(["-V", "-s", r#"{"version":"9.9.9"}"#])
        .output()
        .expect("failed to execute ccon");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("9.9.9"),
        "diagnostics should name the version, got: {stderr}"
    );
}

#[test]
fn prerelease_version_suffix_is_rejected() {
    let output = ccon()
        .args(["-s", r#"{"version":"0.2.0-pre"}"#])
        .output()
        .expect("failed to execute ccon");

    assert_eq!(output.status.code(), Some(1));
}

#[cfg(target_os = "linux")]
#[test]
fn inline_config_overrides_the_config_path() {
    let output = ccon()
        .args([
            "-c",
            "/nonexistent/ccon-config.json",
            "-s",
            r#"{"version":"0.2.0","process":{"args":["/bin/true"]}}"#,
        ])
        .output()
        .expect("failed to execute ccon");

    assert_eq!(output.status.code(), Some(0));
}

#[cfg(target_os = "linux")]
#[test]
fn config_is_read_from_the_given_path() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("config.json");
    std::fs::write(&path, r#"{"version":"0.2.0","process":{"args":["/bin/true"]}}"#).unwrap();

    let output = ccon()
        .args(["-c", path.to_str().unwrap()])
        .output()
        .expect("failed to execute ccon");

    assert_eq!(output.status.code(), Some(0));
}
