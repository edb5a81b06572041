//! End-to-end exec tests in unprivileged mode, driving the compiled
//! binaries with a temp configuration.
//!
//! Setuid behavior (user switching, privsep, PAM, real cgroup drain)
//! needs a privileged install and is exercised by system-level testing;
//! everything policy- and input-shaped is covered here.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use imp_core::{SecurityConfig, SecurityContext, UnwrapMode};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    pattern: String,
}

/// Writes a config allowing the current user to exec `shell` without
/// privilege.
fn fixture(allowed_user: &str, shell: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = format!(
        r#"
        [sign]
        max-ttl = 30
        default-type = "none"
        allowed-types = ["none"]

        [exec]
        allowed-users = ["{allowed_user}"]
        allowed-shells = ["{shell}"]
        allow-unprivileged-exec = true
        "#
    );
    std::fs::write(dir.path().join("imp.toml"), config).unwrap();
    let pattern = format!("{}/*.toml", dir.path().display());
    Fixture { _dir: dir, pattern }
}

fn current_username() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .unwrap()
        .unwrap()
        .name
}

/// Mints an envelope for the current uid under the fixture's config.
fn mint_token(pattern: &str) -> String {
    let config = SecurityConfig::load_pattern(pattern).unwrap();
    let mut ctx = SecurityContext::new(config);
    ctx.sign_wrap(b"{}", None).unwrap().to_string()
}

fn run_imp(fixture: &Fixture, shell: &str, stdin_text: &str) -> std::process::Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_flux-imp"))
        .args(["exec", shell, "arg0"])
        .env("FLUX_IMP_CONFIG_PATTERN", &fixture.pattern)
        .env_remove("FLUX_IMP_EXEC_HELPER")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .as_mut()
        .unwrap()
        .write_all(stdin_text.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

#[test]
fn exec_happy_path_exits_zero() {
    let fixture = fixture(&current_username(), "/bin/true");
    let token = mint_token(&fixture.pattern);
    let output = run_imp(&fixture, "/bin/true", &format!("{{\"J\": \"{token}\"}}"));
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn exec_exit_code_propagates() {
    let fixture = fixture(&current_username(), "/bin/false");
    let token = mint_token(&fixture.pattern);
    let output = run_imp(&fixture, "/bin/false", &format!("{{\"J\": \"{token}\"}}"));
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn exec_missing_shell_exits_127() {
    let fixture = fixture(&current_username(), "/nonexistent/job-shell");
    let token = mint_token(&fixture.pattern);
    let output = run_imp(
        &fixture,
        "/nonexistent/job-shell",
        &format!("{{\"J\": \"{token}\"}}"),
    );
    assert_eq!(output.status.code(), Some(127));
}

#[test]
fn exec_caller_not_allowed_exits_one() {
    let fixture = fixture("no-such-user-xyz", "/bin/true");
    let token = mint_token(&fixture.pattern);
    let output = run_imp(&fixture, "/bin/true", &format!("{{\"J\": \"{token}\"}}"));
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("allowed-users"), "stderr: {stderr}");
}

#[test]
fn exec_bad_token_exits_one() {
    let fixture = fixture(&current_username(), "/bin/true");
    let output = run_imp(&fixture, "/bin/true", "{\"J\": \"not-an-envelope\"}");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn exec_garbage_stdin_exits_one() {
    let fixture = fixture(&current_username(), "/bin/true");
    let output = run_imp(&fixture, "/bin/true", "this is not json");
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn exec_reads_request_from_helper() {
    let fixture = fixture(&current_username(), "/bin/true");
    let token = mint_token(&fixture.pattern);

    // Helper writes the request to stdout; stdin is ignored entirely.
    let helper_dir = TempDir::new().unwrap();
    let helper = helper_dir.path().join("helper.sh");
    std::fs::write(
        &helper,
        format!("#!/bin/sh\necho '{{\"J\": \"{token}\"}}'\n"),
    )
    .unwrap();
    make_executable(&helper);

    let output = Command::new(env!("CARGO_BIN_EXE_flux-imp"))
        .args(["exec", "/bin/true", "arg0"])
        .env("FLUX_IMP_CONFIG_PATTERN", &fixture.pattern)
        .env("FLUX_IMP_EXEC_HELPER", helper.display().to_string())
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn exec_failing_helper_exits_one() {
    let fixture = fixture(&current_username(), "/bin/true");
    let output = Command::new(env!("CARGO_BIN_EXE_flux-imp"))
        .args(["exec", "/bin/true", "arg0"])
        .env("FLUX_IMP_CONFIG_PATTERN", &fixture.pattern)
        .env("FLUX_IMP_EXEC_HELPER", "false")
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn sign_cli_round_trips_with_exec_config() {
    let fixture = fixture(&current_username(), "/bin/true");

    let mut child = Command::new(env!("CARGO_BIN_EXE_sign"))
        .env("FLUX_IMP_CONFIG_PATTERN", &fixture.pattern)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.as_mut().unwrap().write_all(b"hi").unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let envelope = String::from_utf8(output.stdout).unwrap();
    let envelope = envelope.trim_end();
    assert!(envelope.ends_with(".aGk=.none"), "envelope: {envelope}");

    let config = SecurityConfig::load_pattern(&fixture.pattern).unwrap();
    let mut ctx = SecurityContext::new(config);
    let unwrapped = ctx.sign_unwrap(envelope, UnwrapMode::Verify).unwrap();
    assert_eq!(unwrapped.payload, b"hi");
    assert_eq!(unwrapped.userid, nix::unistd::getuid().as_raw());
}

#[test]
fn sign_cli_fails_without_pattern() {
    let output = Command::new(env!("CARGO_BIN_EXE_sign"))
        .env_remove("FLUX_IMP_CONFIG_PATTERN")
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn version_subcommand() {
    let output = Command::new(env!("CARGO_BIN_EXE_flux-imp"))
        .arg("version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("flux-imp "));
}

fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}
