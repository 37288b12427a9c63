#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Container CLI stand-in: `up` drops the bridge socket file, `ps` reports
/// healthy services and the database probe says "missing".
const STUB_RUNTIME: &str = r#"#!/bin/sh
case "$*" in
  *"grep -q 1"*) exit 1 ;;
  *" up "*) mkdir -p sockets && : > sockets/api.sock ;;
  *" ps "*)
    echo '{"Service":"redis","State":"running","Health":"healthy"}'
    echo '{"Service":"api","State":"running","Health":""}'
    ;;
  *" logs "*) echo "api-1  | listening on :3000" ;;
esac
exit 0
"#;

fn scratch(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("scratch").unwrap();
    cmd.current_dir(dir.path())
        .env("SCRATCH_ROOT", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

/// `scratch init`, then point the runtime at the stub.
fn init_project(dir: &TempDir) {
    use std::os::unix::fs::PermissionsExt;

    scratch(dir).arg("init").assert().success();
    let stub = dir.path().join("fake-docker");
    std::fs::write(&stub, STUB_RUNTIME).unwrap();
    std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

    let path = dir.path().join("scratch.yaml");
    let config = std::fs::read_to_string(&path).unwrap().replace(
        "  command: docker\n",
        &format!(
            "  command: {}\n  health_timeout_secs: 0\n  bridge_wait_ms: 0\n  uid: 1000\n  gid: 1000\n",
            stub.display()
        ),
    );
    std::fs::write(&path, config).unwrap();
}

fn create(dir: &TempDir, branch: &str) {
    scratch(dir).args(["create", branch]).assert().success();
}

// ---------------------------------------------------------------------------
// scratch init / config
// ---------------------------------------------------------------------------

#[test]
fn init_writes_config_and_template() {
    let dir = TempDir::new().unwrap();
    scratch(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: scratch.yaml"));

    assert!(dir.path().join("scratch.yaml").exists());
    assert!(dir.path().join("templates/env/backend.env").exists());
    assert!(dir.path().join("releases").is_dir());
}

#[test]
fn init_is_idempotent_and_never_overwrites() {
    let dir = TempDir::new().unwrap();
    scratch(&dir).arg("init").assert().success();
    std::fs::write(dir.path().join("templates/env/backend.env"), "MINE=1\n").unwrap();

    scratch(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:  scratch.yaml"));
    let template = std::fs::read_to_string(dir.path().join("templates/env/backend.env")).unwrap();
    assert_eq!(template, "MINE=1\n");
}

#[test]
fn missing_config_is_reported() {
    let dir = TempDir::new().unwrap();
    scratch(&dir)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("run 'scratch init'"));
}

#[test]
fn default_config_validates() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    scratch(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn unknown_profile_service_fails_validation() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let path = dir.path().join("scratch.yaml");
    let config = std::fs::read_to_string(&path)
        .unwrap()
        .replace("services: [postgres, api]", "services: [postgres, api, mailhog]");
    std::fs::write(&path, config).unwrap();

    scratch(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("unknown service 'mailhog'"));
}

#[test]
fn config_show_redacts_webhook_secret() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    let path = dir.path().join("scratch.yaml");
    let config = std::fs::read_to_string(&path)
        .unwrap()
        .replace("  # webhook_secret:", "  webhook_secret: hunter2\n  # was:");
    std::fs::write(&path, config).unwrap();

    scratch(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<redacted>"))
        .stdout(predicate::str::contains("hunter2").not());
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn create_list_status_delete() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);

    scratch(&dir)
        .args(["create", "feature/Login-Page"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created scratch 'featurelogin-page'"))
        .stdout(predicate::str::contains("scratch_featurelogin-page"));
    assert!(dir
        .path()
        .join("releases/featurelogin-page/env/backend.env")
        .exists());

    scratch(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("featurelogin-page"))
        .stdout(predicate::str::contains("feature/Login-Page"));

    let output = scratch(&dir)
        .args(["--json", "status", "featurelogin-page"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["state"], "running");

    scratch(&dir)
        .args(["delete", "featurelogin-page"])
        .assert()
        .success();
    assert!(!dir.path().join("releases/featurelogin-page").exists());

    scratch(&dir)
        .args(["status", "featurelogin-page"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("scratch not found"));
}

#[test]
fn second_create_updates() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, "demo");
    scratch(&dir)
        .args(["create", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Updated scratch 'demo'"));
}

#[test]
fn invalid_branch_is_rejected_without_side_effects() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    scratch(&dir)
        .args(["create", "!!!"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid identity"));
    let entries = std::fs::read_dir(dir.path().join("releases")).unwrap().count();
    assert_eq!(entries, 0);
}

#[test]
fn stop_and_start() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, "cycle");

    scratch(&dir)
        .args(["stop", "cycle"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cycle: stopped"));
    assert!(!dir.path().join("releases/cycle/sockets/api.sock").exists());

    scratch(&dir)
        .args(["start", "cycle"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cycle: running"));
}

#[test]
fn update_without_changes_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, "steady");
    scratch(&dir)
        .args(["update", "steady"])
        .assert()
        .success()
        .stdout(predicate::str::contains("up to date"));
}

// ---------------------------------------------------------------------------
// Env files
// ---------------------------------------------------------------------------

#[test]
fn env_set_keys_and_show() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, "envy");

    scratch(&dir)
        .args(["env", "set", "envy", "backend", "FEATURE_FLAG=on"])
        .assert()
        .success()
        .stdout(predicate::str::contains("backend changed"));

    scratch(&dir)
        .args(["env", "show", "envy", "backend"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FEATURE_FLAG=on"))
        .stdout(predicate::str::contains("DATABASE_URL="));
}

#[test]
fn env_paths_outside_the_scratch_are_rejected() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, "safe");

    scratch(&dir)
        .args(["env", "set", "safe", "../../etc/passwd", "X=1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid path"));
}

#[test]
fn env_reset_restores_template() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, "resettable");
    let file = dir.path().join("releases/resettable/env/backend.env");
    std::fs::write(&file, "BROKEN=1\n").unwrap();

    scratch(&dir)
        .args(["env", "reset", "resettable", "backend"])
        .assert()
        .success();
    let content = std::fs::read_to_string(&file).unwrap();
    assert!(content.contains("DATABASE_URL="));
    assert!(!content.contains("BROKEN"));
}

// ---------------------------------------------------------------------------
// Logs / ingress
// ---------------------------------------------------------------------------

#[test]
fn oplogs_record_operations() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, "audited");
    scratch(&dir)
        .args(["oplogs", "audited"])
        .assert()
        .success()
        .stdout(predicate::str::contains("create"));
}

#[test]
fn container_logs_are_printed() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    create(&dir, "noisy");
    scratch(&dir)
        .args(["logs", "noisy", "--service", "api"])
        .assert()
        .success()
        .stdout(predicate::str::contains("listening on :3000"));
    scratch(&dir)
        .args(["logs", "noisy", "--service", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown service"));
}

#[test]
fn ingress_prints_nginx_rule() {
    let dir = TempDir::new().unwrap();
    init_project(&dir);
    scratch(&dir)
        .args(["ingress", "--upstream", "10.1.2.3:3456"])
        .assert()
        .success()
        .stdout(predicate::str::contains("proxy_pass http://10.1.2.3:3456;"))
        .stdout(predicate::str::contains("/$scratch_id/sockets/api.sock:"));
}
