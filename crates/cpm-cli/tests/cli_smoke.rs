//! End-to-end smoke tests over the `cpm` binary. Everything runs against a
//! temp workspace and never touches the network.

use assert_cmd::Command;
use predicates::prelude::*;

fn cpm(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("cpm").expect("binary");
    cmd.arg("--workspace-dir").arg(dir);
    cmd
}

#[test]
fn list_on_fresh_workspace_is_empty() {
    let tmp = tempfile::tempdir().unwrap();
    cpm(tmp.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("no packets installed"));
    assert!(tmp.path().join(".cpm/packages").is_dir());
    assert!(tmp.path().join(".cpm/state/pins").is_dir());
}

#[test]
fn plugins_lists_builtin_features() {
    let tmp = tempfile::tempdir().unwrap();
    cpm(tmp.path())
        .arg("plugins")
        .assert()
        .success()
        .stdout(predicate::str::contains("native-retriever"));
}

#[test]
fn build_without_source_fails_with_tag() {
    let tmp = tempfile::tempdir().unwrap();
    cpm(tmp.path())
        .args(["build", "run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("[cpm:build]"));
}

#[test]
fn install_requires_version() {
    let tmp = tempfile::tempdir().unwrap();
    cpm(tmp.path())
        .args(["install", "docs"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("version is required"));
}

#[test]
fn query_against_missing_packet_reports_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    cpm(tmp.path())
        .args(["query", "--packet", "ghost", "--query", "anything"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("packet_not_found"));
}

#[test]
fn failed_plugin_is_isolated_from_commands() {
    let tmp = tempfile::tempdir().unwrap();
    let plugin_dir = tmp.path().join(".cpm/plugins/broken");
    std::fs::create_dir_all(&plugin_dir).unwrap();
    std::fs::write(
        plugin_dir.join("plugin.toml"),
        "[plugin]\nid = \"broken\"\nname = \"Broken\"\nversion = \"0.1.0\"\ngroup = \"broken\"\nentrypoint = \"missing:Entry\"\nrequires_cpm = \">=0.1\"\n",
    )
    .unwrap();

    // The broken plugin shows up failed, and builtin commands still work.
    cpm(tmp.path())
        .arg("plugins")
        .assert()
        .success()
        .stdout(predicate::str::contains("state=failed"));
    cpm(tmp.path()).arg("list").assert().success();
}
