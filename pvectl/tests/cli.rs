use std::{fs, path::Path};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Settings keeping every path the tool touches inside `dir`.
fn settings_file(dir: &Path) -> String {
    let path = dir.join("settings.yaml");
    let root = dir.display();
    fs::write(
        &path,
        format!(
            "work_dir: {root}/work\n\
             image_cache_dir: {root}/images\n\
             snippets_dir: {root}/snippets\n\
             vmid_start: 8000\n\
             vmid_end: 8010\n\
             vmid_lock_file: {root}/vmid.lock\n\
             workloads_dir: {root}/workloads\n\
             terraform:\n  output_dir: {root}/terraform\n\
             ansible:\n  inventory_path: {root}/ansible/proxmox.yml\n  playbook_dir: {root}/ansible/playbooks\n",
            root = root
        ),
    )
    .unwrap();
    path.display().to_string()
}

fn create_template(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("create-template").unwrap();
    cmd.arg("--settings")
        .arg(settings_file(dir.path()))
        .arg("--non-interactive");
    cmd
}

#[test]
fn help_lists_template_flags() {
    Command::cargo_bin("create-template")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--distribution"))
        .stdout(predicate::str::contains("--export-config"))
        .stdout(predicate::str::contains("--ansible-var"));
}

#[test]
fn prints_version() {
    Command::cargo_bin("create-template")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("create-template "));
}

#[test]
fn lists_distributions() {
    let dir = TempDir::new().unwrap();
    create_template(&dir)
        .arg("--list-distributions")
        .assert()
        .success()
        .stdout(predicate::str::contains("ubuntu-22.04"))
        .stdout(predicate::str::contains("debian-12"))
        .stdout(predicate::str::contains("alpine-3.20"));
}

#[test]
fn generates_completions() {
    Command::cargo_bin("create-template")
        .unwrap()
        .args(["--completion", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("create-template"));
}

#[test]
fn exported_config_reloads_unchanged() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first.conf");
    let second = dir.path().join("second.conf");

    create_template(&dir)
        .args(["--distribution", "debian-12", "--template-name", "debian-docker"])
        .args(["--packages", "curl,vim", "--cores", "4"])
        .args(["--ansible-var", "timezone=UTC", "--terraform-var", "count=2"])
        .arg("--export-config")
        .arg(&first)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written to"));

    let exported = fs::read_to_string(&first).unwrap();
    assert!(exported.starts_with("# "));
    assert!(exported.contains("DISTRIBUTION=\"debian-12\""));
    assert!(exported.contains("PACKAGES=\"curl vim\""));
    assert!(exported.contains("ANSIBLE_VARS=\"timezone=UTC\""));

    create_template(&dir)
        .arg("--config")
        .arg(&first)
        .arg("--export-config")
        .arg(&second)
        .assert()
        .success();
    let reexported = fs::read_to_string(&second).unwrap();
    let body = |text: &str| {
        text.lines()
            .filter(|line| !line.starts_with('#'))
            .collect::<Vec<_>>()
            .join("\n")
    };
    assert_eq!(body(&exported), body(&reexported));
}

#[test]
fn invalid_template_name_exits_with_2() {
    let dir = TempDir::new().unwrap();
    create_template(&dir)
        .args(["--dry-run", "--distribution", "debian-12", "--template-name", "bad_name"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("bad_name"));
}

#[test]
fn unknown_distribution_exits_with_2() {
    let dir = TempDir::new().unwrap();
    create_template(&dir)
        .args(["--dry-run", "--distribution", "plan9", "--template-name", "plan9"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown distribution 'plan9'"));
}

#[test]
fn malformed_key_value_exits_with_2() {
    let dir = TempDir::new().unwrap();
    create_template(&dir)
        .args(["--distribution", "debian-12", "--ansible-var", "novalue"])
        .assert()
        .code(2);
}

#[test]
fn missing_distribution_exits_with_2() {
    let dir = TempDir::new().unwrap();
    create_template(&dir)
        .args(["--dry-run", "--template-name", "lonely"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no distribution selected"));
}

#[test]
fn dry_run_builds_nothing() {
    let dir = TempDir::new().unwrap();
    create_template(&dir)
        .args(["--dry-run", "--distribution", "ubuntu-22.04", "--template-name", "ubuntu-base"])
        .args(["--packages", "curl", "--terraform-module", "ubuntu_vms"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ubuntu-base (VMID 8000"))
        .stdout(predicate::str::contains("terraform/ubuntu_vms"))
        .stderr(predicate::str::contains("[dry-run] qm create 8000"));
    assert!(!dir.path().join("terraform").exists());
    assert!(!dir.path().join("images").exists());
    assert!(!dir.path().join("vmid.lock").exists());
}

#[test]
fn batch_reports_failed_entries() {
    let dir = TempDir::new().unwrap();
    let batch = dir.path().join("queue.batch");
    fs::write(
        &batch,
        "MEMORY=1024\n\n[ubuntu-base]\nDISTRIBUTION=\"ubuntu-22.04\"\n\n[broken]\nDISTRIBUTION=\"plan9\"\n",
    )
    .unwrap();

    create_template(&dir)
        .arg("--dry-run")
        .arg("--batch")
        .arg(&batch)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("1 succeeded, 1 failed"))
        .stdout(predicate::str::contains("broken"));
}
