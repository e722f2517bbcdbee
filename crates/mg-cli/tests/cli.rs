use std::path::Path;

use assert_cmd::Command;
use mg_agent::seal::seal;
use predicates::prelude::*;

const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

fn macroguard(workdir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("macroguard"));
    cmd.current_dir(workdir)
        .env_remove("MACROGUARD_KEY")
        .env_remove("MACROGUARD_ENDPOINT")
        .env_remove("MACROGUARD_DRY_RUN")
        .env_remove("RUST_LOG");
    cmd
}

fn privhelper(workdir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("macroguard-privhelper"));
    cmd.current_dir(workdir).env_remove("MACROGUARD_ENDPOINT");
    cmd
}

#[test]
fn help_lists_operator_flags() {
    let dir = tempfile::tempdir().unwrap();
    let output = macroguard(dir.path()).arg("--help").output().expect("run help");
    assert!(output.status.success(), "--help should succeed");
    let text = String::from_utf8_lossy(&output.stdout);
    for needle in [
        "--action-path",
        "--dry-run",
        "--enable-hardening",
        "--no-disk-scan",
        "--result-list",
        "--no-priv",
    ] {
        assert!(text.contains(needle), "help output should contain '{needle}'");
    }
}

#[test]
fn helper_help_hides_the_fake_editor() {
    let dir = tempfile::tempdir().unwrap();
    privhelper(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--lock-file"))
        .stdout(predicate::str::contains("--doc-timeout-secs"))
        .stdout(predicate::str::contains("without a spreadsheet automation bridge"))
        .stdout(predicate::str::contains("fake-editor").not());
}

#[test]
fn missing_root_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    macroguard(dir.path())
        .args(["--action-path", "/definitely/not/here", "--key", KEY_HEX])
        .assert()
        .code(2);
    let log = std::fs::read_to_string(dir.path().join("macroguard.log")).unwrap();
    assert!(log.contains("--action-path"));
}

#[test]
fn missing_key_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    macroguard(dir.path())
        .arg("--action-path")
        .arg(dir.path())
        .assert()
        .code(2);
}

#[test]
fn catalog_sealed_with_another_key_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let blob = seal(&[7u8; 32], br#"{"version":1,"solutions":[]}"#).unwrap();
    std::fs::write(dir.path().join("cramc_db.bin"), blob).unwrap();
    macroguard(dir.path())
        .arg("--action-path")
        .arg(dir.path())
        .args(["--catalog", "cramc_db.bin", "--key", KEY_HEX])
        .assert()
        .code(2);
}

#[test]
fn dry_run_replays_result_list_without_touching_anything() {
    let dir = tempfile::tempdir().unwrap();
    let key = hex_key();
    let catalog = br#"{"version":1,"solutions":[{
        "name":"VirusX","module":"Module1","action":"remediate","mustHarden":true,
        "hardenMeasures":[{"action":"setRO","type":"file","dest":"${HOME}/cache.db"}]
    }]}"#;
    std::fs::write(dir.path().join("cramc_db.bin"), seal(&key, catalog).unwrap()).unwrap();

    let doc = dir.path().join("Book1.xlsm");
    std::fs::write(&doc, b"not really a workbook").unwrap();
    std::fs::write(
        dir.path().join("ipt_yrscan.lst"),
        format!("VirusX {}\nUnknownRule {}\n", doc.display(), doc.display()),
    )
    .unwrap();

    macroguard(dir.path())
        .arg("--action-path")
        .arg(dir.path())
        .args([
            "--dry-run",
            "--no-disk-scan",
            "--catalog",
            "cramc_db.bin",
            "--key",
            KEY_HEX,
            "--privhelper",
            "/definitely/not/a/helper",
        ])
        .assert()
        .success();

    let log = std::fs::read_to_string(dir.path().join("macroguard.log")).unwrap();
    assert!(log.contains("dry run, would sanitize"), "log: {log}");
    assert!(log.contains("UnknownRule"), "unmatched detection should be logged");
    assert_eq!(
        std::fs::read(&doc).unwrap(),
        b"not really a workbook".to_vec()
    );
    assert!(!dir.path().join("Book1.xlsm.gz.bak").exists());
}

#[test]
fn missing_result_list_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let blob = seal(&hex_key(), br#"{"version":1,"solutions":[]}"#).unwrap();
    std::fs::write(dir.path().join("cramc_db.bin"), blob).unwrap();
    macroguard(dir.path())
        .arg("--action-path")
        .arg(dir.path())
        .args(["--no-disk-scan", "--catalog", "cramc_db.bin", "--key", KEY_HEX])
        .assert()
        .code(2);
}

#[cfg(unix)]
#[test]
fn helper_refuses_to_start_while_lock_is_held() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("privhelper.lock"), b"").unwrap();
    let endpoint = dir.path().join("priv.sock");
    privhelper(dir.path())
        .arg("--endpoint")
        .arg(&endpoint)
        .arg("--dry-run")
        .assert()
        .code(3);
    assert!(dir.path().join("privhelper.lock").exists());
    assert!(!endpoint.exists());
}

#[cfg(unix)]
#[test]
fn helper_without_editor_bridge_fails_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = dir.path().join("priv.sock");
    privhelper(dir.path())
        .arg("--endpoint")
        .arg(&endpoint)
        .assert()
        .code(1);
    assert!(!dir.path().join("privhelper.lock").exists());
    let log = std::fs::read_to_string(dir.path().join("macroguard_privhelper.log")).unwrap();
    assert!(log.contains("no spreadsheet automation bridge"), "log: {log}");
    assert!(log.contains("editor"));
}

fn hex_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    for (i, b) in key.iter_mut().enumerate() {
        *b = i as u8;
    }
    key
}
