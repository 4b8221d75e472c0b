//! CLI integration tests for inter-server-sync.
//!
//! These tests verify command-line argument parsing, help output,
//! and exit codes for error conditions detected before any database work.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::path::Path;
use tempfile::{NamedTempFile, TempDir};

/// Get a command for the inter-server-sync binary.
fn cmd() -> Command {
    Command::cargo_bin("inter-server-sync").unwrap()
}

/// A valid configuration pinned to a local server identity.
fn config_file(extra: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"source:
  host: localhost
  database: susemanager
  user: spacewalk
  password: secret
server:
  product_name: uyuni
  version: "2024.02"
{}"#,
        extra
    )
    .unwrap();
    file
}

fn write_bundle(dir: &Path, version: &str) {
    std::fs::write(
        dir.join("version.txt"),
        format!("product_name = uyuni\nversion = {}\n", version),
    )
    .unwrap();
    std::fs::write(dir.join("sql_statements.sql"), "BEGIN;\nCOMMIT;\n").unwrap();
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("export"))
        .stdout(predicate::str::contains("import"))
        .stdout(predicate::str::contains("schema"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_export_subcommand_help() {
    cmd()
        .args(["export", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--channels"))
        .stdout(predicate::str::contains("--channel-with-children"))
        .stdout(predicate::str::contains("--config-channels"))
        .stdout(predicate::str::contains("--output-dir"))
        .stdout(predicate::str::contains("--metadata-only"))
        .stdout(predicate::str::contains("--images"))
        .stdout(predicate::str::contains("--containers"))
        .stdout(predicate::str::contains("--org-limit"))
        .stdout(predicate::str::contains("--packages-only-after"));
}

#[test]
fn test_import_subcommand_help() {
    cmd()
        .args(["import", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--import-dir"))
        .stdout(predicate::str::contains("--skip-verify"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("inter-server-sync"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_output_json_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"));
}

#[test]
fn test_log_format_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"));
}

#[test]
fn test_verbosity_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_config_default_path() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

// =============================================================================
// Exit Code Tests - Config Errors (Exit Code 1)
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_missing_required_fields_exits_with_code_1() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "source:").unwrap();
    writeln!(file, "  host: localhost").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_export_without_subjects_exits_with_code_1() {
    let out = TempDir::new().unwrap();
    let config = config_file("");

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "export",
            "--output-dir",
            out.path().to_str().unwrap(),
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_export_invalid_org_limit_exits_with_code_1() {
    let out = TempDir::new().unwrap();
    let config = config_file("");

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "export",
            "--images",
            "--org-limit",
            "1,0",
            "--output-dir",
            out.path().to_str().unwrap(),
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("org_limit"));
}

#[test]
fn test_export_invalid_date_exits_with_code_1() {
    let out = TempDir::new().unwrap();
    let config = config_file("");

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "export",
            "--channels",
            "base-x86_64",
            "--output-dir",
            out.path().to_str().unwrap(),
            "--packages-only-after",
            "last tuesday",
        ])
        .assert()
        .code(1);
}

#[test]
fn test_import_without_dir_exits_with_code_1() {
    let config = config_file("");

    cmd()
        .args(["--config", config.path().to_str().unwrap(), "import"])
        .assert()
        .code(1);
}

#[test]
fn test_unknown_table_set_exits_with_code_1() {
    let config = config_file("");

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "schema",
            "--tables",
            "errata",
        ])
        .assert()
        .code(1);
}

// =============================================================================
// Exit Code Tests - Bundle Checks
// =============================================================================

#[test]
fn test_import_version_mismatch_exits_with_code_4() {
    let bundle = TempDir::new().unwrap();
    write_bundle(bundle.path(), "2023.09");
    let config = config_file("");

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "import",
            "--import-dir",
            bundle.path().to_str().unwrap(),
        ])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Wrong version detected"));
}

#[test]
fn test_import_missing_bundle_dir_exits_with_code_5() {
    let config = config_file("");

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "import",
            "--import-dir",
            "/nonexistent/bundle",
        ])
        .assert()
        .code(5);
}

#[test]
fn test_import_digest_mismatch_exits_with_code_5() {
    let bundle = TempDir::new().unwrap();
    write_bundle(bundle.path(), "2024.02");
    std::fs::write(
        bundle.path().join("sql_statements.sha256"),
        format!("{}  sql_statements.sql\n", "0".repeat(64)),
    )
    .unwrap();
    let config = config_file("");

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "import",
            "--import-dir",
            bundle.path().to_str().unwrap(),
        ])
        .assert()
        .code(5)
        .stderr(predicate::str::contains("digest mismatch"));
}
