//! Integration tests for the kanban CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a kanban Command isolated from the caller's config
fn kanban(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("kanban");
    cmd.current_dir(dir.path()).env_remove("KANBAN_CONFIG");
    cmd
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_kanban_help() {
        let dir = TempDir::new().unwrap();
        kanban(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("watch"));
    }

    #[test]
    fn test_kanban_version() {
        let dir = TempDir::new().unwrap();
        kanban(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = TempDir::new().unwrap();
        kanban(&dir).arg("frobnicate").assert().failure();
    }

    #[test]
    fn test_watch_requires_project() {
        let dir = TempDir::new().unwrap();
        kanban(&dir)
            .arg("watch")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--project"));
    }

    #[test]
    fn test_watch_requires_actor() {
        let dir = TempDir::new().unwrap();
        kanban(&dir)
            .args(["watch", "--project", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--actor"));
    }
}

// =============================================================================
// Database Tests
// =============================================================================

mod init_db {
    use super::*;

    #[test]
    fn test_init_db_creates_file() {
        let dir = TempDir::new().unwrap();
        kanban(&dir)
            .args(["init-db", "--db-path", "data/board.db"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Board database initialized"));
        assert!(dir.path().join("data/board.db").exists());
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let dir = TempDir::new().unwrap();
        for _ in 0..2 {
            kanban(&dir)
                .args(["init-db", "--db-path", "board.db"])
                .assert()
                .success();
        }
    }

    #[test]
    fn test_init_db_uses_config_path() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("kanban.toml"),
            "[server]\ndb_path = \"from-config/board.db\"\n",
        )
        .unwrap();
        kanban(&dir).arg("init-db").assert().success();
        assert!(dir.path().join("from-config/board.db").exists());
    }
}

// =============================================================================
// Config Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        kanban(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using default configuration"))
            .stdout(predicate::str::contains("port = 3141"));
    }

    #[test]
    fn test_config_init_then_show() {
        let dir = TempDir::new().unwrap();
        kanban(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created kanban.toml"));
        assert!(dir.path().join("kanban.toml").exists());

        kanban(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        kanban(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Config file:"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("kanban.toml"),
            "[realtime]\nbase_backoff_ms = 9000\nmax_backoff_ms = 1000\n",
        )
        .unwrap();
        kanban(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings"))
            .stdout(predicate::str::contains("base_backoff_ms"));
    }

    #[test]
    fn test_config_validate_clean() {
        let dir = TempDir::new().unwrap();
        kanban(&dir).args(["config", "init"]).assert().success();
        kanban(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_invalid_config_fails_commands() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("kanban.toml"), "[server\n").unwrap();
        kanban(&dir)
            .arg("init-db")
            .assert()
            .failure()
            .stderr(predicate::str::contains("kanban.toml"));
    }

    #[test]
    fn test_config_env_var_points_at_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alt.toml");
        fs::write(&path, "[server]\ndb_path = \"alt/board.db\"\n").unwrap();
        kanban(&dir)
            .env("KANBAN_CONFIG", &path)
            .arg("init-db")
            .assert()
            .success();
        assert!(dir.path().join("alt/board.db").exists());
    }
}
