//! CLI tests for gu-core: argument errors, output formats, and exit codes.

mod support;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use support::Fixture;

/// Get a Command for the gu-core binary.
fn gu_core() -> Command {
    let mut cmd = Command::cargo_bin("gu-core").expect("gu-core binary should exist");
    cmd.env_remove("GU_CONFIG").env_remove("GU_CONFIG_DIR");
    cmd
}

fn result_of(stdout: &[u8]) -> Value {
    let doc: Value = serde_json::from_slice(stdout).expect("stdout should be JSON");
    doc["result"].clone()
}

// ============================================================================
// Argument errors
// ============================================================================

mod invalid_args {
    use super::*;

    #[test]
    fn unknown_command_fails() {
        gu_core()
            .arg("nonexistent-command")
            .assert()
            .failure()
            .stderr(predicate::str::contains("error"));
    }

    #[test]
    fn unknown_flag_subcommand_fails() {
        gu_core()
            .args(["flag", "raise"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("error"));
    }

    #[test]
    fn watch_pid_and_exec_conflict() {
        gu_core()
            .args(["watch", "--pid", "1", "--exec", "/bin/true"])
            .assert()
            .failure();
    }

    #[test]
    fn watch_pid_out_of_range_is_rejected() {
        for pid in ["0", "2147483648", "4294967295"] {
            gu_core()
                .args(["watch", "--pid", pid])
                .assert()
                .code(2)
                .stderr(predicate::str::contains("--pid"));
        }
    }

    #[test]
    fn missing_config_file_is_a_config_error() {
        gu_core()
            .args(["--config", "/nonexistent/updater.json", "config", "show"])
            .assert()
            .code(11);
    }
}

// ============================================================================
// Inspection commands
// ============================================================================

mod inspect {
    use super::*;

    #[test]
    fn version_is_json_by_default() {
        let output = gu_core().arg("version").assert().success().get_output().stdout.clone();
        let result = result_of(&output);
        assert_eq!(result["version"], env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn version_human() {
        gu_core()
            .args(["-f", "human", "version"])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("gu-core "));
    }

    #[test]
    fn config_validate_accepts_fixture() {
        let fixture = Fixture::new();
        let config = fixture.write_config();
        let output = gu_core()
            .arg("--config")
            .arg(&config)
            .args(["config", "validate"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        assert_eq!(result_of(&output)["valid"], true);
    }

    #[test]
    fn config_validate_rejects_bad_values() {
        let fixture = Fixture::new();
        let mut config = fixture.config();
        config.fetch.workers = 0;
        let path = fixture.path("bad.json");
        std::fs::write(&path, serde_json::to_vec(&config).unwrap()).unwrap();
        gu_core()
            .arg("--config")
            .arg(&path)
            .args(["config", "validate"])
            .assert()
            .code(11)
            .stdout(predicate::str::contains("fetch.workers"));
    }

    #[test]
    fn empty_state_shows_clear_flag_and_empty_journal() {
        let fixture = Fixture::new();
        let config = fixture.write_config();

        let flag = gu_core()
            .arg("--config")
            .arg(&config)
            .args(["flag", "show"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        assert_eq!(result_of(&flag)["flag"]["state"], "clear");

        let journal = gu_core()
            .arg("--config")
            .arg(&config)
            .args(["journal", "show"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        assert_eq!(result_of(&journal)["batches"].as_array().map(Vec::len), Some(0));
    }
}

// ============================================================================
// Update and restore
// ============================================================================

mod sessions {
    use super::*;

    #[test]
    fn update_installs_and_reports_versions() {
        let mut fixture = Fixture::new();
        fixture.install("a.txt", b"a1");
        fixture.publish("1.1.0", &[("a.txt", b"a2", 0o644)], false);
        let config = fixture.write_config();

        let output = gu_core()
            .arg("--config")
            .arg(&config)
            .args(["update", "--no-launch"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let result = result_of(&output);
        assert_eq!(result["outcome"]["status"], "succeeded");
        assert_eq!(result["to_version"], "1.1.0");
        assert_eq!(fixture.read_installed("a.txt"), b"a2");
    }

    #[test]
    fn corrupted_package_exits_aborted() {
        let mut fixture = Fixture::new();
        fixture.install("a.txt", b"a1");
        fixture.publish("1.1.0", &[("a.txt", b"a2", 0o644)], true);
        let config = fixture.write_config();

        let output = gu_core()
            .arg("--config")
            .arg(&config)
            .args(["update", "--no-launch"])
            .assert()
            .code(1)
            .get_output()
            .stdout
            .clone();
        let result = result_of(&output);
        assert_eq!(result["outcome"]["reason"], "corruption");
        assert_eq!(fixture.read_installed("a.txt"), b"a1");
    }

    #[test]
    fn forced_restore_rolls_back_last_update() {
        let mut fixture = Fixture::new();
        fixture.install("a.txt", b"a1");
        fixture.publish("1.1.0", &[("a.txt", b"a2", 0o644)], false);
        let config = fixture.write_config();

        gu_core()
            .arg("--config")
            .arg(&config)
            .args(["update", "--no-launch"])
            .assert()
            .success();
        assert_eq!(fixture.read_installed("a.txt"), b"a2");

        let output = gu_core()
            .arg("--config")
            .arg(&config)
            .args(["restore", "--force"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        assert_eq!(result_of(&output)["outcome"], "restored");
        assert_eq!(fixture.read_installed("a.txt"), b"a1");

        // Nothing left to do: idle, still success.
        let output = gu_core()
            .arg("--config")
            .arg(&config)
            .arg("restore")
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        assert_eq!(result_of(&output)["outcome"], "idle");
    }

    #[test]
    fn agent_once_with_no_targets_is_clean() {
        let fixture = Fixture::new();
        let config = fixture.write_config();
        gu_core()
            .arg("--config")
            .arg(&config)
            .args(["agent", "--once"])
            .assert()
            .success();
    }
}
