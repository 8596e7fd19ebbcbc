//! Integration tests for kcache

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    const DIGEST_D: &str =
        "sha256:dddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddddd";

    fn kcache() -> Command {
        cargo_bin_cmd!("kcache")
    }

    /// A stub-mode config rooted in `dir`
    fn write_config(dir: &Path) -> PathBuf {
        let path = dir.join("config.toml");
        let content = format!(
            r#"[general]
audit_log = true

[node]
name = "node-a"

[storage]
cache_root = "{root}/caches"
usage_root = "{root}/usage"
state_dir = "{root}/state"

[gpu]
stub = true
"#,
            root = dir.display()
        );
        std::fs::write(&path, content).unwrap();
        path
    }

    /// kcache bound to the config in `dir`
    fn kcache_in(dir: &TempDir) -> Command {
        let config = write_config(dir.path());
        let mut cmd = kcache();
        cmd.env("KCACHE_CONFIG", config)
            .env("KCACHE_NODE_NAME", "node-a")
            .env_remove("RUST_LOG");
        cmd
    }

    #[test]
    fn help_displays() {
        kcache()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("extracts GPU kernel caches"));
    }

    #[test]
    fn version_displays() {
        kcache()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kcache"));
    }

    #[test]
    fn config_path_follows_flag() {
        let dir = TempDir::new().unwrap();
        let config = write_config(dir.path());
        kcache()
            .arg("-c")
            .arg(&config)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_prints_sections() {
        let dir = TempDir::new().unwrap();
        kcache_in(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[reconcile]"))
            .stdout(predicate::str::contains("stub = true"));
    }

    #[test]
    fn config_init_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        kcache_in(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Use --force to overwrite"));
    }

    #[test]
    fn completions_generate() {
        kcache()
            .args(["completions", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("kcache"));
    }

    #[test]
    fn invalid_digest_is_rejected() {
        let dir = TempDir::new().unwrap();
        kcache_in(&dir)
            .args(["declare", "apply", "yellowKernel", "repo/y:v1", "-d", "sha256:zz"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn declare_without_digest_waits_for_admission() {
        let dir = TempDir::new().unwrap();
        kcache_in(&dir)
            .args(["declare", "apply", "yellowKernel", "repo/y:v1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("nodes wait for admission"));

        kcache_in(&dir)
            .args(["declare", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("pending"));
    }

    #[test]
    fn agent_once_extracts_declared_cache() {
        let dir = TempDir::new().unwrap();
        kcache_in(&dir)
            .args(["declare", "apply", "yellowKernel", "repo/y:v1", "-d", DIGEST_D])
            .assert()
            .success();

        kcache_in(&dir)
            .args(["agent", "--once"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cluster caches settled on node-a"));

        kcache_in(&dir)
            .args(["status", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Extracted"))
            .stdout(predicate::str::contains("yellowKernel"));

        kcache_in(&dir)
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("yellowKernel"))
            .stdout(predicate::str::contains("cluster-scoped"));

        assert!(dir.path().join("state/audit.log").exists());
    }

    #[test]
    fn usage_add_show_delete() {
        let dir = TempDir::new().unwrap();
        kcache_in(&dir)
            .args(["usage", "add", "yellowKernel", DIGEST_D, "vol-1", "--size", "2048"])
            .assert()
            .success()
            .stdout(predicate::str::contains("vol-1 uses"))
            .stdout(predicate::str::contains("refs: 1"));

        kcache_in(&dir)
            .args(["usage", "show", "vol-1", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"refCount\": 1"));

        kcache_in(&dir)
            .args(["usage", "delete", "vol-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("refs: 0"));

        kcache_in(&dir)
            .args(["usage", "delete", "vol-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No usage record holds vol-1"));
    }

    #[test]
    fn reconcile_single_scope() {
        let dir = TempDir::new().unwrap();
        kcache_in(&dir)
            .args(["reconcile", "--scope", "namespaced"])
            .assert()
            .success()
            .stdout(predicate::str::contains("namespaced pass on node-a"));
    }
}
