use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

fn charmguard(workdir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("charmguard").unwrap();
    cmd.current_dir(workdir.path())
        .env_remove("CHARM_TEST_ENVS")
        .env_remove("BUNDLE_TEST_ENVS")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_unsupported_url_prints_error_node() {
    let workdir = TempDir::new().unwrap();
    let output = charmguard(&workdir)
        .arg("foo:bar")
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();

    let result: Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(result["type"], "error");
    assert_eq!(result["result"], "fail");
    assert_eq!(result["error"], "Unsupported URL: foo:bar");
    assert!(result.get("tests").is_none());
}

#[test]
fn test_missing_config_is_an_error() {
    let workdir = TempDir::new().unwrap();
    charmguard(&workdir)
        .args(["--config", "nope.toml", "foo:bar"])
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("nope.toml"));
}

#[test]
fn test_deployment_flags_conflict() {
    let workdir = TempDir::new().unwrap();
    charmguard(&workdir)
        .args(["--deployment", "prod", "--all-deployments", "foo:bar"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[cfg(unix)]
mod local {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Writes a bundletester stand-in that reports one test with `code`.
    fn fake_suite(dir: &Path, code: i32) -> PathBuf {
        let path = dir.join("fake-bundletester");
        let script = format!(
            r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift ;;
  esac
  shift
done
echo '[{{"test": "charm-proof", "returncode": {code}, "suite": "meteor", "output": "'"$JUJU_ENV"'"}}]' > "$out"
exit {code}
"#
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn setup(code: i32) -> (TempDir, PathBuf) {
        let workdir = TempDir::new().unwrap();
        let charm = workdir.path().join("meteor");
        std::fs::create_dir(&charm).unwrap();
        std::fs::write(charm.join("metadata.yaml"), "name: meteor\n").unwrap();

        let program = fake_suite(workdir.path(), code);
        std::fs::write(
            workdir.path().join("charmguard.toml"),
            format!(
                "[environments]\ncharm = [\"local\", \"amazon\"]\n\n[suite]\nprogram = \"{}\"\n",
                program.display()
            ),
        )
        .unwrap();

        (workdir, charm)
    }

    #[test]
    fn test_local_charm_passes() {
        let (workdir, charm) = setup(0);
        let output = charmguard(&workdir)
            .arg("--shallow")
            .arg(format!("local:{}", charm.display()))
            .arg("5")
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        let result: Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(result["type"], "charm");
        assert_eq!(result["result"], "pass");
        assert_eq!(result["revision"], "5");
        assert_eq!(result["tests"]["charm"]["local"][0]["output"], "local");
        assert_eq!(result["tests"]["charm"]["amazon"][0]["output"], "amazon");
        assert_eq!(result["tests"]["bundle"], serde_json::json!({}));
    }

    #[test]
    fn test_local_charm_failure_sets_exit_code_and_output_file() {
        let (workdir, charm) = setup(1);
        let out = workdir.path().join("result.json");
        charmguard(&workdir)
            .args(["--shallow", "--output"])
            .arg(&out)
            .arg(format!("local:{}", charm.display()))
            .assert()
            .code(1)
            .stdout(predicate::str::is_empty());

        let result: Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(result["result"], "fail");
        assert_eq!(result["tests"]["charm"]["local"][0]["returncode"], 1);
    }

    #[test]
    fn test_env_var_overrides_configured_environments() {
        let (workdir, charm) = setup(0);
        let output = charmguard(&workdir)
            .env("CHARM_TEST_ENVS", "hp")
            .arg("--shallow")
            .arg(format!("local:{}", charm.display()))
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();

        let result: Value = serde_json::from_slice(&output).unwrap();
        let envs: Vec<_> = result["tests"]["charm"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(envs, vec!["hp"]);
    }
}
