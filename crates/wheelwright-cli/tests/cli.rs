use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;

const STORAGE_VARS: &[&str] = &["SCW_ACCESS_KEY", "SCW_SECRET_KEY", "S3_BUCKET"];

fn json_stdout(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json envelope on stdout")
}

#[test]
fn help_lists_subcommands() {
    let assert = cargo_bin_cmd!("wheelwright").arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8 help");
    assert!(output.contains("build"), "help missing build: {output}");
    assert!(output.contains("key"), "help missing key: {output}");
}

#[test]
fn key_prints_project_slash_filename() {
    let assert = cargo_bin_cmd!("wheelwright")
        .args([
            "key",
            "--project",
            "dagon",
            "--filename",
            "dagon-0.9.9-py3-none-any.whl",
        ])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert_eq!(stdout.trim(), "dagon/dagon-0.9.9-py3-none-any.whl");
}

#[test]
fn key_json_envelope() {
    let assert = cargo_bin_cmd!("wheelwright")
        .args(["--json", "key", "--project", "dagon", "--filename", "w.whl"])
        .assert()
        .success();
    let payload = json_stdout(assert.get_output());
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["message"], "dagon/w.whl");
    assert_eq!(payload["details"]["storage_key"], "dagon/w.whl");
}

#[test]
fn unsafe_project_is_a_user_error() {
    let assert = cargo_bin_cmd!("wheelwright")
        .args([
            "--json",
            "build",
            "--project",
            "../etc",
            "--store-dir",
            "unused",
            "https://files.example/dagon-0.9.9.tar.gz",
        ])
        .assert()
        .code(1);
    let payload = json_stdout(assert.get_output());
    assert_eq!(payload["status"], "user_error");
    assert_eq!(payload["details"]["kind"], "invalid_request");
}

#[test]
fn missing_storage_configuration_fails_without_store_dir() {
    let mut cmd = cargo_bin_cmd!("wheelwright");
    for var in STORAGE_VARS {
        cmd.env_remove(var);
    }
    let assert = cmd
        .args([
            "--json",
            "build",
            "--project",
            "dagon",
            "https://files.example/dagon-0.9.9.tar.gz",
        ])
        .assert()
        .code(2);
    let payload = json_stdout(assert.get_output());
    assert_eq!(payload["status"], "failure");
    assert!(
        payload["message"]
            .as_str()
            .is_some_and(|message| message.contains("SCW_ACCESS_KEY")),
        "{payload}"
    );
}

#[cfg(unix)]
mod pipeline {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Stands in for `python -m pip wheel ... <archive>`: checks the archive
    /// argument, then runs `body` in the build directory.
    fn fake_python(dir: &Path, body: &str) -> PathBuf {
        let script = dir.join("python");
        fs::write(
            &script,
            format!("#!/bin/sh\nfor last; do :; done\ntest -f \"$last\" || exit 9\n{body}\n"),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn local_archive(dir: &Path) -> String {
        let archive = dir.join("dagon-0.9.9.tar.gz");
        fs::write(&archive, b"sdist").unwrap();
        format!("file://{}", archive.display())
    }

    #[test]
    fn build_publishes_into_store_dir() {
        let temp = tempfile::tempdir().unwrap();
        let python = fake_python(temp.path(), "printf wheel > dagon-0.9.9-py3-none-any.whl");
        let archive = local_archive(temp.path());
        let bucket = temp.path().join("bucket");
        let work = temp.path().join("work");

        let assert = cargo_bin_cmd!("wheelwright")
            .env("WHEELWRIGHT_PYTHON", &python)
            .env("WHEELWRIGHT_WORK_DIR", &work)
            .env_remove("ZIG_TOOLCHAIN")
            .args(["--json", "build", "--project", "dagon", "--filename"])
            .arg("dagon-0.9.9-py3-none-any.whl")
            .arg("--store-dir")
            .arg(&bucket)
            .arg(&archive)
            .assert()
            .success();

        let payload = json_stdout(assert.get_output());
        assert_eq!(payload["status"], "ok");
        assert_eq!(
            payload["message"],
            "Successfully built dagon-0.9.9-py3-none-any.whl"
        );
        assert_eq!(
            payload["details"]["storage_key"],
            "dagon/dagon-0.9.9-py3-none-any.whl"
        );
        let object = bucket.join("dagon").join("dagon-0.9.9-py3-none-any.whl");
        assert_eq!(fs::read(object).unwrap(), b"wheel");
        assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
    }

    #[test]
    fn failing_build_exits_with_pipeline_failure() {
        let temp = tempfile::tempdir().unwrap();
        let python = fake_python(temp.path(), "echo 'missing compiler' >&2\nexit 1");
        let archive = local_archive(temp.path());
        let bucket = temp.path().join("bucket");

        let assert = cargo_bin_cmd!("wheelwright")
            .env("WHEELWRIGHT_PYTHON", &python)
            .args(["--json", "build", "--project", "dagon", "--store-dir"])
            .arg(&bucket)
            .arg(&archive)
            .assert()
            .code(2);

        let payload = json_stdout(assert.get_output());
        assert_eq!(payload["status"], "failure");
        assert_eq!(payload["details"]["kind"], "build_failed");
        assert_eq!(payload["details"]["exit_code"], 1);
        assert!(payload["details"]["stderr"]
            .as_str()
            .is_some_and(|stderr| stderr.contains("missing compiler")));
        assert!(!bucket.exists());
    }
}
