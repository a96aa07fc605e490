//! Behavioural tests for `kiln build` using the in-memory driver.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn kiln() -> Command {
    let mut cmd = cargo_bin_cmd!("kiln");
    cmd.current_dir(std::env::temp_dir())
        .env("KILN_FAKE_DRIVER", "1")
        .env("SCW_SECRET_KEY", "secret")
        .env("SCW_DEFAULT_PROJECT_ID", "project")
        .env("KILN_COMMUNICATOR", "none")
        .env_remove("KILN_IMAGE_NAME")
        .env_remove("KILN_IMAGE_TAGS")
        .env_remove("KILN_CONFIG_PATH");
    cmd
}

#[test]
fn build_prints_artifact_and_succeeds() {
    kiln()
        .args(["build", "--name", "web-base", "--tag", "web"])
        .assert()
        .success()
        .stdout(predicate::str::contains("web-base (img-"));
}

#[test]
fn human_output_is_prefixed_with_the_image_name() {
    kiln()
        .args(["build", "--name", "web-base"])
        .assert()
        .success()
        .stdout(predicate::str::contains("==> web-base: Build finished: "));
}

#[test]
fn machine_readable_build_emits_artifact_event() {
    kiln()
        .args(["build", "--name", "web-base", "--machine-readable"])
        .assert()
        .success()
        .stdout(predicate::str::contains(",kiln,artifact,img-"));
}

#[test]
fn missing_image_name_is_reported() {
    kiln()
        .arg("build")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("KILN_IMAGE_NAME"));
}

#[test]
fn unknown_communicator_is_rejected() {
    kiln()
        .args(["build", "--name", "web-base", "--communicator", "winrm"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown communicator 'winrm'"));
}

#[test]
fn provisioning_without_connection_fails_the_build() {
    kiln()
        .args(["build", "--name", "web-base", "--", "apt-get", "update"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("build failed"));
}
