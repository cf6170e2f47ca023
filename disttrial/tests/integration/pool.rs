// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use std::fs::{File, OpenOptions};

fn open_lock(path: &camino::Utf8Path) -> File {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .unwrap()
}

#[test]
fn run_leaves_the_layout_and_releases_the_lock() {
    let root = TempRoot::new();
    DistTrialCli::new()
        .args(["--verbose", "-j", "2", "true", "sh -c true"])
        .output(&root);

    let wd = root.working_dir();
    assert!(wd.join("_trial_marker").is_file());
    for worker in ["0", "1"] {
        assert!(wd.join(worker).join("out.log").is_file(), "worker {worker}");
        let err_log = std::fs::read_to_string(wd.join(worker).join("err.log")).unwrap();
        assert!(err_log.contains("worker ready"), "worker {worker}: {err_log}");
    }
    assert!(!wd.join("2").exists());

    let lock = open_lock(&root.path().join("_trial_temp.lock"));
    lock.try_lock().expect("lock was released by the run");
}

#[test]
fn busy_working_directory_gets_a_suffix() {
    let root = TempRoot::new();
    let lock = open_lock(&root.path().join("_trial_temp.lock"));
    lock.try_lock().unwrap();

    DistTrialCli::new().args(["true"]).output(&root);

    assert!(!root.working_dir().exists());
    assert!(root.path().join("_trial_temp-1/test.log").is_file());
    drop(lock);
}

#[test]
fn marked_directory_is_replaced() {
    let root = TempRoot::new();
    DistTrialCli::new().args(["true"]).output(&root);
    let stale = root.working_dir().join("stale");
    std::fs::write(&stale, "").unwrap();

    DistTrialCli::new().args(["true"]).output(&root);
    assert!(!stale.exists());
    assert!(root.working_dir().join("_trial_marker").is_file());
}

#[test]
fn unmarked_directory_is_not_deleted() {
    let root = TempRoot::new();
    let precious = root.working_dir().join("precious");
    std::fs::create_dir_all(root.working_dir()).unwrap();
    std::fs::write(&precious, "keep me").unwrap();

    let output = DistTrialCli::new()
        .args(["true"])
        .unchecked(true)
        .output(&root);

    assert_eq!(output.exit_code(), Some(SETUP_ERROR), "{output}");
    assert_eq!(std::fs::read_to_string(&precious).unwrap(), "keep me");
}

#[test]
fn custom_working_directory_and_absolute_log_file() {
    let root = TempRoot::new();
    let log = root.path().join("combined.log");
    DistTrialCli::new()
        .args([
            "--working-directory",
            "scratch/run",
            "--log-file",
            log.as_str(),
            "sh -c 'echo to the log'",
        ])
        .output(&root);

    assert!(root.path().join("scratch/run/_trial_marker").is_file());
    assert!(!root.path().join("scratch/run/test.log").exists());
    assert_eq!(std::fs::read_to_string(&log).unwrap(), "to the log\n");
}
