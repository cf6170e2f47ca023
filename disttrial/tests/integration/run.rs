// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use indoc::indoc;

const KILL_WORKER: &str = "sh -c 'kill -9 $PPID'";

#[test]
fn passing_suite() {
    let root = TempRoot::new();
    let output = DistTrialCli::new()
        .args([
            "-j",
            "2",
            "true",
            "sh -c 'echo hello'",
            "sh -c 'echo no network; exit 77'",
            "todo:false",
        ])
        .output(&root);

    assert!(output.stdout.contains("Running 4 tests."), "{output}");
    assert!(output.stdout.contains("true ... [OK]"), "{output}");
    assert!(
        output
            .stdout
            .contains("sh -c 'echo no network; exit 77' ... [SKIPPED]"),
        "{output}"
    );
    assert!(output.stdout.contains("todo:false ... [TODO]"), "{output}");
    assert!(output.stdout.contains("Ran 4 tests in "), "{output}");
    assert!(output.stdout.contains("PASSED ("), "{output}");

    let log = std::fs::read_to_string(root.working_dir().join("test.log")).unwrap();
    assert!(log.lines().any(|line| line == "hello"), "log: {log}");
    assert!(log.lines().any(|line| line == "no network"), "log: {log}");
}

#[test]
fn failures_are_reported_with_details() {
    let root = TempRoot::new();
    let output = DistTrialCli::new()
        .args(["true", "sh -c 'echo broken >&2; exit 2'"])
        .unchecked(true)
        .output(&root);

    assert_eq!(output.exit_code(), Some(TEST_RUN_FAILED), "{output}");
    assert!(
        output
            .stdout
            .contains("sh -c 'echo broken >&2; exit 2' ... [FAIL]"),
        "{output}"
    );
    assert!(output.stdout.contains("ExitStatus: broken"), "{output}");
    assert!(output.stdout.contains("FAILED (failures=1, successes=1)"), "{output}");
    assert!(output.stderr.contains("error: test run failed"), "{output}");
}

#[test]
fn crashed_worker_is_isolated() {
    let root = TempRoot::new();
    let output = DistTrialCli::new()
        .args([
            "-j",
            "2",
            KILL_WORKER,
            "true",
            "sh -c true",
            "sh -c 'exit 0'",
        ])
        .unchecked(true)
        .output(&root);

    assert_eq!(output.exit_code(), Some(TEST_RUN_FAILED), "{output}");
    assert!(
        output.stdout.contains(&format!("{KILL_WORKER} ... [ERROR]")),
        "{output}"
    );
    // The surviving worker runs everything else.
    for case in ["true", "sh -c true", "sh -c 'exit 0'"] {
        assert!(
            output.stdout.contains(&format!("{case} ... [OK]")),
            "{case} should pass: {output}"
        );
    }
    assert!(output.stdout.contains("WorkerConnectionLost"), "{output}");
    assert_eq!(
        output.stdout.matches(" ... [ERROR]").count(),
        1,
        "the crashed case is reported once: {output}"
    );
    assert!(output.stdout.contains("Ran 4 tests in "), "{output}");
    assert!(
        output.stdout.contains("FAILED (errors=1, successes=3)"),
        "{output}"
    );
}

#[test]
fn long_output_lines_do_not_fail_the_test() {
    let root = TempRoot::new();
    let long_line = r#"sh -c 'head -c 70000 /dev/zero | tr "\0" x; echo'"#;
    let long_skip = r#"sh -c 'head -c 70000 /dev/zero | tr "\0" y; echo; exit 77'"#;
    let output = DistTrialCli::new()
        .args(["-j", "1", long_line, long_skip])
        .output(&root);

    assert_eq!(output.exit_code(), Some(0), "{output}");
    assert!(output.stdout.contains(&format!("{long_line} ... [OK]")), "{output}");
    assert!(
        output.stdout.contains(&format!("{long_skip} ... [SKIPPED]")),
        "{output}"
    );
    assert!(output.stdout.contains("[truncated]"), "{output}");
    assert!(output.stdout.contains("Ran 2 tests in "), "{output}");
    assert!(output.stdout.contains("PASSED (skips=1, successes=1)"), "{output}");

    let log = std::fs::read_to_string(root.working_dir().join("test.log")).unwrap();
    let xs: usize = log
        .lines()
        .filter(|line| line.bytes().all(|b| b == b'x') && !line.is_empty())
        .map(str::len)
        .sum();
    assert_eq!(xs, 70000, "the whole line reaches the log");
}

#[test]
fn cases_left_without_workers_are_errors() {
    let root = TempRoot::new();
    let output = DistTrialCli::new()
        .args(["-j", "1", KILL_WORKER, "true"])
        .unchecked(true)
        .output(&root);

    assert_eq!(output.exit_code(), Some(TEST_RUN_FAILED), "{output}");
    assert!(
        output
            .stdout
            .contains("1 test was not run because no worker was left to run them"),
        "{output}"
    );
    assert!(!output.stdout.contains("true ... [OK]"), "{output}");
}

#[test]
fn exit_first_stops_handing_out_tests() {
    let root = TempRoot::new();
    let output = DistTrialCli::new()
        .args(["-j", "1", "--exit-first", "false", "true", "sh -c true"])
        .unchecked(true)
        .output(&root);

    assert_eq!(output.exit_code(), Some(TEST_RUN_FAILED), "{output}");
    assert!(output.stdout.contains("false ... [FAIL]"), "{output}");
    assert!(output.stdout.contains("Ran 1 test in "), "{output}");
    assert!(!output.stdout.contains("[OK]"), "{output}");
    assert!(!output.stdout.contains("not run because"), "{output}");
}

#[test]
fn until_failure_repeats_the_suite() {
    let root = TempRoot::new();
    let counter = root.path().join("count");
    // Passes twice, then fails.
    let case = format!(
        "sh -c 'n=$(cat {counter} 2>/dev/null || echo 0); n=$((n + 1)); echo $n > {counter}; test $n -lt 3'"
    );
    let output = DistTrialCli::new()
        .args(["--until-failure", case.as_str()])
        .unchecked(true)
        .output(&root);

    assert_eq!(output.exit_code(), Some(TEST_RUN_FAILED), "{output}");
    for pass in 1..=3 {
        assert!(
            output.stdout.contains(&format!("Test Pass {pass}\nRunning 1 test.\n")),
            "pass {pass}: {output}"
        );
    }
    assert!(!output.stdout.contains("Test Pass 4"), "{output}");
    assert_eq!(output.stdout.matches("PASSED").count(), 2, "{output}");
}

#[test]
fn worker_args_wrap_every_command() {
    let root = TempRoot::new();
    let output = DistTrialCli::new()
        .args([
            "--worker-arg",
            "sh",
            "--worker-arg=-c",
            "'echo wrapped'",
        ])
        .output(&root);

    assert!(output.stdout.contains("'echo wrapped' ... [OK]"), "{output}");
    let log = std::fs::read_to_string(root.working_dir().join("test.log")).unwrap();
    assert_eq!(log, "wrapped\n");
}

#[test]
fn profiles_come_from_the_config_file() {
    let root = TempRoot::new();
    root.write_config(indoc! {r#"
        bogus = 1

        [profile.default]
        log-file = "default.log"

        [profile.ci]
        jobs = 1
        exit-first = true
    "#});

    let output = DistTrialCli::new()
        .args(["-P", "ci", "false", "true"])
        .unchecked(true)
        .output(&root);

    assert_eq!(output.exit_code(), Some(TEST_RUN_FAILED), "{output}");
    assert!(output.stdout.contains("Ran 1 test in "), "{output}");
    assert!(
        output.stderr.contains("ignoring unknown configuration keys"),
        "{output}"
    );
    assert!(output.stderr.contains("bogus"), "{output}");
    // The ci profile inherits the log file from the default profile.
    assert!(root.working_dir().join("default.log").is_file());
}

#[test]
fn unknown_profile_is_a_config_error() {
    let root = TempRoot::new();
    let output = DistTrialCli::new()
        .args(["-P", "nope", "true"])
        .unchecked(true)
        .output(&root);

    assert_eq!(output.exit_code(), Some(INVALID_CONFIG), "{output}");
    assert!(output.stderr.contains("profile `nope` not found"), "{output}");
    assert!(!root.working_dir().exists());
}

#[test]
fn invalid_config_is_a_config_error() {
    let root = TempRoot::new();
    root.write_config(indoc! {r#"
        [profile.default]
        jobs = 0
    "#});

    let output = DistTrialCli::new().args(["true"]).unchecked(true).output(&root);
    assert_eq!(output.exit_code(), Some(INVALID_CONFIG), "{output}");
    assert!(
        output.stderr.contains("failed to parse disttrial config"),
        "{output}"
    );
}
