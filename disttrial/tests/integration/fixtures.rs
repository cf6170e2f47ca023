// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use std::{
    fmt,
    process::{Command, ExitStatus},
};

pub const TEST_RUN_FAILED: i32 = 100;
pub const INVALID_CONFIG: i32 = 94;
pub const SETUP_ERROR: i32 = 96;

/// A scratch directory that runs are started from.
pub struct TempRoot {
    dir: Utf8TempDir,
}

impl TempRoot {
    pub fn new() -> Self {
        Self {
            dir: Utf8TempDir::with_prefix("disttrial-").expect("created temp dir"),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        self.dir.path()
    }

    /// The default working directory.
    pub fn working_dir(&self) -> Utf8PathBuf {
        self.path().join("_trial_temp")
    }

    pub fn write_config(&self, contents: &str) {
        let config_dir = self.path().join(".config");
        std::fs::create_dir_all(&config_dir).expect("created config dir");
        std::fs::write(config_dir.join("disttrial.toml"), contents).expect("wrote config");
    }
}

#[derive(Clone, Debug)]
pub struct DistTrialCli {
    bin: Utf8PathBuf,
    args: Vec<String>,
    unchecked: bool,
}

impl DistTrialCli {
    pub fn new() -> Self {
        Self {
            bin: env!("CARGO_BIN_EXE_disttrial").into(),
            args: vec!["run".to_owned()],
            unchecked: false,
        }
    }

    pub fn args(&mut self, args: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn unchecked(&mut self, unchecked: bool) -> &mut Self {
        self.unchecked = unchecked;
        self
    }

    pub fn output(&self, root: &TempRoot) -> DistTrialOutput {
        let mut command = Command::new(&self.bin);
        command
            .args(&self.args)
            .current_dir(root.path())
            .env("DISTTRIAL_COLOR", "never")
            .env_remove("DISTTRIAL_LOG")
            .env_remove("DISTTRIAL_JOBS")
            .env_remove("DISTTRIAL_PROFILE");
        let output = command.output().expect("failed to execute");

        let ret = DistTrialOutput {
            command,
            exit_status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !self.unchecked && !output.status.success() {
            panic!("command failed:\n\n{ret}");
        }

        ret
    }
}

pub struct DistTrialOutput {
    pub command: Command,
    pub exit_status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl DistTrialOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.code()
    }
}

impl fmt::Display for DistTrialOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "command: {:?}", self.command)?;
        writeln!(f, "exit status: {}", self.exit_status)?;
        writeln!(f, "--- stdout ---\n{}", self.stdout)?;
        writeln!(f, "--- stderr ---\n{}", self.stderr)
    }
}
