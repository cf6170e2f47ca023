// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError, Result,
    output::{OutputContext, OutputOpts, StderrStyles},
    worker::{WORKER_SUBCOMMAND, WorkerOpts},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use disttrial_runner::{
    TestCaseRef,
    config::{DistTrialConfig, DistTrialProfile, Jobs},
    pool::{ProcessWorkerPool, WorkerProgram},
    reporter::SummaryReporter,
    runner::DistTrialRunnerBuilder,
};
use owo_colors::OwoColorize;
use std::io;

/// Runs test cases in parallel across a pool of local worker processes.
///
/// Each test case is a command line. A case passes if its command exits with 0, is skipped if it
/// exits with 77, and fails otherwise. Cases prefixed with `todo:` are expected to fail.
#[derive(Debug, Parser)]
#[command(
    version,
    bin_name = "disttrial",
    styles = crate::output::clap_styles::style(),
    max_term_width = 100,
)]
pub struct DistTrialApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(subcommand)]
    command: Command,
}

impl DistTrialApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        match &self.command {
            Command::Run(_) => self.output.init(),
            // Worker stderr is a log file, so it never gets colors.
            Command::Worker(_) => OutputContext::worker_init(self.output.verbose),
        }
    }

    /// Executes the app.
    ///
    /// Returns the exit code.
    pub fn exec(self, output: OutputContext) -> Result<i32> {
        match self.command {
            Command::Run(opts) => opts.exec(output),
            Command::Worker(opts) => opts.exec(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run test cases
    Run(RunOpts),
    /// Private command, used as the entry point of worker processes.
    #[command(name = WORKER_SUBCOMMAND, hide = true)]
    Worker(WorkerOpts),
}

#[derive(Debug, Args)]
struct ConfigOpts {
    /// Config file [default: .config/disttrial.toml]
    #[arg(long, global = true, value_name = "PATH", env = "DISTTRIAL_CONFIG_FILE")]
    config_file: Option<Utf8PathBuf>,

    /// Config profile to use
    #[arg(
        long,
        short = 'P',
        global = true,
        value_name = "PROFILE",
        env = "DISTTRIAL_PROFILE"
    )]
    profile: Option<String>,
}

impl ConfigOpts {
    fn make_config(&self, root: &Utf8Path, styles: &StderrStyles) -> Result<DistTrialConfig> {
        let config = DistTrialConfig::from_sources(root, self.config_file.as_deref())?;
        let unknown_keys = config.unknown_keys();
        if !unknown_keys.is_empty() {
            let keys = unknown_keys
                .iter()
                .map(|key| key.style(styles.bold).to_string())
                .collect::<Vec<_>>()
                .join(", ");
            tracing::warn!(
                "ignoring unknown configuration keys in `{}`: {}",
                config.config_file(),
                keys.style(styles.warning_text),
            );
        }
        Ok(config)
    }

    fn profile_name(&self) -> &str {
        self.profile
            .as_deref()
            .unwrap_or(DistTrialConfig::DEFAULT_PROFILE)
    }
}

#[derive(Debug, Args)]
#[command(next_help_heading = "Runner options")]
struct RunnerOpts {
    /// Number of workers to start [default: from profile]
    ///
    /// A positive integer, a negative integer (subtracted from the number of logical CPUs), or
    /// `num-cpus`.
    #[arg(
        long,
        short = 'j',
        allow_hyphen_values = true,
        value_name = "WORKERS",
        env = "DISTTRIAL_JOBS"
    )]
    jobs: Option<Jobs>,

    /// Base working directory [default: from profile]
    #[arg(long, value_name = "PATH", env = "DISTTRIAL_WORKING_DIRECTORY")]
    working_directory: Option<Utf8PathBuf>,

    /// Combined test log, relative to the working directory [default: from profile]
    #[arg(long, value_name = "PATH", env = "DISTTRIAL_LOG_FILE")]
    log_file: Option<Utf8PathBuf>,

    /// Stop handing out tests after the first failure or error
    #[arg(long, short = 'x', env = "DISTTRIAL_EXIT_FIRST")]
    exit_first: bool,

    /// Repeat the suite until a pass fails
    #[arg(long, short = 'u', env = "DISTTRIAL_UNTIL_FAILURE")]
    until_failure: bool,

    /// Argument passed to every worker; can be repeated [default: from profile]
    ///
    /// Worker arguments form a wrapper that every test command is run under.
    #[arg(long = "worker-arg", allow_hyphen_values = true, value_name = "ARG")]
    worker_args: Vec<String>,
}

impl RunnerOpts {
    fn to_builder(&self, profile: &DistTrialProfile<'_>) -> DistTrialRunnerBuilder {
        let mut builder = DistTrialRunnerBuilder::default();
        builder
            .set_max_workers(self.jobs.unwrap_or_else(|| profile.jobs()).compute())
            .set_working_directory(
                self.working_directory
                    .as_deref()
                    .unwrap_or_else(|| profile.working_directory()),
            )
            .set_log_file(
                self.log_file
                    .as_deref()
                    .unwrap_or_else(|| profile.log_file()),
            )
            .set_exit_first(self.exit_first || profile.exit_first())
            .set_until_failure(self.until_failure || profile.until_failure());

        let worker_args = if self.worker_args.is_empty() {
            profile.worker_args().to_vec()
        } else {
            self.worker_args.clone()
        };
        builder.set_worker_arguments(worker_args);
        builder
    }
}

#[derive(Debug, Args)]
struct RunOpts {
    #[clap(flatten)]
    config_opts: ConfigOpts,

    #[clap(flatten)]
    runner_opts: RunnerOpts,

    /// Test cases to run, each a command line
    #[arg(value_name = "TEST_CASES")]
    cases: Vec<String>,
}

impl RunOpts {
    fn exec(self, output: OutputContext) -> Result<i32> {
        let styles = output.stderr_styles();
        let cwd = current_dir()?;
        let config = self.config_opts.make_config(&cwd, &styles)?;
        let profile = config.profile(self.config_opts.profile_name())?;

        let builder = self.runner_opts.to_builder(&profile);
        let runner = builder.build(worker_program(output)?)?;

        let cases: Vec<_> = self.cases.into_iter().map(TestCaseRef::from).collect();
        let colorize = output.color.should_colorize(supports_color::Stream::Stdout);
        let reporter = runner.run(
            &cases,
            ProcessWorkerPool::new,
            || {
                let mut reporter = SummaryReporter::new(io::stdout());
                if colorize {
                    reporter.colorize();
                }
                reporter
            },
            &mut io::stdout(),
        )?;

        if reporter.stats().is_success() {
            Ok(0)
        } else {
            Err(ExpectedError::test_run_failed())
        }
    }
}

fn current_dir() -> Result<Utf8PathBuf> {
    let cwd = std::env::current_dir().map_err(|err| ExpectedError::GetCurrentDirFailed { err })?;
    Utf8PathBuf::try_from(cwd).map_err(|err| ExpectedError::CurrentDirInvalidUtf8 {
        path: err.into_path_buf(),
    })
}

/// Workers are this same binary, started with the private worker subcommand.
fn worker_program(output: OutputContext) -> Result<WorkerProgram> {
    let exe = std::env::current_exe().map_err(|err| ExpectedError::GetCurrentExeFailed { err })?;
    let exe = Utf8PathBuf::try_from(exe).map_err(|err| ExpectedError::CurrentExeInvalidUtf8 {
        path: err.into_path_buf(),
    })?;

    let mut program = WorkerProgram::new(exe).arg(WORKER_SUBCOMMAND);
    if output.verbose {
        program = program.arg("--verbose");
    }
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn app_is_well_formed() {
        DistTrialApp::command().debug_assert();
    }

    #[test]
    fn run_options_parse() {
        let app = DistTrialApp::try_parse_from([
            "disttrial",
            "run",
            "-j",
            "-1",
            "--exit-first",
            "--worker-arg",
            "nice",
            "--worker-arg=-n5",
            "-P",
            "ci",
            "true",
            "sh -c 'exit 1'",
        ])
        .expect("arguments are valid");

        let Command::Run(opts) = app.command else {
            panic!("expected the run command");
        };
        assert_eq!(
            opts.runner_opts.jobs,
            Some("-1".parse::<Jobs>().expect("-1 is valid"))
        );
        assert!(opts.runner_opts.exit_first);
        assert!(!opts.runner_opts.until_failure);
        assert_eq!(opts.runner_opts.worker_args, vec!["nice", "-n5"]);
        assert_eq!(opts.config_opts.profile_name(), "ci");
        assert_eq!(opts.cases, vec!["true", "sh -c 'exit 1'"]);
    }

    #[test]
    fn worker_command_takes_trailing_arguments() {
        let app = DistTrialApp::try_parse_from([
            "disttrial",
            WORKER_SUBCOMMAND,
            "--verbose",
            "nice",
            "-n5",
        ])
        .expect("arguments are valid");

        assert!(app.output.verbose);
        let Command::Worker(opts) = app.command else {
            panic!("expected the worker command");
        };
        assert_eq!(opts.wrapper(), ["nice", "-n5"]);
    }

    #[test]
    fn cli_overrides_profile() {
        let config = DistTrialConfig::from_sources(Utf8Path::new("/nonexistent"), None)
            .expect("default config is valid");
        let profile = config
            .profile(DistTrialConfig::DEFAULT_PROFILE)
            .expect("default profile exists");

        let app = DistTrialApp::try_parse_from([
            "disttrial",
            "run",
            "--working-directory",
            "scratch",
            "--until-failure",
        ])
        .expect("arguments are valid");
        let Command::Run(opts) = app.command else {
            panic!("expected the run command");
        };
        let runner = opts
            .runner_opts
            .to_builder(&profile)
            .build(WorkerProgram::new("/bin/true"))
            .expect("runner builds");
        let pool = runner.pool_config(3);
        assert_eq!(pool.working_directory, "scratch");
        assert_eq!(pool.log_file, "test.log");
        assert!(pool.worker_arguments.is_empty());
    }
}
