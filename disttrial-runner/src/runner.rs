// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The coordinator: runs a list of test cases across a pool of workers.
//!
//! A run starts the pool once, then performs one or more passes over the cases. Every pass gets a
//! fresh reporter wrapped in a [`DistReporter`], and every worker pulls cases from a shared cursor
//! until the cases run out. The pool is joined exactly once, however the run ends.

use crate::{
    TestCaseRef,
    connection::{RunResult, Worker},
    errors::{RunnerError, TestRunnerBuildError, WorkerError},
    helpers::plural,
    pool::{StartedWorkerPool, WorkerAction, WorkerPool, WorkerPoolConfig, WorkerProgram},
    reporter::{DistReporter, Reporter, TestFailure},
};
use camino::Utf8PathBuf;
use std::{
    io::Write,
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// The working directory used if none is set.
pub const DEFAULT_WORKING_DIRECTORY: &str = "_trial_temp";

/// The test log used if none is set, relative to the working directory.
pub const DEFAULT_LOG_FILE: &str = "test.log";

/// Options for a [`DistTrialRunner`].
#[derive(Clone, Debug, Default)]
pub struct DistTrialRunnerBuilder {
    max_workers: Option<NonZeroUsize>,
    working_directory: Option<Utf8PathBuf>,
    log_file: Option<Utf8PathBuf>,
    worker_arguments: Vec<String>,
    exit_first: bool,
    until_failure: bool,
}

impl DistTrialRunnerBuilder {
    /// Sets the maximum number of workers. Defaults to the available parallelism.
    pub fn set_max_workers(&mut self, max_workers: NonZeroUsize) -> &mut Self {
        self.max_workers = Some(max_workers);
        self
    }

    /// Sets the base working directory. Defaults to [`DEFAULT_WORKING_DIRECTORY`].
    pub fn set_working_directory(&mut self, working_directory: impl Into<Utf8PathBuf>) -> &mut Self {
        self.working_directory = Some(working_directory.into());
        self
    }

    /// Sets the test log. Defaults to [`DEFAULT_LOG_FILE`].
    pub fn set_log_file(&mut self, log_file: impl Into<Utf8PathBuf>) -> &mut Self {
        self.log_file = Some(log_file.into());
        self
    }

    /// Sets extra arguments passed to every worker.
    pub fn set_worker_arguments(&mut self, worker_arguments: Vec<String>) -> &mut Self {
        self.worker_arguments = worker_arguments;
        self
    }

    /// Stops handing out cases once any test fails or errors.
    pub fn set_exit_first(&mut self, exit_first: bool) -> &mut Self {
        self.exit_first = exit_first;
        self
    }

    /// Repeats passes over the cases until one is unsuccessful.
    pub fn set_until_failure(&mut self, until_failure: bool) -> &mut Self {
        self.until_failure = until_failure;
        self
    }

    /// Creates a new runner that spawns `worker_program` for each worker.
    pub fn build(self, worker_program: WorkerProgram) -> Result<DistTrialRunner, TestRunnerBuildError> {
        let max_workers = self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
        });
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("disttrial-runner")
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;

        Ok(DistTrialRunner {
            max_workers,
            working_directory: self
                .working_directory
                .unwrap_or_else(|| DEFAULT_WORKING_DIRECTORY.into()),
            log_file: self.log_file.unwrap_or_else(|| DEFAULT_LOG_FILE.into()),
            worker_program,
            worker_arguments: self.worker_arguments,
            exit_first: self.exit_first,
            until_failure: self.until_failure,
            runtime,
        })
    }
}

/// Runs test cases across a pool of workers.
///
/// Created using [`DistTrialRunnerBuilder::build`].
#[derive(Debug)]
pub struct DistTrialRunner {
    max_workers: NonZeroUsize,
    working_directory: Utf8PathBuf,
    log_file: Utf8PathBuf,
    worker_program: WorkerProgram,
    worker_arguments: Vec<String>,
    exit_first: bool,
    until_failure: bool,
    runtime: Runtime,
}

impl DistTrialRunner {
    /// Returns the pool configuration for a run over `num_cases` cases.
    ///
    /// The pool never has more workers than cases, and always has at least one.
    pub fn pool_config(&self, num_cases: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            num_workers: num_cases.clamp(1, self.max_workers.get()),
            working_directory: self.working_directory.clone(),
            worker_program: self.worker_program.clone(),
            worker_arguments: self.worker_arguments.clone(),
            log_file: self.log_file.clone(),
        }
    }

    /// Runs `cases`, blocking until the run completes.
    ///
    /// `pool_factory` creates the pool from its configuration, and `reporter_factory` creates a
    /// reporter for every pass. Progress lines are written to `stream`. Returns the reporter of
    /// the last pass.
    pub fn run<P, R>(
        &self,
        cases: &[TestCaseRef],
        pool_factory: impl FnOnce(WorkerPoolConfig) -> P,
        reporter_factory: impl FnMut() -> R,
        stream: &mut dyn Write,
    ) -> Result<R, RunnerError>
    where
        P: WorkerPool,
        R: Reporter,
    {
        self.runtime
            .block_on(self.run_async(cases, pool_factory, reporter_factory, stream))
    }

    /// The async form of [`Self::run`].
    pub async fn run_async<P, R>(
        &self,
        cases: &[TestCaseRef],
        pool_factory: impl FnOnce(WorkerPoolConfig) -> P,
        mut reporter_factory: impl FnMut() -> R,
        stream: &mut dyn Write,
    ) -> Result<R, RunnerError>
    where
        P: WorkerPool,
        R: Reporter,
    {
        let config = self.pool_config(cases.len());
        info!(
            "running {} {} with {} {}",
            cases.len(),
            plural::tests_str(cases.len()),
            config.num_workers,
            plural::workers_str(config.num_workers),
        );
        let mut pool = pool_factory(config).start().await?;
        let result = self
            .run_passes(cases, &mut pool, &mut reporter_factory, stream)
            .await;
        pool.join().await;
        result
    }

    async fn run_passes<S, R>(
        &self,
        cases: &[TestCaseRef],
        pool: &mut S,
        reporter_factory: &mut impl FnMut() -> R,
        stream: &mut dyn Write,
    ) -> Result<R, RunnerError>
    where
        S: StartedWorkerPool,
        R: Reporter,
    {
        let mut pass = 1_usize;
        loop {
            if self.until_failure {
                writeln!(stream, "Test Pass {pass}").map_err(RunnerError::WriteProgress)?;
            }
            writeln!(
                stream,
                "Running {} {}.",
                cases.len(),
                plural::tests_str(cases.len())
            )
            .and_then(|()| stream.flush())
            .map_err(RunnerError::WriteProgress)?;

            let reporter = DistReporter::new(reporter_factory());
            self.run_pass(cases, pool, &reporter).await;
            let mut reporter = reporter.into_inner();
            reporter.done().map_err(RunnerError::WriteResults)?;

            if !self.until_failure || cases.is_empty() || !reporter.was_successful() {
                return Ok(reporter);
            }
            debug!(pass, "pass succeeded, starting another");
            pass += 1;
        }
    }

    async fn run_pass<S, R>(&self, cases: &[TestCaseRef], pool: &mut S, reporter: &DistReporter<R>)
    where
        S: StartedWorkerPool,
        R: Reporter,
    {
        let cursor = CaseCursor::new(cases, self.exit_first);
        let action = DriveWorker {
            cursor: &cursor,
            reporter,
        };
        if let Err(error) = pool.run(&action).await {
            warn!("worker pool failed: {error}");
            reporter.add_runner_error(
                &TestCaseRef::runner(),
                TestFailure::from_error(error.kind_name(), &error),
            );
        }

        let remaining = cursor.remaining();
        if remaining > 0 && !cursor.stopped(reporter) {
            reporter.add_runner_error(
                &TestCaseRef::runner(),
                TestFailure::new(
                    "WorkersExhausted",
                    format!(
                        "{remaining} {} not run because no worker was left to run them",
                        if remaining == 1 { "test was" } else { "tests were" },
                    ),
                ),
            );
        }
    }
}

/// Hands out each case exactly once, in order, to whichever worker asks first.
#[derive(Debug)]
struct CaseCursor<'a> {
    cases: &'a [TestCaseRef],
    next: AtomicUsize,
    exit_first: bool,
}

impl<'a> CaseCursor<'a> {
    fn new(cases: &'a [TestCaseRef], exit_first: bool) -> Self {
        Self {
            cases,
            next: AtomicUsize::new(0),
            exit_first,
        }
    }

    fn next<R: Reporter>(&self, reporter: &DistReporter<R>) -> Option<&'a TestCaseRef> {
        if self.stopped(reporter) {
            return None;
        }
        self.cases.get(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn stopped<R: Reporter>(&self, reporter: &DistReporter<R>) -> bool {
        self.exit_first && !reporter.was_successful()
    }

    fn remaining(&self) -> usize {
        self.cases
            .len()
            .saturating_sub(self.next.load(Ordering::Relaxed))
    }
}

/// Runs cases on one worker until the cursor runs dry or the worker breaks.
struct DriveWorker<'a, R> {
    cursor: &'a CaseCursor<'a>,
    reporter: &'a DistReporter<R>,
}

impl<W: Worker, R: Reporter> WorkerAction<W> for DriveWorker<'_, R> {
    async fn apply(&self, index: usize, worker: &mut W) -> Result<(), WorkerError> {
        while let Some(case) = self.cursor.next(self.reporter) {
            // The worker records its own failures on the case before stopping it.
            match worker.run(case, self.reporter).await {
                Ok(RunResult { success: true }) => {}
                Ok(RunResult { success: false }) => {
                    warn!(worker = index, test_case = %case, "worker failed to report results");
                }
                Err(WorkerError::Reporter(error)) => {
                    warn!(worker = index, test_case = %case, "reporter rejected test: {error}");
                    self.reporter
                        .add_runner_error(case, TestFailure::from_error("ReporterError", &error));
                }
                Err(error) => {
                    warn!(worker = index, test_case = %case, "retiring worker: {error}");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}
