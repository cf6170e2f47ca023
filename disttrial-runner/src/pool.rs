// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pools of worker processes.
//!
//! A [`WorkerPool`] is started once per run. Starting picks and locks a working directory,
//! opens the combined test log and spawns the workers. The [`StartedWorkerPool`] then applies
//! [`WorkerAction`]s to every worker concurrently, and is finally joined, which shuts the workers
//! down and releases the directory.

use crate::{
    connection::Worker,
    errors::{WorkerError, WorkerPoolStartError},
    helpers::plural,
    test_log::TestLog,
    worker_process::WorkerProcess,
};
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use futures::future::{join_all, try_join_all};
use std::{
    fs::{File, OpenOptions, TryLockError},
    future::Future,
};
use tracing::{debug, info, warn};

/// The file that marks a directory as created by disttrial, and therefore safe to remove.
pub const MARKER_FILE_NAME: &str = "_trial_marker";

/// The number of candidate working directories tried before giving up.
pub const MAX_DIRECTORY_PROBES: usize = 1024;

/// The program run for each worker, with its fixed arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerProgram {
    program: Utf8PathBuf,
    args: Vec<String>,
}

impl WorkerProgram {
    /// Creates a new worker program with no arguments.
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends a fixed argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Returns the program.
    pub fn program(&self) -> &Utf8Path {
        &self.program
    }

    /// Returns the fixed arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// Everything needed to start a pool.
#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    /// The number of workers to spawn.
    pub num_workers: usize,
    /// The preferred working directory. If it is in use, `-1`, `-2`, ... are appended.
    pub working_directory: Utf8PathBuf,
    /// The program each worker runs.
    pub worker_program: WorkerProgram,
    /// Extra arguments appended after the worker program's own arguments.
    pub worker_arguments: Vec<String>,
    /// The combined test log. Relative paths are resolved under the working directory.
    pub log_file: Utf8PathBuf,
}

/// A pool that has not been started yet.
pub trait WorkerPool {
    /// The started pool.
    type Started: StartedWorkerPool;

    /// Starts the pool.
    fn start(self) -> impl Future<Output = Result<Self::Started, WorkerPoolStartError>>;
}

/// Something to do with every worker in a pool.
pub trait WorkerAction<W> {
    /// Applies the action to worker `index`.
    fn apply(&self, index: usize, worker: &mut W) -> impl Future<Output = Result<(), WorkerError>>;
}

/// A pool whose workers are running.
pub trait StartedWorkerPool {
    /// The type of the pool's workers.
    type Worker: Worker;

    /// Applies `action` to every worker concurrently and waits for all of them.
    ///
    /// Fails with the first error returned by any application.
    fn run<A: WorkerAction<Self::Worker>>(
        &mut self,
        action: &A,
    ) -> impl Future<Output = Result<(), WorkerError>>;

    /// Shuts down every worker and releases the pool's resources.
    ///
    /// Failures are logged rather than returned.
    fn join(self) -> impl Future<Output = ()>;
}

/// A pool of worker processes.
#[derive(Clone, Debug)]
pub struct ProcessWorkerPool {
    config: WorkerPoolConfig,
}

impl ProcessWorkerPool {
    /// Creates a new pool.
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self { config }
    }
}

impl WorkerPool for ProcessWorkerPool {
    type Started = StartedProcessWorkerPool;

    async fn start(self) -> Result<StartedProcessWorkerPool, WorkerPoolStartError> {
        let config = self.config;
        let (working_directory, lock) = lock_working_directory(&config.working_directory)?;
        prepare_directory(&working_directory)?;

        let log_path = if config.log_file.is_absolute() {
            config.log_file.clone()
        } else {
            working_directory.join(&config.log_file)
        };
        let test_log =
            TestLog::open(&log_path).map_err(|error| WorkerPoolStartError::OpenTestLog {
                path: log_path.clone(),
                error,
            })?;

        let workers = (0..config.num_workers)
            .map(|index| {
                WorkerProcess::spawn(
                    index,
                    &working_directory,
                    &config.worker_program,
                    &config.worker_arguments,
                    test_log.clone(),
                )
                .map_err(|error| WorkerPoolStartError::SpawnWorker { index, error })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut pool = StartedProcessWorkerPool {
            working_directory,
            log_path,
            test_log,
            workers,
            lock,
        };
        join_all(pool.workers.iter_mut().map(|worker| worker.start())).await;
        info!(
            "started {} {} in {}",
            pool.workers.len(),
            plural::workers_str(pool.workers.len()),
            pool.working_directory,
        );
        Ok(pool)
    }
}

/// A started pool of worker processes.
#[derive(Debug)]
pub struct StartedProcessWorkerPool {
    working_directory: Utf8PathBuf,
    log_path: Utf8PathBuf,
    test_log: TestLog,
    workers: Vec<WorkerProcess>,
    lock: DirectoryLock,
}

impl StartedProcessWorkerPool {
    /// Returns the working directory the pool ended up with.
    pub fn working_directory(&self) -> &Utf8Path {
        &self.working_directory
    }

    /// Returns the path of the combined test log.
    pub fn log_path(&self) -> &Utf8Path {
        &self.log_path
    }

    /// Returns the pool's workers.
    pub fn workers(&self) -> &[WorkerProcess] {
        &self.workers
    }
}

impl StartedWorkerPool for StartedProcessWorkerPool {
    type Worker = WorkerProcess;

    async fn run<A: WorkerAction<WorkerProcess>>(&mut self, action: &A) -> Result<(), WorkerError> {
        try_join_all(
            self.workers
                .iter_mut()
                .enumerate()
                .map(|(index, worker)| action.apply(index, worker)),
        )
        .await?;
        Ok(())
    }

    async fn join(mut self) {
        let results = join_all(self.workers.iter_mut().map(|worker| worker.exit())).await;
        for error in results.into_iter().filter_map(Result::err) {
            warn!("{error}");
        }
        self.workers.clear();

        if let Err(error) = self.test_log.close() {
            warn!(path = %self.log_path, "failed to close test log: {error}");
        }
        self.lock.unlock();
        debug!(directory = %self.working_directory, "joined worker pool");
    }
}

/// An exclusive lock on a working directory, held through a sibling `<dir>.lock` file.
///
/// The lock is released when this is dropped.
#[derive(Debug)]
pub(crate) struct DirectoryLock {
    path: Utf8PathBuf,
    file: DebugIgnore<File>,
}

impl DirectoryLock {
    pub(crate) fn unlock(self) {
        if let Err(error) = self.file.unlock() {
            warn!(path = %self.path, "failed to unlock: {error}");
        }
    }
}

/// Picks the first of `base`, `base-1`, `base-2`, ... whose lock file can be locked.
///
/// Never blocks: a candidate locked by another process is skipped immediately.
pub(crate) fn lock_working_directory(
    base: &Utf8Path,
) -> Result<(Utf8PathBuf, DirectoryLock), WorkerPoolStartError> {
    let file_name = base
        .file_name()
        .ok_or_else(|| WorkerPoolStartError::InvalidWorkingDirectory {
            path: base.to_owned(),
        })?;
    let parent = base.parent().unwrap_or(Utf8Path::new(""));
    if !parent.as_str().is_empty() {
        std::fs::create_dir_all(parent).map_err(|error| WorkerPoolStartError::CreateDirectory {
            path: parent.to_owned(),
            error,
        })?;
    }

    for attempt in 0..MAX_DIRECTORY_PROBES {
        let name = if attempt == 0 {
            file_name.to_owned()
        } else {
            format!("{file_name}-{attempt}")
        };
        let lock_path = parent.join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|error| WorkerPoolStartError::Lock {
                path: lock_path.clone(),
                error,
            })?;

        match file.try_lock() {
            Ok(()) => {
                return Ok((
                    parent.join(&name),
                    DirectoryLock {
                        path: lock_path,
                        file: DebugIgnore(file),
                    },
                ));
            }
            Err(TryLockError::WouldBlock) => {
                debug!(directory = %parent.join(&name), "working directory in use, trying next");
            }
            Err(TryLockError::Error(error)) => {
                return Err(WorkerPoolStartError::Lock {
                    path: lock_path,
                    error,
                });
            }
        }
    }

    Err(WorkerPoolStartError::WorkingDirectoryBusy {
        base: base.to_owned(),
        attempts: MAX_DIRECTORY_PROBES,
    })
}

/// Removes a previous run's directory, then creates a fresh one with a marker file.
///
/// A directory without a marker was not created by disttrial and is never removed.
fn prepare_directory(directory: &Utf8Path) -> Result<(), WorkerPoolStartError> {
    let marker = directory.join(MARKER_FILE_NAME);
    if directory.symlink_metadata().is_ok() {
        if marker.symlink_metadata().is_err() {
            return Err(WorkerPoolStartError::UnmarkedWorkingDirectory {
                path: directory.to_owned(),
            });
        }
        std::fs::remove_dir_all(directory).map_err(|error| {
            WorkerPoolStartError::RemoveDirectory {
                path: directory.to_owned(),
                error,
            }
        })?;
    }

    std::fs::create_dir_all(directory).map_err(|error| WorkerPoolStartError::CreateDirectory {
        path: directory.to_owned(),
        error,
    })?;
    File::create(&marker).map_err(|error| WorkerPoolStartError::WriteMarker {
        path: marker,
        error,
    })?;
    Ok(())
}
