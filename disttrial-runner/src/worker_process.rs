// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A spawned worker process paired with its control connection.
//!
//! Workers talk to the coordinator over a dedicated pair of pipes: the worker reads commands from
//! fd 3 and writes commands to fd 4. The worker's own stdout and stderr go straight to
//! `out.log` and `err.log` in its directory, so output from the tests it runs never mixes with
//! protocol traffic.

use crate::{
    TestCaseRef,
    connection::{RunResult, Worker, WorkerConnection, finish_run},
    errors::{WorkerError, WorkerExitError, WorkerSpawnError},
    helpers::dylib_path_envvar,
    pool::WorkerProgram,
    reporter::ResultSink,
    test_log::TestLog,
};
use camino::{Utf8Path, Utf8PathBuf};
use std::{fs::File, process::Stdio};
use tokio::process::Child;
use tracing::{debug, warn};

/// The file descriptor a worker reads commands from.
pub const WORKER_READ_FD: i32 = 3;

/// The file descriptor a worker writes commands to.
pub const WORKER_WRITE_FD: i32 = 4;

/// An environment variable copied verbatim from the coordinator to each worker.
pub const WORKER_PATH_ENV: &str = "DISTTRIAL_PATH";

type ProcessConnection = WorkerConnection<imp::ControlReader, imp::ControlWriter>;

/// One worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    index: usize,
    directory: Utf8PathBuf,
    state: ProcessState,
}

#[derive(Debug)]
enum ProcessState {
    Running {
        child: Child,
        connection: ProcessConnection,
    },
    Exited,
}

impl WorkerProcess {
    /// Spawns worker `index` with its directory under `working_directory`.
    ///
    /// The worker's directory and its log files are created first. The worker is not told about
    /// its directory until [`Self::start`] is called.
    pub fn spawn(
        index: usize,
        working_directory: &Utf8Path,
        program: &WorkerProgram,
        worker_arguments: &[String],
        test_log: TestLog,
    ) -> Result<Self, WorkerSpawnError> {
        let directory = working_directory.join(index.to_string());
        std::fs::create_dir_all(&directory).map_err(|error| {
            WorkerSpawnError::CreateDirectory {
                path: directory.clone(),
                error,
            }
        })?;
        let out_log = create_log(&directory.join("out.log"))?;
        let err_log = create_log(&directory.join("err.log"))?;

        let (child, pipes) = {
            let mut cmd = std::process::Command::new(program.program());
            cmd.args(program.args())
                .args(worker_arguments)
                .stdin(Stdio::null())
                .stdout(Stdio::from(out_log))
                .stderr(Stdio::from(err_log));
            for var in [dylib_path_envvar(), WORKER_PATH_ENV] {
                if let Some(value) = std::env::var_os(var) {
                    cmd.env(var, value);
                }
            }
            let pipes = imp::configure_control_pipes(&mut cmd)
                .map_err(WorkerSpawnError::CreatePipes)?;

            let mut cmd = tokio::process::Command::from(cmd);
            cmd.kill_on_drop(true);
            let child = cmd.spawn().map_err(|error| WorkerSpawnError::Spawn {
                program: program.program().to_owned(),
                error,
            })?;
            // The command holds the log files and is dropped here, along with the
            // parent's copies of the child's pipe ends below.
            (child, pipes)
        };
        let (reader, writer) = pipes.into_parent_ends();

        debug!(
            worker = index,
            pid = child.id(),
            directory = %directory,
            "spawned worker"
        );
        Ok(Self {
            index,
            directory,
            state: ProcessState::Running {
                child,
                connection: WorkerConnection::new(index, reader, writer, test_log),
            },
        })
    }

    /// Returns the index of the worker within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the worker's own directory.
    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }

    /// Returns true until [`Self::exit`] has been called.
    pub fn is_running(&self) -> bool {
        matches!(self.state, ProcessState::Running { .. })
    }

    /// Tells the worker to change into its directory.
    ///
    /// Errors are logged rather than returned: a worker that fails to start will fail every test
    /// it is given, which surfaces the problem in the report.
    pub async fn start(&mut self) {
        let ProcessState::Running { connection, .. } = &mut self.state else {
            warn!(worker = self.index, "cannot start a worker that is not running");
            return;
        };
        match connection.start(&self.directory).await {
            Ok(true) => {}
            Ok(false) => warn!(worker = self.index, "worker refused to start"),
            Err(error) => warn!(worker = self.index, "failed to start worker: {error}"),
        }
    }

    /// Closes the control connection and waits for the worker to exit.
    ///
    /// Fails with [`WorkerExitError::NotRunning`] if the worker has already exited. A worker that
    /// exits with a non-zero status is reported as [`WorkerExitError::Status`].
    pub async fn exit(&mut self) -> Result<(), WorkerExitError> {
        let ProcessState::Running {
            mut child,
            mut connection,
        } = std::mem::replace(&mut self.state, ProcessState::Exited)
        else {
            return Err(WorkerExitError::NotRunning { index: self.index });
        };

        connection.close().await;
        drop(connection);
        let status = child.wait().await.map_err(|error| WorkerExitError::Wait {
            index: self.index,
            error,
        })?;
        debug!(worker = self.index, %status, "worker exited");
        if status.success() {
            Ok(())
        } else {
            Err(WorkerExitError::Status {
                index: self.index,
                status,
            })
        }
    }
}

impl Worker for WorkerProcess {
    async fn run(
        &mut self,
        case: &TestCaseRef,
        sink: &dyn ResultSink,
    ) -> Result<RunResult, WorkerError> {
        match &mut self.state {
            ProcessState::Running { connection, .. } => connection.run(case, sink).await,
            ProcessState::Exited => {
                sink.start_test(case)?;
                finish_run(self.index, case, sink, Err(WorkerError::NotRunning))
            }
        }
    }
}

fn create_log(path: &Utf8Path) -> Result<File, WorkerSpawnError> {
    File::create(path).map_err(|error| WorkerSpawnError::CreateLog {
        path: path.to_owned(),
        error,
    })
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod imp {
            use super::{WORKER_READ_FD, WORKER_WRITE_FD};
            use std::{
                fs::File,
                io,
                os::{
                    fd::{AsRawFd, FromRawFd, OwnedFd},
                    unix::process::CommandExt,
                },
            };

            pub(super) type ControlReader = tokio::net::unix::pipe::Receiver;
            pub(super) type ControlWriter = tokio::net::unix::pipe::Sender;

            pub(super) struct ControlPipes {
                reader: ControlReader,
                writer: ControlWriter,
                // The child's ends, held open in the parent until the child is spawned.
                _child_ends: [OwnedFd; 2],
            }

            impl ControlPipes {
                pub(super) fn into_parent_ends(self) -> (ControlReader, ControlWriter) {
                    (self.reader, self.writer)
                }
            }

            /// Creates the control pipes and arranges for the child's ends to become fds 3 and 4
            /// in the child.
            pub(super) fn configure_control_pipes(
                cmd: &mut std::process::Command,
            ) -> io::Result<ControlPipes> {
                let (child_read, parent_write) = io::pipe()?;
                let (parent_read, child_write) = io::pipe()?;

                // Move the child's ends above the target fds so that the dup2 calls below can't
                // clobber one another.
                let child_read = dup_above(&OwnedFd::from(child_read))?;
                let child_write = dup_above(&OwnedFd::from(child_write))?;
                let read_fd = child_read.as_raw_fd();
                let write_fd = child_write.as_raw_fd();

                // SAFETY: dup2 is async-signal-safe. The new fds don't have FD_CLOEXEC set, so
                // they survive exec.
                unsafe {
                    cmd.pre_exec(move || {
                        if libc::dup2(read_fd, WORKER_READ_FD) == -1
                            || libc::dup2(write_fd, WORKER_WRITE_FD) == -1
                        {
                            return Err(io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }

                let reader = ControlReader::from_file(File::from(OwnedFd::from(parent_read)))?;
                let writer = ControlWriter::from_file(File::from(OwnedFd::from(parent_write)))?;
                Ok(ControlPipes {
                    reader,
                    writer,
                    _child_ends: [child_read, child_write],
                })
            }

            fn dup_above(fd: &OwnedFd) -> io::Result<OwnedFd> {
                // SAFETY: fcntl with F_DUPFD_CLOEXEC returns a new fd that we own, or -1.
                let new_fd = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 10) };
                if new_fd == -1 {
                    return Err(io::Error::last_os_error());
                }
                // SAFETY: new_fd was just returned by fcntl and is not owned elsewhere.
                Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
            }
        }
    } else {
        mod imp {
            use std::io;

            pub(super) type ControlReader = tokio::io::Empty;
            pub(super) type ControlWriter = tokio::io::Sink;

            pub(super) struct ControlPipes(());

            impl ControlPipes {
                pub(super) fn into_parent_ends(self) -> (ControlReader, ControlWriter) {
                    (tokio::io::empty(), tokio::io::sink())
                }
            }

            pub(super) fn configure_control_pipes(
                _cmd: &mut std::process::Command,
            ) -> io::Result<ControlPipes> {
                Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "worker control pipes are only supported on Unix",
                ))
            }
        }
    }
}
