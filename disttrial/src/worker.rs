// Copyright (c) The disttrial Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{ExpectedError, Result};
use clap::Args;
use disttrial_runner::worker::{CommandExecutor, WorkerServer, control_pipes};

/// The name of the subcommand worker processes are started with.
pub(crate) const WORKER_SUBCOMMAND: &str = "__worker";

#[derive(Debug, Args)]
pub(crate) struct WorkerOpts {
    /// Program and arguments that every test command is run under.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    wrapper: Vec<String>,
}

impl WorkerOpts {
    #[cfg(test)]
    pub(crate) fn wrapper(&self) -> &[String] {
        &self.wrapper
    }

    /// Serves the control connection until the manager closes it.
    pub(crate) fn exec(self) -> Result<i32> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ExpectedError::WorkerRuntimeCreate { err })?;

        runtime.block_on(async move {
            let (reader, writer) =
                control_pipes().map_err(|err| ExpectedError::WorkerControlPipes { err })?;
            let mut executor = CommandExecutor::new().with_wrapper(self.wrapper);
            tracing::debug!(pid = std::process::id(), "worker ready");

            WorkerServer::new(reader, writer)
                .serve(&mut executor)
                .await
                .map_err(|err| ExpectedError::WorkerFailed { err })?;
            Ok(0)
        })
    }
}
