// Copyright © 2025 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::time::Duration;

use thiserror::Error;

/// Failure to deliver a command to a node or to collect its result.
///
/// A command that runs and exits non-zero is not a transport error; the
/// exit code comes back in [`CmdOutput`] for the caller to interpret.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("cannot connect to node")]
    Connection(#[source] std::io::Error),
    #[error("command execution failed")]
    Execution(#[source] std::io::Error),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport protocol error: {0}")]
    Protocol(String),
}

/// Captured result of one command run on a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub stdout: String,
    pub exit_code: i32,
}

impl CmdOutput {
    pub fn new(stdout: impl Into<String>, exit_code: i32) -> Self {
        CmdOutput {
            stdout: stdout.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stdout, for single-token outputs such as readlink targets.
    pub fn trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Per-command execution options.
#[derive(Clone, Debug, Default)]
pub struct ExecOpts {
    pub shell: bool,
    pub sudo: bool,
    pub timeout: Option<Duration>,
}

impl ExecOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shell(mut self) -> Self {
        self.shell = true;
        self
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One machine, local or remote, that can run shell commands.
///
/// Implementations decide how commands travel (SSH session, local child
/// process, a canned transcript in tests); the discovery code only ever
/// sees this trait.
pub trait NodeExecutor {
    /// Short node name used in log and error messages.
    fn name(&self) -> &str;

    /// Run `command` and capture stdout plus the exit code.
    fn run(&self, command: &str, opts: &ExecOpts) -> Result<CmdOutput, TransportError>;
}
