//! Harness-level error taxonomy.
//!
//! These errors are failures of the isolation machinery itself (pipe
//! allocation, fork, wait), never failures of a test under execution. A
//! test that fails an assertion or dies to a signal is reported through
//! [`crate::suite::TestOutcome`] and the run continues; a `HarnessError`
//! aborts the whole run and propagates to the caller.

use miette::Diagnostic;
use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum HarnessError {
    /// The OS could not allocate a pipe for test isolation.
    #[error("could not allocate a pipe for test isolation")]
    #[diagnostic(
        code(crucible::harness::resource),
        help("the process may have exhausted its file descriptor limit")
    )]
    Resource {
        #[source]
        source: Errno,
    },

    /// A pipe end was closed or installed twice, or used before being
    /// opened. Surfaced immediately rather than masked, since silent
    /// success would hide descriptor-accounting bugs.
    #[error("pipe end is not open")]
    #[diagnostic(code(crucible::harness::invalid_handle))]
    InvalidHandle,

    /// The isolated child process could not be created.
    #[error("could not fork an isolated test process")]
    #[diagnostic(code(crucible::harness::fork))]
    Fork {
        #[source]
        source: Errno,
    },

    /// Waiting on or draining the isolated child process failed.
    #[error("could not collect the isolated test process")]
    #[diagnostic(code(crucible::harness::wait))]
    Wait {
        #[source]
        source: Errno,
    },
}
