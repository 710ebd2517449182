//! Crucible: a crash-safe test execution core.
//!
//! Crucible runs each test case of a compiled suite tree in its own
//! child process, so a test that dereferences a null pointer, aborts,
//! or panics cannot take down the run: it is attributed as failed with
//! a diagnostic, its captured stdout/stderr are delivered intact, and
//! every subsequent test still executes and reports.
//!
//! # Architecture
//!
//! Execution flows through four layers, leaves first:
//! 1. **Pipe resource** ([`pipe`]): exclusively-owned OS pipes with
//!    explicit close and "install as fd N" operations.
//! 2. **Suite tree** ([`suite`]): an immutable, ordered tree of named
//!    test groups, built once by a compile transform that resolves
//!    attribute inheritance and assigns process-wide test ids.
//! 3. **Isolation engine** ([`runner::run_test`]): forks a child per
//!    test, splices its output slots onto capture pipes, and converts
//!    any termination mode into a uniform [`TestOutcome`].
//! 4. **Orchestrator** ([`runner::run_tests`]): depth-first walk that
//!    applies the skip policy and drives a caller-owned [`TestLogger`]
//!    through the run.
//!
//! Assertion libraries and suite-declaration sugar live outside this
//! crate: the core only needs a callable returning a [`TestOutcome`]
//! (or not returning at all) and a structured tree to walk.

pub mod attributes;
pub mod errors;
pub mod logger;
pub mod pipe;
pub mod runner;
pub mod suite;

pub use attributes::{Attribute, Attributes};
pub use errors::HarnessError;
pub use logger::{ConsoleLogger, TestLogger};
pub use pipe::ScopedPipe;
pub use runner::{run_test, run_tests, OutputCapture};
pub use suite::{test_fn, Suite, SuiteSpec, TestEntry, TestFunction, TestName, TestOutcome, TestSpec};
