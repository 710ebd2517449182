//! Run observers.
//!
//! The orchestrator reports a run through the [`TestLogger`] lifecycle
//! hooks; any type implementing them qualifies. The traversal performs
//! no aggregation of its own, so counting and summarizing live entirely
//! in the logger, and several independent backends can observe the same
//! compiled tree.
//!
//! [`ConsoleLogger`] is the bundled human-facing reporter: colored
//! PASS/FAIL/SKIP lines and an end-of-run summary.

use std::io::Write;

use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use crate::runner::OutputCapture;
use crate::suite::TestName;

/// Lifecycle hooks the orchestrator drives, in a strict order: one
/// `start_run`/`end_run` bracketing the walk, `start_suite`/`end_suite`
/// around each suite, and for every test a `start_test` followed by
/// exactly one of `passed_test`, `failed_test`, or `skipped_test`.
///
/// `path` is the ordered list of suite names from the root; `capture`
/// holds the just-completed test's stdout and stderr.
#[allow(unused_variables)]
pub trait TestLogger {
    fn start_run(&mut self) {}
    fn end_run(&mut self) {}

    fn start_suite(&mut self, path: &[String]) {}
    fn end_suite(&mut self, path: &[String]) {}

    fn start_test(&mut self, name: &TestName) {}
    fn passed_test(&mut self, name: &TestName, capture: &OutputCapture) {}
    fn failed_test(&mut self, name: &TestName, message: &str, capture: &OutputCapture) {}
    fn skipped_test(&mut self, name: &TestName) {}
}

/// A colored console reporter with pass/fail/skip counts and a failure
/// recap at the end of the run.
pub struct ConsoleLogger {
    stream: StandardStream,
    passed: usize,
    failed: usize,
    skipped: usize,
    failures: Vec<(String, String)>,
}

impl ConsoleLogger {
    pub fn new() -> Self {
        let choice = if atty::is(atty::Stream::Stdout) {
            ColorChoice::Auto
        } else {
            ColorChoice::Never
        };
        Self {
            stream: StandardStream::stdout(choice),
            passed: 0,
            failed: 0,
            skipped: 0,
            failures: Vec::new(),
        }
    }

    pub fn passed(&self) -> usize {
        self.passed
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Tests actually run: skipped tests are never run.
    pub fn tests_run(&self) -> usize {
        self.passed + self.failed
    }

    fn print_tag(&mut self, tag: &str, color: Color) {
        let _ = self
            .stream
            .set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true));
        let _ = write!(self.stream, "{}", tag);
        let _ = self.stream.reset();
    }
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl TestLogger for ConsoleLogger {
    fn passed_test(&mut self, name: &TestName, _capture: &OutputCapture) {
        self.passed += 1;
        self.print_tag("PASS", Color::Green);
        let _ = writeln!(self.stream, ": {}", name);
    }

    fn failed_test(&mut self, name: &TestName, message: &str, capture: &OutputCapture) {
        self.failed += 1;
        self.failures.push((name.to_string(), message.to_string()));
        self.print_tag("FAIL", Color::Red);
        let _ = writeln!(self.stream, ": {}", name);
        if !message.is_empty() {
            let _ = writeln!(self.stream, "  {}", message);
        }
        let stderr = capture.stderr_str();
        if !stderr.trim().is_empty() {
            let _ = writeln!(self.stream, "  stderr:");
            for line in stderr.lines() {
                let _ = writeln!(self.stream, "    {}", line);
            }
        }
    }

    fn skipped_test(&mut self, name: &TestName) {
        self.skipped += 1;
        self.print_tag("SKIP", Color::Yellow);
        let _ = writeln!(self.stream, ": {}", name);
    }

    fn end_run(&mut self) {
        let total = self.passed + self.failed + self.skipped;
        let _ = writeln!(
            self.stream,
            "\nTest summary: total {}, passed {}, failed {}, skipped {}",
            total, self.passed, self.failed, self.skipped
        );
        if !self.failures.is_empty() {
            let _ = writeln!(self.stream, "\nFailed tests:");
            for (name, message) in &self.failures {
                let _ = writeln!(self.stream, "  - {}: {}", name, message);
            }
        }
    }
}
