//! End-to-end tests for the isolation engine and the orchestrator:
//! crash containment, output capture, skip policy, logger ordering.

use std::io::{self, Write};
use std::time::Duration;

use crucible::{
    run_test, run_tests, test_fn, Attributes, OutputCapture, Suite, SuiteSpec, TestFunction,
    TestLogger, TestName, TestOutcome,
};

/// Writes to the real stdout descriptor. Direct `io::stdout()` writes
/// bypass libtest's thread-local capture, so they reach the capture
/// pipe installed by the isolation engine.
fn emit_stdout(text: &str) {
    let mut out = io::stdout();
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

fn emit_stderr(text: &str) {
    let mut err = io::stderr();
    let _ = err.write_all(text.as_bytes());
    let _ = err.flush();
}

fn passthrough(body: TestFunction) -> TestFunction {
    body
}

fn compile(spec: SuiteSpec<TestFunction>) -> Suite {
    Suite::compile(spec, &Attributes::new(), &passthrough)
}

#[derive(Default)]
struct CountingLogger {
    tests_run: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
    messages: Vec<String>,
}

impl TestLogger for CountingLogger {
    fn start_test(&mut self, _name: &TestName) {
        self.tests_run += 1;
    }

    fn passed_test(&mut self, _name: &TestName, _capture: &OutputCapture) {
        self.passed += 1;
    }

    fn failed_test(&mut self, _name: &TestName, message: &str, _capture: &OutputCapture) {
        self.failed += 1;
        self.messages.push(message.to_string());
    }

    fn skipped_test(&mut self, _name: &TestName) {
        self.skipped += 1;
    }
}

// ============================================================================
// run_test(): one isolated execution
// ============================================================================

#[test]
fn passing_test_yields_pass_with_empty_message() {
    let f = test_fn(TestOutcome::pass);
    let (outcome, _capture) = run_test(&f, None).unwrap();
    assert!(outcome.passed);
    assert_eq!(outcome.message, "");
}

#[test]
fn failing_test_carries_its_diagnostic_message() {
    let f = test_fn(|| TestOutcome::fail("expected 1, got 2"));
    let (outcome, _capture) = run_test(&f, None).unwrap();
    assert!(!outcome.passed);
    assert_eq!(outcome.message, "expected 1, got 2");
}

#[test]
fn aborting_test_is_reported_as_failed() {
    let f = test_fn(|| -> TestOutcome { std::process::abort() });
    let (outcome, _capture) = run_test(&f, None).unwrap();
    assert!(!outcome.passed);
    assert_eq!(outcome.message, "Aborted");
}

#[test]
fn segfaulting_test_is_reported_as_failed() {
    let f = test_fn(|| {
        // A real invalid access: `raise(SIGSEGV)` is swallowed by the
        // inherited Rust stack-overflow handler and would not kill the child.
        unsafe { std::ptr::null_mut::<u8>().write_volatile(1) };
        TestOutcome::pass()
    });
    let (outcome, _capture) = run_test(&f, None).unwrap();
    assert!(!outcome.passed);
    assert_eq!(outcome.message, "Segmentation fault");
}

#[test]
fn panicking_test_is_a_logical_failure_with_the_panic_text() {
    let f = test_fn(|| panic!("fixture exploded"));
    let (outcome, _capture) = run_test(&f, None).unwrap();
    assert!(!outcome.passed);
    assert!(
        outcome.message.contains("fixture exploded"),
        "message was: {}",
        outcome.message
    );
}

#[test]
fn stdout_is_captured_and_stderr_stays_empty() {
    let f = test_fn(|| {
        emit_stdout("stdout");
        TestOutcome::pass()
    });
    let (outcome, capture) = run_test(&f, None).unwrap();
    assert!(outcome.passed);
    assert_eq!(capture.stdout_str(), "stdout");
    assert_eq!(capture.stderr_str(), "");
}

#[test]
fn both_streams_are_captured_independently() {
    let f = test_fn(|| {
        emit_stdout("stdout");
        emit_stderr("stderr");
        TestOutcome::pass()
    });
    let (_outcome, capture) = run_test(&f, None).unwrap();
    assert_eq!(capture.stdout_str(), "stdout");
    assert_eq!(capture.stderr_str(), "stderr");
}

#[test]
fn output_larger_than_the_pipe_buffer_does_not_deadlock() {
    // Well past the default 64 KiB pipe capacity; only an interleaved
    // drain completes this.
    const SIZE: usize = 256 * 1024;
    let f = test_fn(|| {
        let block = vec![b'x'; SIZE];
        let mut out = io::stdout();
        let _ = out.write_all(&block);
        let _ = out.flush();
        TestOutcome::pass()
    });
    let (outcome, capture) = run_test(&f, None).unwrap();
    assert!(outcome.passed);
    assert_eq!(capture.stdout.len(), SIZE);
}

#[test]
fn exiting_without_reporting_is_a_failure() {
    let f = test_fn(|| -> TestOutcome { unsafe { nix::libc::_exit(0) } });
    let (outcome, _capture) = run_test(&f, None).unwrap();
    assert!(!outcome.passed);
    assert_eq!(outcome.message, "test did not report a result");
}

#[test]
fn deadline_kills_a_hung_test_and_keeps_partial_output() {
    let f = test_fn(|| {
        emit_stdout("partial");
        std::thread::sleep(Duration::from_secs(30));
        TestOutcome::pass()
    });
    let (outcome, capture) = run_test(&f, Some(Duration::from_millis(200))).unwrap();
    assert!(!outcome.passed);
    assert!(
        outcome.message.contains("timed out"),
        "message was: {}",
        outcome.message
    );
    assert_eq!(capture.stdout_str(), "partial");
}

#[test]
fn grandchild_holding_the_output_pipes_cannot_outlive_the_deadline() {
    // A process spawned by the test inherits the capture write ends.
    // Killing the test child leaves those ends open in the grandchild,
    // so the drain must give up rather than wait for its EOF.
    let f = test_fn(|| {
        let _ = std::process::Command::new("sleep").arg("30").spawn();
        std::thread::sleep(Duration::from_secs(30));
        TestOutcome::pass()
    });

    let start = std::time::Instant::now();
    let (outcome, _capture) = run_test(&f, Some(Duration::from_millis(200))).unwrap();
    assert!(!outcome.passed);
    assert!(
        outcome.message.contains("timed out"),
        "message was: {}",
        outcome.message
    );
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "drain blocked on the grandchild for {:?}",
        start.elapsed()
    );
}

// ============================================================================
// run_tests(): suite orchestration
// ============================================================================

#[test]
fn suite_of_passing_tests() {
    let suite = compile(
        SuiteSpec::new("inner")
            .test("test 1", test_fn(TestOutcome::pass))
            .test("test 2", test_fn(TestOutcome::pass))
            .test("test 3", test_fn(TestOutcome::pass)),
    );

    let mut log = CountingLogger::default();
    run_tests(std::slice::from_ref(&suite), &mut log).unwrap();
    assert_eq!(log.tests_run, 3);
    assert_eq!(log.passed, 3);
    assert_eq!(log.failed, 0);
    assert_eq!(log.skipped, 0);
}

#[test]
fn suite_with_a_failing_test() {
    let suite = compile(
        SuiteSpec::new("inner")
            .test("test 1", test_fn(|| TestOutcome::fail("nope")))
            .test("test 2", test_fn(TestOutcome::pass))
            .test("test 3", test_fn(TestOutcome::pass)),
    );

    let mut log = CountingLogger::default();
    run_tests(std::slice::from_ref(&suite), &mut log).unwrap();
    assert_eq!(log.tests_run, 3);
    assert_eq!(log.passed, 2);
    assert_eq!(log.failed, 1);
    assert_eq!(log.skipped, 0);
    assert_eq!(log.messages, ["nope"]);
}

#[test]
fn suite_with_a_skipped_test() {
    let suite = compile(
        SuiteSpec::new("inner")
            .test("test 1", test_fn(TestOutcome::pass))
            .skip_test("test 2", test_fn(TestOutcome::pass))
            .test("test 3", test_fn(TestOutcome::pass)),
    );

    let mut log = CountingLogger::default();
    run_tests(std::slice::from_ref(&suite), &mut log).unwrap();
    assert_eq!(log.tests_run, 3);
    assert_eq!(log.passed, 2);
    assert_eq!(log.failed, 0);
    assert_eq!(log.skipped, 1);
}

#[test]
fn crashing_test_does_not_take_down_the_run() {
    let suite = compile(
        SuiteSpec::new("inner")
            .test("test 1", test_fn(TestOutcome::pass))
            .test("test 2", test_fn(|| -> TestOutcome { std::process::abort() }))
            .test("test 3", test_fn(TestOutcome::pass)),
    );

    let mut log = CountingLogger::default();
    run_tests(std::slice::from_ref(&suite), &mut log).unwrap();
    assert_eq!(log.tests_run, 3);
    assert_eq!(log.passed, 2);
    assert_eq!(log.failed, 1);
    assert_eq!(log.messages, ["Aborted"]);
}

#[test]
fn skip_marker_on_a_suite_skips_its_whole_subtree() {
    let suite = compile(
        SuiteSpec::new("outer")
            .with_attributes(Attributes::skip())
            .test("own", test_fn(TestOutcome::pass))
            .child(SuiteSpec::new("inner").test("nested", test_fn(TestOutcome::pass))),
    );

    let mut log = CountingLogger::default();
    run_tests(std::slice::from_ref(&suite), &mut log).unwrap();
    assert_eq!(log.tests_run, 2);
    assert_eq!(log.skipped, 2);
    assert_eq!(log.passed + log.failed, 0);
}

#[test]
fn timeout_attribute_bounds_a_test_without_stopping_the_run() {
    let sleeper = test_fn(|| {
        std::thread::sleep(Duration::from_secs(30));
        TestOutcome::pass()
    });
    let suite = compile(
        SuiteSpec::new("inner")
            .test_with(
                "sleeper",
                sleeper,
                Attributes::timeout(Duration::from_millis(200)),
            )
            .test("after", test_fn(TestOutcome::pass)),
    );

    let mut log = CountingLogger::default();
    run_tests(std::slice::from_ref(&suite), &mut log).unwrap();
    assert_eq!(log.tests_run, 2);
    assert_eq!(log.passed, 1);
    assert_eq!(log.failed, 1);
    assert!(log.messages[0].contains("timed out"), "{:?}", log.messages);
}

#[test]
fn running_the_same_compiled_tree_twice_is_idempotent() {
    let suite = compile(
        SuiteSpec::new("inner")
            .test("passes", test_fn(TestOutcome::pass))
            .test("fails", test_fn(|| TestOutcome::fail("always")))
            .skip_test("skipped", test_fn(TestOutcome::pass)),
    );

    let mut first = CountingLogger::default();
    run_tests(std::slice::from_ref(&suite), &mut first).unwrap();
    let mut second = CountingLogger::default();
    run_tests(std::slice::from_ref(&suite), &mut second).unwrap();

    assert_eq!(
        (first.tests_run, first.passed, first.failed, first.skipped),
        (
            second.tests_run,
            second.passed,
            second.failed,
            second.skipped
        )
    );
    assert_eq!(first.messages, second.messages);
}

#[test]
fn console_logger_counts_match_the_run() {
    use crucible::ConsoleLogger;

    let suite = compile(
        SuiteSpec::new("inner")
            .test("passes", test_fn(TestOutcome::pass))
            .test("fails", test_fn(|| TestOutcome::fail("always")))
            .skip_test("skipped", test_fn(TestOutcome::pass)),
    );

    let mut log = ConsoleLogger::new();
    run_tests(std::slice::from_ref(&suite), &mut log).unwrap();
    assert_eq!(log.passed(), 1);
    assert_eq!(log.failed(), 1);
    assert_eq!(log.skipped(), 1);
    assert_eq!(log.tests_run(), 2);
}

// ============================================================================
// Logger event ordering
// ============================================================================

#[derive(Default)]
struct RecordingLogger {
    events: Vec<String>,
}

impl TestLogger for RecordingLogger {
    fn start_run(&mut self) {
        self.events.push("start_run".into());
    }

    fn end_run(&mut self) {
        self.events.push("end_run".into());
    }

    fn start_suite(&mut self, path: &[String]) {
        self.events.push(format!("start_suite {}", path.join("/")));
    }

    fn end_suite(&mut self, path: &[String]) {
        self.events.push(format!("end_suite {}", path.join("/")));
    }

    fn start_test(&mut self, name: &TestName) {
        self.events.push(format!("start_test {}", name));
    }

    fn passed_test(&mut self, name: &TestName, _capture: &OutputCapture) {
        self.events.push(format!("passed_test {}", name));
    }

    fn failed_test(&mut self, name: &TestName, _message: &str, _capture: &OutputCapture) {
        self.events.push(format!("failed_test {}", name));
    }

    fn skipped_test(&mut self, name: &TestName) {
        self.events.push(format!("skipped_test {}", name));
    }
}

#[test]
fn hooks_arrive_in_depth_first_order_with_own_tests_before_children() {
    let suite = compile(
        SuiteSpec::new("outer")
            .test("a", test_fn(TestOutcome::pass))
            .child(SuiteSpec::new("inner").test("b", test_fn(TestOutcome::pass))),
    );

    let mut log = RecordingLogger::default();
    run_tests(std::slice::from_ref(&suite), &mut log).unwrap();

    assert_eq!(
        log.events,
        [
            "start_run",
            "start_suite outer",
            "start_test outer > a",
            "passed_test outer > a",
            "start_suite outer/inner",
            "start_test outer > inner > b",
            "passed_test outer > inner > b",
            "end_suite outer/inner",
            "end_suite outer",
            "end_run",
        ]
    );
}

#[test]
fn harness_failure_keeps_suite_brackets_balanced() {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    // Compile before forking so the child only exercises the
    // orchestrator.
    let suite = compile(
        SuiteSpec::new("outer")
            .test("starved", test_fn(TestOutcome::pass))
            .child(SuiteSpec::new("inner").test("unreached", test_fn(TestOutcome::pass))),
    );

    // Descriptor starvation is confined to a forked child; lowering the
    // limit in the harness process would break sibling tests.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let verdict = (|| -> Option<bool> {
                let (_soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).ok()?;
                setrlimit(Resource::RLIMIT_NOFILE, 0, hard).ok()?;

                let mut log = RecordingLogger::default();
                let result = run_tests(std::slice::from_ref(&suite), &mut log);

                let starts = log
                    .events
                    .iter()
                    .filter(|e| e.starts_with("start_suite"))
                    .count();
                let ends = log
                    .events
                    .iter()
                    .filter(|e| e.starts_with("end_suite"))
                    .count();
                let balanced = result.is_err()
                    && starts == 1
                    && ends == 1
                    && log.events.last().map(String::as_str) == Some("end_run");
                Some(balanced)
            })();
            let code = if verdict == Some(true) { 0 } else { 1 };
            unsafe { nix::libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            assert_eq!(
                waitpid(child, None).unwrap(),
                WaitStatus::Exited(child, 0),
                "suite bracketing was unbalanced after a harness failure"
            );
        }
    }
}
