//! The isolation engine and the run orchestrator.
//!
//! [`run_test`] executes exactly one test callable in a forked child
//! process. The child's stdout and stderr slots are spliced onto
//! capture pipes, and its logical outcome comes back over a third pipe
//! as one self-delimited JSON message. A child that dies to a signal
//! writes nothing; that absence, combined with the wait status, is how
//! a crash is told apart from a normal completion. The crash is fully
//! contained: the parent synthesizes a failed outcome with the signal's
//! human-readable description and the run continues.
//!
//! [`run_tests`] walks a compiled suite tree depth-first, applies the
//! skip policy, and drives a [`TestLogger`] through the run.
//!
//! The parent drains the capture pipes *while* the child executes
//! (multiplexed with `poll`), never only after it exits: a test
//! producing more output than the bounded pipe buffer holds must not
//! deadlock against a parent that is still waiting.

use std::borrow::Cow;
use std::ffi::CStr;
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::errors::HarnessError;
use crate::logger::TestLogger;
use crate::pipe::ScopedPipe;
use crate::suite::{Suite, TestFunction, TestName, TestOutcome};

/// Exit code the child uses when its own pipe splicing fails; the
/// parent sees a normal exit with no result and reports accordingly.
const CHILD_SETUP_FAILURE: libc::c_int = 112;

/// How often the parent re-checks a deadline-bounded child.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How long after killing a timed-out child the parent keeps draining.
/// Processes spawned by the test can inherit the capture write ends
/// and outlive the child; the drain must not wait on them forever.
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Buffered copies of one test's standard output and standard error,
/// valid for that test's execution and handed to the logger on
/// completion.
#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl OutputCapture {
    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

// ============================================================================
// ISOLATION ENGINE
// ============================================================================

/// Runs one test callable in an isolated child process.
///
/// Returns the test's outcome together with its captured output. Any
/// error standing up the isolation machinery itself (pipe allocation,
/// fork, wait) is a [`HarnessError`], never attributed to the test.
///
/// With a `deadline`, the parent races child completion against it and
/// kills the child on expiry; the partially captured output is still
/// returned alongside a "timed out" outcome.
///
/// `fork(2)` duplicates only the calling thread, and the child still
/// allocates while invoking the callable and reporting its outcome.
/// Drive runs from a single controlling thread whose sibling threads
/// are quiescent; forking while another thread holds an allocator lock
/// can deadlock the child.
pub fn run_test(
    function: &TestFunction,
    deadline: Option<Duration>,
) -> Result<(TestOutcome, OutputCapture), HarnessError> {
    let mut stdout_pipe = ScopedPipe::open()?;
    let mut stderr_pipe = ScopedPipe::open()?;
    let mut result_pipe = ScopedPipe::open()?;

    match unsafe { unistd::fork() }.map_err(|source| HarnessError::Fork { source })? {
        ForkResult::Child => child_exec(function, stdout_pipe, stderr_pipe, result_pipe),
        ForkResult::Parent { child } => {
            stdout_pipe.close_write()?;
            stderr_pipe.close_write()?;
            result_pipe.close_write()?;
            collect_child(child, stdout_pipe, stderr_pipe, result_pipe, deadline)
        }
    }
}

/// Child side of the fork. Never returns; terminates with `_exit` so
/// no inherited harness state (buffers, exit hooks) runs twice.
fn child_exec(
    function: &TestFunction,
    mut stdout_pipe: ScopedPipe,
    mut stderr_pipe: ScopedPipe,
    mut result_pipe: ScopedPipe,
) -> ! {
    let spliced = (|| -> Result<(), HarnessError> {
        stdout_pipe.close_read()?;
        stderr_pipe.close_read()?;
        result_pipe.close_read()?;
        stdout_pipe.install_write(libc::STDOUT_FILENO)?;
        stderr_pipe.install_write(libc::STDERR_FILENO)?;
        Ok(())
    })();
    if spliced.is_err() {
        unsafe { libc::_exit(CHILD_SETUP_FAILURE) }
    }

    // A panicking body is a logical failure, not a harness crash.
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| function())) {
        Ok(outcome) => outcome,
        Err(payload) => TestOutcome::fail(panic_message(payload.as_ref())),
    };

    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    if let (Ok(encoded), Some(fd)) = (serde_json::to_vec(&outcome), result_pipe.write_fd()) {
        write_all(fd, &encoded);
    }
    unsafe { libc::_exit(0) }
}

/// Parent side: drain the three pipes interleaved, wait for the child,
/// and convert its termination mode into an outcome.
fn collect_child(
    child: Pid,
    stdout_pipe: ScopedPipe,
    stderr_pipe: ScopedPipe,
    result_pipe: ScopedPipe,
    deadline: Option<Duration>,
) -> Result<(TestOutcome, OutputCapture), HarnessError> {
    let expiry = deadline.map(|d| Instant::now() + d);
    let mut capture = OutputCapture::default();
    let mut result_buf = Vec::new();

    let mut streams = [
        DrainStream::over(&stdout_pipe, &mut capture.stdout)?,
        DrainStream::over(&stderr_pipe, &mut capture.stderr)?,
        DrainStream::over(&result_pipe, &mut result_buf)?,
    ];
    let mut timed_out = drain_streams(child, &mut streams, expiry)?;
    let status = wait_child(child, expiry, &mut timed_out)?;

    let outcome = if timed_out {
        let millis = deadline.unwrap_or_default().as_millis();
        TestOutcome::fail(format!("timed out after {} ms", millis))
    } else {
        conclude(status, &result_buf)
    };
    Ok((outcome, capture))
}

/// One pipe read end being drained into a buffer.
struct DrainStream<'a> {
    fd: RawFd,
    buf: &'a mut Vec<u8>,
    open: bool,
}

impl<'a> DrainStream<'a> {
    fn over(pipe: &ScopedPipe, buf: &'a mut Vec<u8>) -> Result<Self, HarnessError> {
        let fd = pipe.read_fd().ok_or(HarnessError::InvalidHandle)?;
        Ok(Self {
            fd,
            buf,
            open: true,
        })
    }
}

/// Multiplexes reads over every still-open stream until all have hit
/// end-of-stream. With an expiry, the child is killed once it passes;
/// draining then continues for a short grace period so partial output
/// is kept, but not indefinitely — write ends inherited by processes
/// the test spawned may never close. Returns whether the deadline
/// fired.
fn drain_streams(
    child: Pid,
    streams: &mut [DrainStream<'_>],
    expiry: Option<Instant>,
) -> Result<bool, HarnessError> {
    let mut grace_until: Option<Instant> = None;
    let mut chunk = [0u8; 4096];

    while streams.iter().any(|s| s.open) {
        if grace_until.is_none() {
            if let Some(expiry) = expiry {
                if Instant::now() >= expiry {
                    let _ = kill(child, Signal::SIGKILL);
                    grace_until = Some(Instant::now() + KILL_DRAIN_GRACE);
                }
            }
        }

        let wait_ms: libc::c_int = match (grace_until, expiry) {
            (Some(grace), _) => {
                if Instant::now() >= grace {
                    break;
                }
                remaining_ms(grace)
            }
            (None, Some(expiry)) => remaining_ms(expiry),
            // Unbounded: block until EOF.
            (None, None) => -1,
        };

        let open_indices: Vec<usize> = streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.open)
            .map(|(i, _)| i)
            .collect();
        let mut fds: Vec<PollFd> = open_indices
            .iter()
            .map(|&i| PollFd::new(streams[i].fd, PollFlags::POLLIN))
            .collect();

        let ready = match poll(&mut fds, wait_ms) {
            Err(Errno::EINTR) => continue,
            other => other.map_err(|source| HarnessError::Wait { source })?,
        };
        if ready == 0 {
            // Deadline expired with nothing readable; handled on the
            // next pass.
            continue;
        }

        for (slot, &i) in fds.iter().zip(&open_indices) {
            let revents = slot.revents().unwrap_or_else(PollFlags::empty);
            if !revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                continue;
            }
            match unistd::read(streams[i].fd, &mut chunk) {
                Ok(0) => streams[i].open = false,
                Ok(n) => streams[i].buf.extend_from_slice(&chunk[..n]),
                Err(Errno::EINTR) => {}
                Err(source) => return Err(HarnessError::Wait { source }),
            }
        }
    }
    Ok(grace_until.is_some())
}

/// Milliseconds until `until`, clamped for `poll`.
fn remaining_ms(until: Instant) -> libc::c_int {
    let remaining = until.saturating_duration_since(Instant::now());
    remaining.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int
}

/// Waits for the child, bounded by the expiry when one is set. A child
/// that closed its pipes but keeps running is killed on expiry.
fn wait_child(
    child: Pid,
    expiry: Option<Instant>,
    timed_out: &mut bool,
) -> Result<WaitStatus, HarnessError> {
    let expiry = match (expiry, *timed_out) {
        // Already killed, or unbounded: a plain blocking wait suffices.
        (None, _) | (_, true) => {
            return waitpid(child, None).map_err(|source| HarnessError::Wait { source });
        }
        (Some(expiry), false) => expiry,
    };

    loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG))
            .map_err(|source| HarnessError::Wait { source })?
        {
            WaitStatus::StillAlive => {
                if Instant::now() >= expiry {
                    let _ = kill(child, Signal::SIGKILL);
                    *timed_out = true;
                    return waitpid(child, None).map_err(|source| HarnessError::Wait { source });
                }
                thread::sleep(WAIT_POLL_INTERVAL);
            }
            status => return Ok(status),
        }
    }
}

/// Converts the child's termination mode plus whatever arrived on the
/// result channel into an outcome.
fn conclude(status: WaitStatus, result_buf: &[u8]) -> TestOutcome {
    match status {
        // A normal exit must have reported a result; an empty or
        // garbled channel is a logic error in the test, not a crash.
        WaitStatus::Exited(..) => serde_json::from_slice(result_buf)
            .unwrap_or_else(|_| TestOutcome::fail("test did not report a result")),
        WaitStatus::Signaled(_, signal, _) => TestOutcome::fail(signal_description(signal)),
        _ => TestOutcome::fail("test terminated in an unexpected state"),
    }
}

/// Human-readable description of a fatal signal, e.g. "Aborted" or
/// "Segmentation fault".
fn signal_description(signal: Signal) -> String {
    let described = unsafe {
        let ptr = libc::strsignal(signal as libc::c_int);
        if ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
        }
    };
    described.unwrap_or_else(|| signal.to_string())
}

/// Writes the whole buffer, retrying on interruption. The result
/// message is bounded, so failure here just degrades to "no result" on
/// the parent side.
fn write_all(fd: RawFd, mut buf: &[u8]) {
    while !buf.is_empty() {
        match unistd::write(fd, buf) {
            Ok(0) => break,
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR) => {}
            Err(_) => break,
        }
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Runs every test in the given suites, depth-first in declaration
/// order, reporting through `logger`.
///
/// Within a suite, its own tests run before its children. Skip-marked
/// tests are reported (`start_test` then `skipped_test`) without ever
/// entering the isolation engine. The traversal aggregates nothing;
/// counting is the logger's concern.
///
/// A [`HarnessError`] aborts the walk and propagates; `end_suite` for
/// every entered suite and the closing `end_run` are still delivered,
/// so the logger's bracketing stays balanced even on an aborted run.
pub fn run_tests<L: TestLogger>(suites: &[Suite], logger: &mut L) -> Result<(), HarnessError> {
    logger.start_run();
    let mut path = Vec::new();
    let result = suites
        .iter()
        .try_for_each(|suite| run_suite(suite, &mut path, logger));
    logger.end_run();
    result
}

fn run_suite<L: TestLogger>(
    suite: &Suite,
    path: &mut Vec<String>,
    logger: &mut L,
) -> Result<(), HarnessError> {
    path.push(suite.name().to_string());
    logger.start_suite(path);

    let result = run_suite_entries(suite, path, logger);

    logger.end_suite(path);
    path.pop();
    result
}

fn run_suite_entries<L: TestLogger>(
    suite: &Suite,
    path: &mut Vec<String>,
    logger: &mut L,
) -> Result<(), HarnessError> {
    for test in suite.tests() {
        let name = TestName {
            suites: path.clone(),
            name: test.name().to_string(),
            id: test.id(),
        };
        logger.start_test(&name);

        if test.attributes().skipped() {
            logger.skipped_test(&name);
            continue;
        }

        let (outcome, capture) = run_test(test.function(), test.attributes().deadline())?;
        if outcome.passed {
            logger.passed_test(&name, &capture);
        } else {
            logger.failed_test(&name, &outcome.message, &capture);
        }
    }

    for child in suite.children() {
        run_suite(child, path, logger)?;
    }
    Ok(())
}

/// Extracts a readable message from a panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "test panicked".to_string()
    }
}
