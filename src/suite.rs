//! Suite trees: declared specs, compiled suites, and test identity.
//!
//! A [`SuiteSpec`] is the shape a suite-declaration layer produces: a
//! named group of test bodies with attributes and child groups. It is
//! turned into an immutable [`Suite`] by [`Suite::compile`], which
//! unites inherited attributes, assigns each test a process-wide id,
//! and wraps every body through a caller-supplied transform. The
//! transform is the seam where fixture setup/teardown gets injected;
//! the core itself contains no fixture logic.
//!
//! Compiled suites are immutable and may be shared by concurrent runs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::attributes::Attributes;

/// The result of one test execution: did it pass, and if not, why.
///
/// This is also the wire message the isolated child sends back to the
/// parent, hence the serde derives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: bool,
    pub message: String,
}

impl TestOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            message: String::new(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// A compiled test callable. `Send + Sync` so a compiled tree can be
/// shared across concurrent runs.
pub type TestFunction = Arc<dyn Fn() -> TestOutcome + Send + Sync>;

/// Wraps a closure into a [`TestFunction`].
pub fn test_fn<F>(f: F) -> TestFunction
where
    F: Fn() -> TestOutcome + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Hands out process-wide test ids: monotonic, lock-free, and safe
/// under concurrent compilation of multiple trees. This counter is the
/// sole piece of shared mutable state in the core.
fn next_test_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// DECLARED (UNCOMPILED) SIDE
// ============================================================================

/// One declared test: a name, an uncompiled body, and its attributes.
#[derive(Debug)]
pub struct TestSpec<B> {
    pub name: String,
    pub body: B,
    pub attributes: Attributes,
}

/// A declared suite: the tree a suite-building layer hands to
/// [`Suite::compile`]. Bodies are still in their declared form `B`.
#[derive(Debug)]
pub struct SuiteSpec<B> {
    pub name: String,
    pub attributes: Attributes,
    pub tests: Vec<TestSpec<B>>,
    pub children: Vec<SuiteSpec<B>>,
}

impl<B> SuiteSpec<B> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Attributes::new(),
            tests: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Sets suite-level attributes, inherited by every test and child.
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Declares a test.
    pub fn test(self, name: impl Into<String>, body: B) -> Self {
        self.test_with(name, body, Attributes::new())
    }

    /// Declares a test with attributes.
    pub fn test_with(mut self, name: impl Into<String>, body: B, attributes: Attributes) -> Self {
        self.tests.push(TestSpec {
            name: name.into(),
            body,
            attributes,
        });
        self
    }

    /// Declares a test marked to be skipped.
    pub fn skip_test(self, name: impl Into<String>, body: B) -> Self {
        self.test_with(name, body, Attributes::skip())
    }

    /// Declares a child suite.
    pub fn child(mut self, child: SuiteSpec<B>) -> Self {
        self.children.push(child);
        self
    }
}

// ============================================================================
// COMPILED (IMMUTABLE) SIDE
// ============================================================================

/// One compiled test: immutable after compilation.
pub struct TestEntry {
    name: String,
    function: TestFunction,
    attributes: Attributes,
    id: u64,
}

impl TestEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self) -> &TestFunction {
        &self.function
    }

    /// The fully-united attribute set; inheritance was resolved at
    /// compile time.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Process-wide id, stable for the run. Disambiguates tests with
    /// identical names across the tree.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for TestEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestEntry")
            .field("name", &self.name)
            .field("attributes", &self.attributes)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// An immutable, ordered tree of named test groups.
#[derive(Debug)]
pub struct Suite {
    name: String,
    tests: Vec<TestEntry>,
    children: Vec<Suite>,
}

impl Suite {
    /// Compiles a declared tree into an immutable suite.
    ///
    /// For each declared test: unite its own attributes over those
    /// inherited from the enclosing context, assign the next process-
    /// wide id, and wrap its body through `transform`. Children recurse
    /// with the suite's united attributes passed down. Declaration
    /// order is preserved throughout.
    pub fn compile<B, F>(spec: SuiteSpec<B>, inherited: &Attributes, transform: &F) -> Suite
    where
        F: Fn(B) -> TestFunction,
    {
        let merged = Attributes::unite(&spec.attributes, inherited);

        let tests = spec
            .tests
            .into_iter()
            .map(|test| TestEntry {
                name: test.name,
                attributes: Attributes::unite(&test.attributes, &merged),
                function: transform(test.body),
                id: next_test_id(),
            })
            .collect();

        let children = spec
            .children
            .into_iter()
            .map(|child| Suite::compile(child, &merged, transform))
            .collect();

        Suite {
            name: spec.name,
            tests,
            children,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tests(&self) -> &[TestEntry] {
        &self.tests
    }

    pub fn children(&self) -> &[Suite] {
        &self.children
    }
}

/// The identity a logger sees for one test: the ordered suite names
/// from root to the enclosing suite, the test's own name, and its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestName {
    pub suites: Vec<String>,
    pub name: String,
    pub id: u64,
}

impl fmt::Display for TestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for suite in &self.suites {
            write!(f, "{} > ", suite)?;
        }
        write!(f, "{}", self.name)
    }
}
