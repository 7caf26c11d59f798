//! Instrumentation run requests and the result collector for `am instrument -r` output.

use std::{collections::BTreeMap, fmt::Display};

use lazy_regex::{Lazy, Regex, lazy_regex};
use tracing::{trace, warn};

use crate::device::shell_quote;

/// Runner used when the caller doesn't name one
pub const DEFAULT_RUNNER: &str = "android.test.InstrumentationTestRunner";

/// A single test method to scope a run to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMethod {
    pub class_name: String,
    pub method_name: String,
}

impl TestMethod {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self { class_name: class_name.into(), method_name: method_name.into() }
    }
}

/// Everything needed to start one instrumentation run on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationRun {
    pub package: String,
    pub runner: String,
    pub method: Option<TestMethod>,
    /// Extra `-e key value` arguments handed to the runner
    pub args: BTreeMap<String, String>,
}

impl InstrumentationRun {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            runner: DEFAULT_RUNNER.to_string(),
            method: None,
            args: BTreeMap::new(),
        }
    }

    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = runner.into();
        self
    }

    pub fn with_method(mut self, method: TestMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Shell command that starts this run with raw (`-r`) status output
    pub fn command(&self) -> String {
        let mut command = String::from("am instrument -r -w");
        if let Some(method) = &self.method {
            command.push_str(&format!(
                " -e class {}",
                shell_quote(&format!("{}#{}", method.class_name, method.method_name))
            ));
        }
        for (key, value) in &self.args {
            command.push_str(&format!(" -e {} {}", shell_quote(key), shell_quote(value)));
        }
        command.push_str(&format!(" {}/{}", self.package, self.runner));
        command
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestId {
    pub class_name: String,
    pub test_name: String,
}

impl Display for TestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.class_name, self.test_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Ignored,
    AssumptionFailure,
    /// Started but never reported an end status
    Incomplete,
}

impl TestStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Error | Self::Incomplete)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub id: TestId,
    pub status: TestStatus,
    pub stack_trace: Option<String>,
}

/// Collected outcome of one instrumentation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRunResult {
    pub tests: Vec<TestResult>,
    /// Set when the run itself did not complete normally
    pub run_failure: Option<String>,
}

impl TestRunResult {
    pub fn has_failed_tests(&self) -> bool {
        self.tests.iter().any(|t| t.status.is_failure())
    }

    pub fn num_failed_tests(&self) -> usize {
        self.tests.iter().filter(|t| t.status.is_failure()).count()
    }

    pub fn num_passed_tests(&self) -> usize {
        self.tests.iter().filter(|t| t.status == TestStatus::Passed).count()
    }

    pub fn failed_tests(&self) -> impl Iterator<Item = &TestResult> {
        self.tests.iter().filter(|t| t.status.is_failure())
    }
}

static KEY_VALUE_REGEX: Lazy<Regex> =
    lazy_regex!(r"^INSTRUMENTATION_(STATUS|RESULT): ([^=]+)=(.*)$");

const STATUS_CODE_PREFIX: &str = "INSTRUMENTATION_STATUS_CODE: ";
const RUN_CODE_PREFIX: &str = "INSTRUMENTATION_CODE: ";
const RUN_FAILED_PREFIX: &str = "INSTRUMENTATION_FAILED: ";

/// Parses the raw output of `am instrument -r` into a [`TestRunResult`].
pub fn parse_instrumentation_output(output: &str) -> TestRunResult {
    let mut result = TestRunResult::default();
    let mut status: BTreeMap<String, String> = BTreeMap::new();
    let mut run_result: BTreeMap<String, String> = BTreeMap::new();
    // (is_run_result, key) of the value that continuation lines belong to
    let mut last_key: Option<(bool, String)> = None;
    let mut started: Option<TestId> = None;
    let mut saw_run_code = false;

    for line in output.lines() {
        let line = line.trim_end_matches('\r');

        if let Some(caps) = KEY_VALUE_REGEX.captures(line) {
            let is_result = &caps[1] == "RESULT";
            let key = caps[2].to_string();
            let map = if is_result { &mut run_result } else { &mut status };
            map.insert(key.clone(), caps[3].to_string());
            last_key = Some((is_result, key));
        } else if let Some(code) = line.strip_prefix(STATUS_CODE_PREFIX) {
            last_key = None;
            let code: i32 = match code.trim().parse() {
                Ok(code) => code,
                Err(_) => {
                    warn!(line, "Unparseable instrumentation status code");
                    continue;
                }
            };
            let id = TestId {
                class_name: status.get("class").cloned().unwrap_or_default(),
                test_name: status.get("test").cloned().unwrap_or_default(),
            };
            let end_status = match code {
                1 => {
                    trace!(test = %id, "Test started");
                    started = Some(id);
                    status.clear();
                    continue;
                }
                0 => TestStatus::Passed,
                -1 => TestStatus::Error,
                -2 => TestStatus::Failed,
                -3 => TestStatus::Ignored,
                -4 => TestStatus::AssumptionFailure,
                // Interim status (e.g. 2 = in progress), no state change
                _ => {
                    status.clear();
                    continue;
                }
            };
            if started.as_ref() == Some(&id) {
                started = None;
            }
            let stack_trace = status.get("stack").cloned().filter(|s| !s.trim().is_empty());
            result.tests.push(TestResult { id, status: end_status, stack_trace });
            status.clear();
        } else if line.starts_with(RUN_CODE_PREFIX) {
            last_key = None;
            saw_run_code = true;
        } else if let Some(reason) = line.strip_prefix(RUN_FAILED_PREFIX) {
            last_key = None;
            result.run_failure = Some(reason.trim().to_string());
        } else if let Some((is_result, key)) = &last_key {
            // Multi-line value such as a stack trace
            let map = if *is_result { &mut run_result } else { &mut status };
            if let Some(value) = map.get_mut(key) {
                value.push('\n');
                value.push_str(line);
            }
        }
    }

    if let Some(id) = started {
        result.tests.push(TestResult {
            id,
            status: TestStatus::Incomplete,
            stack_trace: Some("Test failed to run to completion".to_string()),
        });
    }
    if result.run_failure.is_none() {
        if let Some(short_msg) = run_result.get("shortMsg") {
            result.run_failure = Some(short_msg.clone());
        } else if !saw_run_code {
            result.run_failure = Some("Instrumentation run did not report a result code".into());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASS_AND_FAIL: &str = "INSTRUMENTATION_STATUS: class=com.example.FooTest
INSTRUMENTATION_STATUS: current=1
INSTRUMENTATION_STATUS: numtests=2
INSTRUMENTATION_STATUS: test=testOk
INSTRUMENTATION_STATUS_CODE: 1
INSTRUMENTATION_STATUS: class=com.example.FooTest
INSTRUMENTATION_STATUS: current=1
INSTRUMENTATION_STATUS: numtests=2
INSTRUMENTATION_STATUS: stream=.
INSTRUMENTATION_STATUS: test=testOk
INSTRUMENTATION_STATUS_CODE: 0
INSTRUMENTATION_STATUS: class=com.example.FooTest
INSTRUMENTATION_STATUS: current=2
INSTRUMENTATION_STATUS: numtests=2
INSTRUMENTATION_STATUS: test=testBroken
INSTRUMENTATION_STATUS_CODE: 1
INSTRUMENTATION_STATUS: class=com.example.FooTest
INSTRUMENTATION_STATUS: current=2
INSTRUMENTATION_STATUS: numtests=2
INSTRUMENTATION_STATUS: stack=junit.framework.AssertionFailedError: expected:<1> but was:<2>
\tat com.example.FooTest.testBroken(FooTest.java:42)
INSTRUMENTATION_STATUS: test=testBroken
INSTRUMENTATION_STATUS_CODE: -2
INSTRUMENTATION_RESULT: stream=
Test results for InstrumentationTestRunner=.F
Time: 0.12

FAILURES!!!
Tests run: 2,  Failures: 1,  Errors: 0

INSTRUMENTATION_CODE: -1
";

    #[test]
    fn command_defaults_to_standard_runner() {
        let run = InstrumentationRun::new("com.example.tests");
        assert_eq!(
            run.command(),
            "am instrument -r -w com.example.tests/android.test.InstrumentationTestRunner"
        );
    }

    #[test]
    fn command_scopes_to_method_and_passes_args() {
        let run = InstrumentationRun::new("com.example.tests")
            .with_runner("androidx.test.runner.AndroidJUnitRunner")
            .with_method(TestMethod::new("com.example.FooTest", "testOk"))
            .with_arg("size", "small")
            .with_arg("message", "hello world");
        assert_eq!(
            run.command(),
            "am instrument -r -w -e class com.example.FooTest#testOk -e message 'hello world' \
             -e size small com.example.tests/androidx.test.runner.AndroidJUnitRunner"
        );
    }

    #[test]
    fn parses_passed_and_failed_tests() {
        let result = parse_instrumentation_output(PASS_AND_FAIL);
        assert_eq!(result.tests.len(), 2);
        assert_eq!(result.num_passed_tests(), 1);
        assert_eq!(result.num_failed_tests(), 1);
        assert!(result.has_failed_tests());
        assert_eq!(result.run_failure, None);

        let failed = result.failed_tests().next().unwrap();
        assert_eq!(failed.id.to_string(), "com.example.FooTest#testBroken");
        let stack = failed.stack_trace.as_deref().unwrap();
        assert!(stack.starts_with("junit.framework.AssertionFailedError"));
        assert!(stack.contains("FooTest.java:42"));
    }

    #[test]
    fn all_passing_run_has_no_failures() {
        let output = "INSTRUMENTATION_STATUS: class=A\nINSTRUMENTATION_STATUS: test=t\n\
                      INSTRUMENTATION_STATUS_CODE: 1\nINSTRUMENTATION_STATUS: class=A\n\
                      INSTRUMENTATION_STATUS: test=t\nINSTRUMENTATION_STATUS_CODE: 0\n\
                      INSTRUMENTATION_RESULT: stream=\nOK (1 test)\nINSTRUMENTATION_CODE: -1\n";
        let result = parse_instrumentation_output(output);
        assert!(!result.has_failed_tests());
        assert_eq!(result.num_passed_tests(), 1);
    }

    #[test]
    fn ignored_tests_are_not_failures() {
        let output = "INSTRUMENTATION_STATUS: class=A\nINSTRUMENTATION_STATUS: test=t\n\
                      INSTRUMENTATION_STATUS_CODE: 1\nINSTRUMENTATION_STATUS: class=A\n\
                      INSTRUMENTATION_STATUS: test=t\nINSTRUMENTATION_STATUS_CODE: -3\n\
                      INSTRUMENTATION_CODE: -1\n";
        let result = parse_instrumentation_output(output);
        assert_eq!(result.tests[0].status, TestStatus::Ignored);
        assert!(!result.has_failed_tests());
    }

    #[test]
    fn crashed_run_marks_started_test_incomplete() {
        let output = "INSTRUMENTATION_STATUS: class=A\nINSTRUMENTATION_STATUS: test=t\n\
                      INSTRUMENTATION_STATUS_CODE: 1\n\
                      INSTRUMENTATION_RESULT: shortMsg=Process crashed.\n\
                      INSTRUMENTATION_CODE: 0\n";
        let result = parse_instrumentation_output(output);
        assert_eq!(result.tests.len(), 1);
        assert_eq!(result.tests[0].status, TestStatus::Incomplete);
        assert!(result.has_failed_tests());
        assert_eq!(result.run_failure.as_deref(), Some("Process crashed."));
    }

    #[test]
    fn missing_runner_is_a_run_failure() {
        let output = "INSTRUMENTATION_FAILED: com.example.tests/android.test.InstrumentationTestRunner\n";
        let result = parse_instrumentation_output(output);
        assert!(result.tests.is_empty());
        assert!(!result.has_failed_tests());
        assert_eq!(
            result.run_failure.as_deref(),
            Some("com.example.tests/android.test.InstrumentationTestRunner")
        );
    }
}
