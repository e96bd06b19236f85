use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeStatus {
    #[default]
    Unloaded,
    Loading,
    Ready,
    Running,
    Error,
}

/// Snapshot of the runtime published on every status change.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RuntimeInfo {
    pub status: RuntimeStatus,
    pub interpreter_version: Option<String>,
    pub last_error: Option<String>,
    pub memory_usage_bytes: Option<u64>,
    pub init_duration_ms: Option<u64>,
    pub last_run_duration_ms: Option<u64>,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// One request to the execution worker. Built per call and consumed by it.
#[derive(Debug, PartialEq)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub code: String,
    pub entry_point: Option<String>,
    pub timeout_ms: Option<u64>,
    pub args: Vec<serde_json::Value>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            entry_point: None,
            timeout_ms: None,
            args: Vec::new(),
        }
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SyntaxError,
    RuntimeError,
    Timeout,
    Interrupted,
    MemoryError,
    OutputOverflow,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Interrupted => "Interrupted",
            ErrorKind::MemoryError => "MemoryError",
            ErrorKind::OutputOverflow => "OutputOverflow",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn success(
        stdout: String,
        stderr: String,
        return_value: Option<serde_json::Value>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            success: true,
            stdout,
            stderr,
            return_value,
            kind: None,
            error: None,
            traceback: None,
            execution_time_ms,
        }
    }

    /// Builds a failed result. The error message is prefixed with the kind so
    /// it is never empty.
    pub fn failure(kind: ErrorKind, message: impl AsRef<str>, execution_time_ms: u64) -> Self {
        let message = message.as_ref().trim();
        let error = if message.is_empty() {
            kind.to_string()
        } else {
            format!("{kind}: {message}")
        };

        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            return_value: None,
            kind: Some(kind),
            error: Some(error),
            traceback: None,
            execution_time_ms,
        }
    }

    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn with_traceback(mut self, traceback: Option<String>) -> Self {
        self.traceback = traceback.filter(|t| !t.trim().is_empty());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub hidden: bool,
}

impl TestCase {
    pub fn new(
        id: impl Into<String>,
        input: impl Into<String>,
        expected_output: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            expected_output: expected_output.into(),
            hidden: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TestCaseResult {
    pub test_case_id: String,
    pub status: TestStatus,
    pub actual_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub hidden: bool,
}

impl TestCaseResult {
    pub fn pending(test_case: &TestCase) -> Self {
        Self {
            test_case_id: test_case.id.clone(),
            status: TestStatus::Pending,
            actual_output: String::new(),
            kind: None,
            error: None,
            execution_time_ms: 0,
            hidden: test_case.hidden,
        }
    }

    pub fn change_status(&self, status: TestStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Copy safe to show to the user: hidden cases keep only their verdict.
    pub fn redacted(&self) -> Self {
        if !self.hidden {
            return self.clone();
        }
        Self {
            actual_output: String::new(),
            error: None,
            ..self.clone()
        }
    }
}

/// Aggregate counts, always computed from the per-case results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn from_results(results: &[TestCaseResult]) -> Self {
        let passed = results
            .iter()
            .filter(|r| r.status == TestStatus::Passed)
            .count();
        let failed = results
            .iter()
            .filter(|r| r.status == TestStatus::Failed)
            .count();

        Self {
            total: results.len(),
            passed,
            failed,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }
}
