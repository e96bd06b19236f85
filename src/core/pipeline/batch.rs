use tokio::sync::mpsc::Sender;

use crate::{
    constants::PROGRESS_TX_ERR,
    core::{
        domain::{ErrorKind, ExecutionRequest, ExecutionResult, TestCase, TestCaseResult, TestStatus},
        pipeline::matching::{actual_output, decode_args, output_matches},
        traits::executor::CaseExecutor,
    },
};

/// One submitted solution and the cases to check it against.
#[derive(Debug, Clone)]
pub struct BatchSubmission<'a> {
    pub code: &'a str,
    pub entry_point: &'a str,
    pub test_cases: &'a [TestCase],
    pub timeout_ms: Option<u64>,
}

/// Runs every test case of a submission in input order.
///
/// Each case is a separate request, so it gets its own fresh namespace. A
/// failing case never stops the batch; only an abort does, in which case the
/// remaining cases are reported as interrupted without running. The returned
/// vector always has one entry per input case.
#[tracing::instrument(skip_all, fields(entry_point = submission.entry_point, cases = submission.test_cases.len()))]
pub async fn run_batch(
    submission: BatchSubmission<'_>,
    executor: &dyn CaseExecutor,
    progress_tx: Option<&Sender<Vec<TestCaseResult>>>,
) -> Vec<TestCaseResult> {
    let mut results: Vec<TestCaseResult> = submission
        .test_cases
        .iter()
        .map(TestCaseResult::pending)
        .collect();
    report(progress_tx, &results).await;

    for (idx, test_case) in submission.test_cases.iter().enumerate() {
        if executor.abort_requested() {
            tracing::info!("Batch aborted before test case {}", test_case.id);
            for (remaining, case) in results[idx..].iter_mut().zip(&submission.test_cases[idx..]) {
                *remaining = (
                    case,
                    ExecutionResult::failure(ErrorKind::Interrupted, "batch was aborted", 0),
                )
                    .into();
            }
            report(progress_tx, &results).await;
            break;
        }

        results[idx] = results[idx].change_status(TestStatus::Running);
        report(progress_tx, &results).await;

        let mut request = ExecutionRequest::new(submission.code)
            .with_entry_point(submission.entry_point)
            .with_args(decode_args(&test_case.input));
        request.timeout_ms = submission.timeout_ms;

        tracing::debug!("Running test case {} ({})", idx, test_case.id);
        let result = executor.execute_case(request).await;

        results[idx] = (test_case, result).into();
        tracing::debug!("Test case {} finished: {:?}", test_case.id, results[idx].status);
        report(progress_tx, &results).await;
    }

    results
}

async fn report(progress_tx: Option<&Sender<Vec<TestCaseResult>>>, results: &[TestCaseResult]) {
    if let Some(tx) = progress_tx {
        if tx.send(results.to_vec()).await.is_err() {
            tracing::debug!("{}", PROGRESS_TX_ERR);
        }
    }
}

impl From<(&TestCase, ExecutionResult)> for TestCaseResult {
    fn from((test_case, result): (&TestCase, ExecutionResult)) -> Self {
        let pending = TestCaseResult::pending(test_case);
        let actual = actual_output(&result);

        if !result.success {
            return TestCaseResult {
                status: TestStatus::Failed,
                actual_output: actual,
                kind: result.kind,
                error: result.error,
                execution_time_ms: result.execution_time_ms,
                ..pending
            };
        }

        let status = if output_matches(&result, &test_case.expected_output) {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        };

        TestCaseResult {
            status,
            actual_output: actual,
            execution_time_ms: result.execution_time_ms,
            ..pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::executor::MockCaseExecutor;
    use itertools::Itertools;
    use mockall::Sequence;
    use serde_json::json;
    use tokio::sync::mpsc;

    const SUM: &str = "function solve(xs) local s = 0 for _, x in ipairs(xs) do s = s + x end return s end";

    fn cases() -> Vec<TestCase> {
        vec![
            TestCase {
                id: "1".to_string(),
                input: "[1,2,3]".to_string(),
                expected_output: "6".to_string(),
                hidden: false,
            },
            TestCase {
                id: "2".to_string(),
                input: "[0]".to_string(),
                expected_output: "0".to_string(),
                hidden: false,
            },
            TestCase {
                id: "3".to_string(),
                input: "[-1,1]".to_string(),
                expected_output: "0".to_string(),
                hidden: true,
            },
        ]
    }

    fn submission(test_cases: &[TestCase]) -> BatchSubmission<'_> {
        BatchSubmission {
            code: SUM,
            entry_point: "solve",
            test_cases,
            timeout_ms: Some(1000),
        }
    }

    fn returned(value: serde_json::Value) -> ExecutionResult {
        ExecutionResult::success(String::new(), String::new(), Some(value), 3)
    }

    #[tokio::test]
    async fn test_all_cases_pass() {
        let mut executor = MockCaseExecutor::new();
        executor.expect_abort_requested().return_const(false);
        executor
            .expect_execute_case()
            .times(3)
            .returning(|request| {
                let sum: i64 = request.args[0]
                    .as_array()
                    .expect("list argument")
                    .iter()
                    .filter_map(|v| v.as_i64())
                    .sum();
                returned(json!(sum))
            });

        let cases = cases();
        let results = run_batch(submission(&cases), &executor, None).await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status == TestStatus::Passed));
        assert_eq!(
            results.iter().map(|r| r.test_case_id.as_str()).collect_vec(),
            vec!["1", "2", "3"]
        );
        assert!(results[2].hidden);
    }

    #[tokio::test]
    async fn test_requests_carry_entry_point_args_and_timeout() {
        let mut executor = MockCaseExecutor::new();
        executor.expect_abort_requested().return_const(false);
        executor
            .expect_execute_case()
            .withf(|request| {
                request.code == SUM
                    && request.entry_point.as_deref() == Some("solve")
                    && request.timeout_ms == Some(1000)
                    && request.args == vec![json!([1, 2, 3])]
            })
            .times(1)
            .returning(|_| returned(json!(6)));

        let cases = cases()[..1].to_vec();
        let results = run_batch(submission(&cases), &executor, None).await;
        assert_eq!(results[0].status, TestStatus::Passed);
    }

    #[tokio::test]
    async fn test_failing_case_does_not_stop_batch() {
        let mut seq = Sequence::new();
        let mut executor = MockCaseExecutor::new();
        executor.expect_abort_requested().return_const(false);
        executor
            .expect_execute_case()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| returned(json!(6)));
        executor
            .expect_execute_case()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ExecutionResult::failure(ErrorKind::Timeout, "exceeded 1000ms", 1000));
        executor
            .expect_execute_case()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| returned(json!(5)));

        let cases = cases();
        let results = run_batch(submission(&cases), &executor, None).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].status, TestStatus::Passed);
        assert_eq!(results[1].status, TestStatus::Failed);
        assert_eq!(results[1].kind, Some(ErrorKind::Timeout));
        assert_eq!(results[1].execution_time_ms, 1000);
        assert_eq!(results[2].status, TestStatus::Failed);
        assert_eq!(results[2].kind, None);
        assert_eq!(results[2].actual_output, "5");
    }

    #[tokio::test]
    async fn test_abort_marks_remaining_cases_interrupted() {
        let mut seq = Sequence::new();
        let mut executor = MockCaseExecutor::new();
        executor
            .expect_abort_requested()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(false);
        executor
            .expect_execute_case()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ExecutionResult::failure(ErrorKind::Interrupted, "aborted", 10));
        executor
            .expect_abort_requested()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(true);

        let cases = cases();
        let results = run_batch(submission(&cases), &executor, None).await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status == TestStatus::Failed));
        assert!(
            results
                .iter()
                .all(|r| r.kind == Some(ErrorKind::Interrupted))
        );
        assert_eq!(results[2].test_case_id, "3");
    }

    #[tokio::test]
    async fn test_progress_reports_each_transition() {
        let mut executor = MockCaseExecutor::new();
        executor.expect_abort_requested().return_const(false);
        executor
            .expect_execute_case()
            .times(2)
            .returning(|_| returned(json!(0)));

        let cases = cases()[1..].to_vec();
        let (tx, mut rx) = mpsc::channel(16);
        let results = run_batch(submission(&cases), &executor, Some(&tx)).await;
        drop(tx);

        let mut snapshots = Vec::new();
        while let Some(snapshot) = rx.recv().await {
            snapshots.push(snapshot);
        }

        // 1 initial snapshot + (running, finished) for each of the 2 cases
        assert_eq!(snapshots.len(), 5);
        let first_case_states = snapshots
            .iter()
            .map(|s| s[0].status)
            .unique()
            .collect_vec();
        assert_eq!(
            first_case_states,
            vec![TestStatus::Pending, TestStatus::Running, TestStatus::Passed]
        );
        assert_eq!(snapshots.last(), Some(&results));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let executor = MockCaseExecutor::new();
        let results = run_batch(submission(&[]), &executor, None).await;
        assert!(results.is_empty());
    }

    #[test]
    fn test_printed_output_is_judged_when_nothing_is_returned() {
        let case = TestCase {
            id: "p".to_string(),
            input: String::new(),
            expected_output: "hello".to_string(),
            hidden: false,
        };
        let result = ExecutionResult::success("hello\n".to_string(), String::new(), None, 1);
        let judged: TestCaseResult = (&case, result).into();
        assert_eq!(judged.status, TestStatus::Passed);
        assert_eq!(judged.actual_output, "hello");
    }
}
