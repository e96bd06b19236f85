use itertools::Itertools;
use serde_json::Value;

use crate::core::domain::ExecutionResult;

const FLOAT_TOLERANCE: f64 = 1e-9;

/// Decodes a test case input into positional arguments.
///
/// The input is read as a comma separated list of JSON values, so `[1,2,3]`
/// is a single list argument and `1, "a"` are two arguments. Anything that
/// is not JSON is passed through as one string argument.
pub fn decode_args(input: &str) -> Vec<Value> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<Value>(&format!("[{trimmed}]")) {
        Ok(Value::Array(args)) => args,
        _ => vec![Value::String(trimmed.to_string())],
    }
}

/// Text shown as the "actual output" of a case: the return value when there
/// is one, otherwise what the program printed.
pub fn actual_output(result: &ExecutionResult) -> String {
    match &result.return_value {
        Some(Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
        None => result.stdout.trim_end().to_string(),
    }
}

/// Whether a successful run produced the expected output.
pub fn output_matches(result: &ExecutionResult, expected: &str) -> bool {
    match &result.return_value {
        Some(actual) => match serde_json::from_str::<Value>(expected.trim()) {
            Ok(expected) => values_equal(actual, &expected),
            Err(_) => matches!(actual, Value::String(s) if s.trim() == expected.trim()),
        },
        None => normalize_text(&result.stdout) == normalize_text(expected),
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() <= FLOAT_TOLERANCE * a.abs().max(b.abs()).max(1.0),
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        // An empty Lua table has no array part and converts to an object.
        (Value::Object(a), Value::Array(b)) | (Value::Array(b), Value::Object(a)) => {
            a.is_empty() && b.is_empty()
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => actual == expected,
    }
}

fn normalize_text(text: &str) -> String {
    text.trim().lines().map(str::trim_end).join("\n")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn returned(value: Value) -> ExecutionResult {
        ExecutionResult::success(String::new(), String::new(), Some(value), 1)
    }

    fn printed(stdout: &str) -> ExecutionResult {
        ExecutionResult::success(stdout.to_string(), String::new(), None, 1)
    }

    #[test]
    fn test_decode_single_list_argument() {
        assert_eq!(decode_args("[1,2,3]"), vec![json!([1, 2, 3])]);
        assert_eq!(decode_args("[0]"), vec![json!([0])]);
    }

    #[test]
    fn test_decode_multiple_arguments() {
        assert_eq!(decode_args(r#"1, "a", null"#), vec![json!(1), json!("a"), json!(null)]);
    }

    #[test]
    fn test_decode_plain_text_and_empty() {
        assert_eq!(decode_args("hello world"), vec![json!("hello world")]);
        assert!(decode_args("  ").is_empty());
    }

    #[test]
    fn test_numbers_compare_across_int_and_float() {
        assert!(output_matches(&returned(json!(6)), "6"));
        assert!(output_matches(&returned(json!(6.0)), "6"));
        assert!(output_matches(&returned(json!(0.1 + 0.2)), "0.3"));
        assert!(!output_matches(&returned(json!(7)), "6"));
    }

    #[test]
    fn test_nested_values_and_empty_table() {
        assert!(output_matches(&returned(json!([1, [2, 3]])), "[1, [2, 3.0]]"));
        assert!(output_matches(&returned(json!({"a": 1})), r#"{"a": 1}"#));
        assert!(output_matches(&returned(json!({})), "[]"));
    }

    #[test]
    fn test_string_return_against_plain_expected() {
        assert!(output_matches(&returned(json!("abc")), "abc"));
        assert!(output_matches(&returned(json!("abc")), r#""abc""#));
    }

    #[test]
    fn test_stdout_comparison_ignores_trailing_whitespace() {
        assert!(output_matches(&printed("1\n2  \n"), "1\n2"));
        assert!(!output_matches(&printed("1\n3\n"), "1\n2"));
    }

    #[test]
    fn test_actual_output_prefers_return_value() {
        assert_eq!(actual_output(&returned(json!([1, 2]))), "[1,2]");
        assert_eq!(actual_output(&returned(json!("x"))), "x");
        assert_eq!(actual_output(&printed("hi\n")), "hi");
    }
}
