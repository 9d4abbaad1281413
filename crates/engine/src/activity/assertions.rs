//! Assertion evaluation against plugin output.
//!
//! Every assertion is evaluated in declaration order even after one fails;
//! the full outcome list appears in the step result. Comparison is stringwise
//! after both sides are coerced to canonical form.

use rocketship_types::{Assertion, AssertionOutcome, KnownAssertion};
use rocketship_util::{canonical_string, evaluate_json_path_owned};
use serde_json::Value as JsonValue;

/// Evaluate all assertions against `output`, in order.
pub fn evaluate_assertions(assertions: &[Assertion], output: &JsonValue) -> Vec<AssertionOutcome> {
    assertions
        .iter()
        .map(|assertion| evaluate_one(assertion, output))
        .collect()
}

/// The document JSON-path style assertions navigate: the output's `body`
/// field when present (HTTP-shaped plugins nest the payload there), the
/// whole output otherwise.
pub fn body_of(output: &JsonValue) -> &JsonValue {
    output.get("body").unwrap_or(output)
}

fn evaluate_one(assertion: &Assertion, output: &JsonValue) -> AssertionOutcome {
    match assertion {
        Assertion::Known(known) => evaluate_known(known, output),
        Assertion::Plugin(plugin_assertion) => AssertionOutcome {
            kind: plugin_assertion.kind.clone(),
            path: None,
            expected: None,
            actual: String::new(),
            passed: true,
            message: Some("delegated to the owning plugin".to_string()),
        },
    }
}

fn evaluate_known(assertion: &KnownAssertion, output: &JsonValue) -> AssertionOutcome {
    match assertion {
        KnownAssertion::StatusCode { expected } => {
            compare("status_code", None, expected, output.get("status_code"))
        }
        KnownAssertion::Header { name, expected } => compare(
            "header",
            Some(name.clone()),
            expected,
            header_value(output, name).as_ref(),
        ),
        KnownAssertion::RowCount { expected } => {
            let actual = output
                .get("rows")
                .and_then(JsonValue::as_array)
                .map(|rows| JsonValue::from(rows.len() as u64))
                .or_else(|| output.get("row_count").cloned());
            compare("row_count", None, expected, actual.as_ref())
        }
        KnownAssertion::ColumnValue { column, row, expected } => {
            let actual = column_value(output, column, row.unwrap_or(0));
            compare(
                "column_value",
                Some(column.clone()),
                expected,
                actual.as_ref(),
            )
        }
        KnownAssertion::SupabaseCount { expected } => {
            compare("supabase_count", None, expected, output.get("count"))
        }
        KnownAssertion::JsonPath { path, expected, exists } => {
            evaluate_json_path_assertion(path, expected.as_ref(), *exists, output)
        }
    }
}

fn evaluate_json_path_assertion(
    path: &str,
    expected: Option<&JsonValue>,
    exists: Option<bool>,
    output: &JsonValue,
) -> AssertionOutcome {
    let resolved = evaluate_json_path_owned(body_of(output), path);

    if let Some(should_exist) = exists {
        let does_exist = resolved.is_some();
        if does_exist != should_exist {
            return AssertionOutcome {
                kind: "json_path".to_string(),
                path: Some(path.to_string()),
                expected: Some(format!("exists == {should_exist}")),
                actual: format!("exists == {does_exist}"),
                passed: false,
                message: Some(format!(
                    "path '{path}' {}",
                    if does_exist { "resolved but was expected to be absent" } else { "did not resolve" }
                )),
            };
        }
        if expected.is_none() {
            return AssertionOutcome {
                kind: "json_path".to_string(),
                path: Some(path.to_string()),
                expected: Some(format!("exists == {should_exist}")),
                actual: format!("exists == {does_exist}"),
                passed: true,
                message: None,
            };
        }
    }

    match expected {
        Some(expected) => compare("json_path", Some(path.to_string()), expected, resolved.as_ref()),
        None => AssertionOutcome {
            kind: "json_path".to_string(),
            path: Some(path.to_string()),
            expected: None,
            actual: String::new(),
            passed: false,
            message: Some("assertion carries neither 'expected' nor 'exists'".to_string()),
        },
    }
}

fn compare(
    kind: &str,
    path: Option<String>,
    expected: &JsonValue,
    actual: Option<&JsonValue>,
) -> AssertionOutcome {
    let expected_text = canonical_string(expected);
    match actual {
        Some(actual) => {
            let actual_text = canonical_string(actual);
            let passed = actual_text == expected_text;
            AssertionOutcome {
                kind: kind.to_string(),
                path,
                expected: Some(expected_text.clone()),
                actual: actual_text.clone(),
                passed,
                message: (!passed).then(|| format!("expected '{expected_text}', got '{actual_text}'")),
            }
        }
        None => AssertionOutcome {
            kind: kind.to_string(),
            path,
            expected: Some(expected_text.clone()),
            actual: "(missing)".to_string(),
            passed: false,
            message: Some(format!("expected '{expected_text}', but the value was missing")),
        },
    }
}

fn header_value(output: &JsonValue, name: &str) -> Option<JsonValue> {
    let headers = output.get("headers")?.as_object()?;
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

fn column_value(output: &JsonValue, column: &str, row: usize) -> Option<JsonValue> {
    output
        .get("rows")?
        .as_array()?
        .get(row)?
        .as_object()?
        .get(column)
        .cloned()
}
