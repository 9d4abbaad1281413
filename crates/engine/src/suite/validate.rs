//! Structural validation of parsed suites.
//!
//! Validation runs once between parsing and workflow start. Variable
//! references are deliberately not checked here: cleanup may legitimately
//! reference values produced mid-run, so unresolved references surface at
//! render time instead.

use rocketship_types::{Assertion, Issue, KnownAssertion, Step, Suite};
use std::collections::HashSet;

const KNOWN_ASSERTION_KINDS: &[&str] = &[
    "status_code",
    "json_path",
    "header",
    "row_count",
    "column_value",
    "supabase_count",
];

/// Validate a suite against the set of registered plugin names.
///
/// Returns every finding rather than stopping at the first, so a user can
/// fix a suite in one pass.
pub fn validate_suite(suite: &Suite, plugin_names: &[String]) -> Vec<Issue> {
    let mut issues = Vec::new();
    let registered: HashSet<&str> = plugin_names.iter().map(String::as_str).collect();

    if suite.name.trim().is_empty() {
        issues.push(issue("name", "suite name must not be empty"));
    }
    if suite.tests.is_empty() {
        issues.push(issue("tests", "suite must declare at least one test"));
    }

    for (test_index, test) in suite.tests.iter().enumerate() {
        let test_path = format!("tests[{test_index}]");
        if test.name.trim().is_empty() {
            issues.push(issue(&test_path, "test name must not be empty"));
        }
        if test.steps.is_empty() {
            issues.push(issue(&test_path, "test must declare at least one step"));
        }
        let mut seen_names = HashSet::new();
        for step in &test.steps {
            if !step.name.trim().is_empty() && !seen_names.insert(step.name.as_str()) {
                issues.push(issue(
                    &test_path,
                    format!("duplicate step name '{}' within test", step.name),
                ));
            }
        }
    }

    for (path, step) in suite.all_steps() {
        validate_step(&path, step, &registered, &mut issues);
    }

    issues
}

fn validate_step(path: &str, step: &Step, registered: &HashSet<&str>, issues: &mut Vec<Issue>) {
    if step.name.trim().is_empty() {
        issues.push(issue(path, "step name must not be empty"));
    }
    if step.plugin.trim().is_empty() {
        issues.push(issue(path, "step plugin must not be empty"));
    } else if !registered.contains(step.plugin.as_str()) {
        issues.push(issue(
            path,
            format!(
                "unknown plugin '{}'; registered plugins: {}",
                step.plugin,
                sorted_names(registered)
            ),
        ));
    }

    for (assertion_index, assertion) in step.assertions.iter().enumerate() {
        let assertion_path = format!("{path}.assertions[{assertion_index}]");
        match assertion {
            Assertion::Known(KnownAssertion::JsonPath { path: json_path, expected, exists }) => {
                if json_path.trim().is_empty() {
                    issues.push(issue(&assertion_path, "json_path assertion requires a path"));
                }
                if expected.is_none() && exists.is_none() {
                    issues.push(issue(
                        &assertion_path,
                        "json_path assertion requires 'expected' or 'exists'",
                    ));
                }
            }
            Assertion::Known(_) => {}
            Assertion::Plugin(plugin_assertion) => {
                // A known kind that fell through to the passthrough variant
                // is a malformed assertion, not a plugin extension.
                if KNOWN_ASSERTION_KINDS.contains(&plugin_assertion.kind.as_str()) {
                    issues.push(issue(
                        &assertion_path,
                        format!("malformed '{}' assertion", plugin_assertion.kind),
                    ));
                }
            }
        }
    }

    for (save_index, save) in step.save.iter().enumerate() {
        if save.save_as().trim().is_empty() {
            issues.push(issue(
                &format!("{path}.save[{save_index}]"),
                "save entry requires a non-empty 'as' name",
            ));
        }
    }

    if let Some(retry) = &step.retry {
        let retry_path = format!("{path}.retry");
        if retry.maximum_attempts < 1 {
            issues.push(issue(&retry_path, "maximum_attempts must be >= 1"));
        }
        if retry.backoff_coefficient < 1.0 {
            issues.push(issue(&retry_path, "backoff_coefficient must be >= 1.0"));
        }
        if rocketship_util::parse_duration(&retry.initial_interval).is_none() {
            issues.push(issue(
                &retry_path,
                format!("invalid initial_interval '{}'", retry.initial_interval),
            ));
        }
    }
}

fn sorted_names(registered: &HashSet<&str>) -> String {
    let mut names: Vec<&str> = registered.iter().copied().collect();
    names.sort_unstable();
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

fn issue(path: impl Into<String>, message: impl Into<String>) -> Issue {
    Issue {
        path: path.into(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::parse_suite;

    fn plugins() -> Vec<String> {
        vec!["http".to_string(), "delay".to_string()]
    }

    #[test]
    fn a_well_formed_suite_has_no_issues() {
        let suite = parse_suite(
            r#"
name: ok
init:
  - name: seed
    plugin: http
    config: { url: "https://example.com" }
tests:
  - name: t
    steps:
      - name: s
        plugin: http
        config: { url: "https://example.com" }
        retry:
          maximum_attempts: 3
          initial_interval: 100ms
cleanup:
  always:
    - name: teardown
      plugin: delay
      config: { duration: 1s }
"#,
        )
        .expect("parse");
        assert!(validate_suite(&suite, &plugins()).is_empty());
    }

    #[test]
    fn unknown_plugins_are_reported_everywhere() {
        let suite = parse_suite(
            r#"
name: bad plugins
init:
  - name: seed
    plugin: nope
    config: {}
tests:
  - name: t
    steps:
      - name: s
        plugin: also-nope
        config: {}
"#,
        )
        .expect("parse");
        let issues = validate_suite(&suite, &plugins());
        assert_eq!(issues.len(), 2);
        assert!(issues[0].path.starts_with("init[0]"));
        assert!(issues[0].message.contains("unknown plugin 'nope'"));
        assert!(issues[1].message.contains("registered plugins: delay, http"));
    }

    #[test]
    fn duplicate_step_names_within_a_test_are_reported() {
        let suite = parse_suite(
            r#"
name: dup steps
tests:
  - name: t
    steps:
      - name: same
        plugin: http
        config: {}
      - name: same
        plugin: http
        config: {}
"#,
        )
        .expect("parse");
        let issues = validate_suite(&suite, &plugins());
        assert!(issues
            .iter()
            .any(|found| found.message.contains("duplicate step name 'same'")));
    }

    #[test]
    fn retry_bounds_are_enforced() {
        let suite = parse_suite(
            r#"
name: bad retry
tests:
  - name: t
    steps:
      - name: s
        plugin: http
        config: {}
        retry:
          maximum_attempts: 0
          initial_interval: nonsense
          backoff_coefficient: 0.5
"#,
        )
        .expect("parse");
        let issues = validate_suite(&suite, &plugins());
        let retry_issues: Vec<_> = issues
            .iter()
            .filter(|found| found.path.ends_with(".retry"))
            .collect();
        assert_eq!(retry_issues.len(), 3);
    }

    #[test]
    fn malformed_known_assertions_are_not_treated_as_plugin_extensions() {
        let suite = parse_suite(
            r#"
name: malformed assertion
tests:
  - name: t
    steps:
      - name: s
        plugin: http
        config: {}
        assertions:
          - type: json_path
            path: ".a"
"#,
        )
        .expect("parse");
        let issues = validate_suite(&suite, &plugins());
        assert!(issues
            .iter()
            .any(|found| found.message.contains("'expected' or 'exists'")));
    }
}
