//! Suite parsing and canonical serialization.
//!
//! YAML input (single or multi-document) is canonicalised into one [`Suite`].
//! The first document is the base; subsequent documents may only contribute
//! additional `tests` entries and new `vars` keys, which keeps fixture files
//! composable without making suites ambiguous. Serialization emits canonical
//! single-document YAML such that parsing it back yields an equal suite.

pub mod validate;

pub use validate::validate_suite;

use indexmap::IndexMap;
use rocketship_types::{EngineError, ErrorKind, Step, Suite, TestSpec};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashSet;

/// Additional documents of a multi-document suite file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SuiteFragment {
    #[serde(default)]
    tests: Vec<TestSpec>,
    #[serde(default)]
    vars: IndexMap<String, JsonValue>,
}

/// Parse suite YAML into a canonical [`Suite`].
pub fn parse_suite(text: &str) -> Result<Suite, EngineError> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|error| parse_error(format!("invalid YAML: {error}")))?;
        if !matches!(value, serde_yaml::Value::Null) {
            documents.push(value);
        }
    }

    let mut documents = documents.into_iter();
    let base = documents
        .next()
        .ok_or_else(|| parse_error("empty suite document"))?;
    let mut suite: Suite = serde_yaml::from_value(base)
        .map_err(|error| parse_error(format!("invalid suite document: {error}")))?;

    for (index, document) in documents.enumerate() {
        let fragment: SuiteFragment = serde_yaml::from_value(document).map_err(|error| {
            parse_error(format!(
                "invalid continuation document #{}: {error}; only 'tests' and 'vars' may be added",
                index + 2
            ))
        })?;
        suite.tests.extend(fragment.tests);
        for (key, value) in fragment.vars {
            if suite.vars.contains_key(&key) {
                return Err(parse_error(format!(
                    "continuation document #{} redefines var '{key}'",
                    index + 2
                )));
            }
            suite.vars.insert(key, value);
        }
    }

    check_duplicate_saves(&suite)?;
    Ok(suite)
}

/// Serialize a suite to its canonical YAML form.
pub fn serialize_suite(suite: &Suite) -> Result<String, EngineError> {
    serde_yaml::to_string(suite)
        .map_err(|error| EngineError::internal(format!("suite serialization failed: {error}")))
}

/// Duplicate `save.as` names within one step are a parse-time failure.
fn check_duplicate_saves(suite: &Suite) -> Result<(), EngineError> {
    for (path, step) in suite.all_steps() {
        duplicate_save_in_step(step)
            .map(|name| {
                Err(parse_error(format!(
                    "{path}: duplicate save name '{name}' within step '{}'",
                    step.name
                )))
            })
            .unwrap_or(Ok(()))?;
    }
    Ok(())
}

fn duplicate_save_in_step(step: &Step) -> Option<&str> {
    let mut seen = HashSet::new();
    step.save
        .iter()
        .map(|save| save.save_as())
        .find(|name| !seen.insert(*name))
}

fn parse_error(message: impl Into<String>) -> EngineError {
    EngineError::new(ErrorKind::ParseError, message)
}
