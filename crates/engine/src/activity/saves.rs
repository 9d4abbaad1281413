//! Save-rule resolution: pulling values out of plugin output into the
//! runtime scope.

use rocketship_types::{EngineError, ErrorKind, Save};
use rocketship_util::{canonical_string, evaluate_json_path_owned};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use super::assertions::body_of;

/// Values extracted by a step's save rules.
#[derive(Debug)]
pub struct ResolvedSaves {
    /// Stringified values, keyed by their `as` names.
    pub values: BTreeMap<String, String>,
    /// Optional rules that did not resolve, for log lines.
    pub missing_optional: Vec<String>,
}

/// Resolve every save rule in declaration order.
///
/// A required rule that does not resolve fails the step with `SAVE_MISSING`;
/// optional rules are reported but skipped. All values are stringified
/// before they enter the runtime map.
pub fn resolve_saves(saves: &[Save], output: &JsonValue) -> Result<ResolvedSaves, EngineError> {
    let mut values = BTreeMap::new();
    let mut missing_optional = Vec::new();

    for save in saves {
        match extract(save, output) {
            Some(value) => {
                values.insert(save.save_as().to_string(), canonical_string(&value));
            }
            None if save.is_required() => {
                return Err(EngineError::new(
                    ErrorKind::SaveMissing,
                    format!(
                        "required save '{}' did not resolve ({})",
                        save.save_as(),
                        describe(save)
                    ),
                ));
            }
            None => missing_optional.push(save.save_as().to_string()),
        }
    }

    Ok(ResolvedSaves {
        values,
        missing_optional,
    })
}

fn extract(save: &Save, output: &JsonValue) -> Option<JsonValue> {
    match save {
        Save::JsonPath { path, .. } => evaluate_json_path_owned(body_of(output), path),
        Save::Header { name, .. } => {
            let headers = output.get("headers")?.as_object()?;
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
        }
        Save::SqlResult { column, row, .. } => output
            .get("rows")?
            .as_array()?
            .get(row.unwrap_or(0))?
            .as_object()?
            .get(column)
            .cloned(),
        Save::MessageField { field, .. } => output
            .get(field)
            .or_else(|| body_of(output).get(field))
            .cloned(),
        Save::TopicInfo { field, .. } => output
            .get("topic")
            .and_then(|topic| topic.get(field))
            .or_else(|| output.get(field))
            .cloned(),
    }
}

fn describe(save: &Save) -> String {
    match save {
        Save::JsonPath { path, .. } => format!("json_path '{path}'"),
        Save::Header { name, .. } => format!("header '{name}'"),
        Save::SqlResult { column, .. } => format!("sql column '{column}'"),
        Save::MessageField { field, .. } => format!("message field '{field}'"),
        Save::TopicInfo { field, .. } => format!("topic field '{field}'"),
    }
}
