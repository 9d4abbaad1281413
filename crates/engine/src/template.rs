//! Template rendering over the layered run context.
//!
//! Templates use the `{{ expr }}` syntax; whitespace inside the braces is
//! ignored. Expression forms:
//!
//! - `{{ .run.id }}` — run built-ins
//! - `{{ .env.NAME }}` — environment (process snapshot, then run env map)
//! - `{{ .vars.dotted.path }}` — configuration vars, dotted traversal
//! - `{{ name }}` — bare lookup across layers, highest priority first:
//!   environment, saved runtime values, configuration vars, built-ins
//!
//! `\{{ ... }}` escapes the delimiters: the backslash is removed and the
//! expression is left un-rendered, so template text destined for a later
//! rendering pass (prompt strings handed to other engines) survives intact.
//! An undefined reference is a hard error that enumerates the bound names of
//! the expected kind. Rendering never mutates the context and is a fixed
//! point on fully-resolved text.

use rocketship_types::{EngineError, ErrorKind};
use rocketship_util::canonical_string;
use serde_json::Value as JsonValue;

use crate::context::RunContext;

/// Render every `{{ expr }}` occurrence in `text` against `context`.
pub fn render(text: &str, context: &RunContext) -> Result<String, EngineError> {
    let mut output = String::with_capacity(text.len());
    let mut remainder = text;

    loop {
        let Some(start) = remainder.find("{{") else {
            output.push_str(remainder);
            break;
        };

        // `\{{` escapes the delimiter: drop the backslash, keep the braces
        // and the expression verbatim.
        if remainder[..start].ends_with('\\') {
            output.push_str(&remainder[..start - 1]);
            let after_open = &remainder[start..];
            match after_open.find("}}") {
                Some(end) => {
                    output.push_str(&after_open[..end + 2]);
                    remainder = &after_open[end + 2..];
                }
                None => {
                    output.push_str(after_open);
                    break;
                }
            }
            continue;
        }

        output.push_str(&remainder[..start]);
        let after_open = &remainder[start + 2..];
        let Some(end) = after_open.find("}}") else {
            return Err(EngineError::template(format!(
                "unterminated template expression near: {}",
                &remainder[start..remainder.len().min(start + 40)]
            )));
        };

        let expression = after_open[..end].trim();
        if expression.is_empty() {
            return Err(EngineError::template(
                "empty template expression `{{ }}`".to_string(),
            ));
        }
        output.push_str(&resolve_expression(expression, context)?);
        remainder = &after_open[end + 2..];
    }

    Ok(output)
}

/// Render every string leaf of a JSON tree, preserving structure.
pub fn render_value(value: &JsonValue, context: &RunContext) -> Result<JsonValue, EngineError> {
    match value {
        JsonValue::String(text) => Ok(JsonValue::String(render(text, context)?)),
        JsonValue::Array(items) => {
            let mut rendered = Vec::with_capacity(items.len());
            for item in items {
                rendered.push(render_value(item, context)?);
            }
            Ok(JsonValue::Array(rendered))
        }
        JsonValue::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, nested) in map {
                rendered.insert(key.clone(), render_value(nested, context)?);
            }
            Ok(JsonValue::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_expression(expression: &str, context: &RunContext) -> Result<String, EngineError> {
    if let Some(builtin) = expression.strip_prefix(".run.") {
        return context
            .lookup_builtin(builtin)
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::template(format!(
                    "unknown run built-in '.run.{builtin}'; available: .run.id"
                ))
            });
    }

    if let Some(name) = expression.strip_prefix(".env.") {
        return context.lookup_env(name).map(str::to_string).ok_or_else(|| {
            EngineError::template(format!(
                "undefined environment variable '{name}'; bound environment names: {}",
                joined_or_none(&context.bound_env_names())
            ))
        });
    }

    if let Some(path) = expression.strip_prefix(".vars.") {
        return context.lookup_var(path).map(canonical_string).ok_or_else(|| {
            EngineError::template(format!(
                "undefined config variable '.vars.{path}'; bound var roots: {}",
                joined_or_none(&context.bound_var_names())
            ))
        });
    }

    if expression.starts_with('.') {
        return Err(EngineError::template(format!(
            "unrecognized template namespace in '{{{{ {expression} }}}}'; expected .run, .env, or .vars"
        )));
    }

    resolve_bare(expression, context)
}

/// Bare-name resolution across layers, highest priority first.
fn resolve_bare(name: &str, context: &RunContext) -> Result<String, EngineError> {
    if let Some(value) = context.lookup_env(name) {
        return Ok(value.to_string());
    }
    if let Some(value) = context.lookup_saved(name) {
        return Ok(value.to_string());
    }
    if let Some(value) = context.lookup_var(name) {
        return Ok(canonical_string(value));
    }
    if let Some(value) = context.lookup_builtin(name) {
        return Ok(value.to_string());
    }

    Err(EngineError::new(
        ErrorKind::TemplateError,
        format!(
            "undefined variable '{name}'; saved values: {}; config vars: {}",
            joined_or_none(&context.bound_saved_names()),
            joined_or_none(&context.bound_var_names())
        ),
    ))
}

fn joined_or_none(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn context() -> RunContext {
        let mut env = HashMap::new();
        env.insert("HOST".to_string(), "api.example.com".to_string());
        RunContext::new(
            "run-7",
            HashMap::new(),
            env,
            json!({"retries": 3, "service": {"name": "orders"}}),
        )
    }

    #[test]
    fn renders_each_namespace() {
        let mut ctx = context().fork_for_test();
        ctx.save("user_id", "42");

        assert_eq!(render("{{ .run.id }}", &ctx).expect("run id"), "run-7");
        assert_eq!(
            render("https://{{ .env.HOST }}/users/{{ user_id }}", &ctx).expect("url"),
            "https://api.example.com/users/42"
        );
        assert_eq!(
            render("{{ .vars.service.name }}:{{ .vars.retries }}", &ctx).expect("vars"),
            "orders:3"
        );
    }

    #[test]
    fn whitespace_inside_braces_is_ignored() {
        let ctx = context();
        assert_eq!(render("{{.env.HOST}}", &ctx).expect("tight"), "api.example.com");
        assert_eq!(
            render("{{   .env.HOST   }}", &ctx).expect("padded"),
            "api.example.com"
        );
    }

    #[test]
    fn bare_lookup_prefers_env_over_saved_over_vars() {
        let mut env = HashMap::new();
        env.insert("value".to_string(), "from-env".to_string());
        let base = RunContext::new("r", HashMap::new(), env, json!({"value": "from-vars"}));
        let mut ctx = base.fork_for_test();
        ctx.save("value", "from-runtime");

        assert_eq!(render("{{ value }}", &ctx).expect("env wins"), "from-env");

        let base = RunContext::new("r", HashMap::new(), HashMap::new(), json!({"value": "from-vars"}));
        let mut ctx = base.fork_for_test();
        ctx.save("value", "from-runtime");
        assert_eq!(
            render("{{ value }}", &ctx).expect("runtime wins"),
            "from-runtime"
        );

        let ctx = RunContext::new("r", HashMap::new(), HashMap::new(), json!({"value": "from-vars"}));
        assert_eq!(render("{{ value }}", &ctx).expect("vars win"), "from-vars");
    }

    #[test]
    fn undefined_reference_enumerates_bound_names() {
        let mut ctx = context().fork_for_test();
        ctx.save("user_id", "42");

        let error = render("{{ missing }}", &ctx).expect_err("undefined");
        assert_eq!(error.kind, rocketship_types::ErrorKind::TemplateError);
        assert!(error.message.contains("user_id"));
        assert!(error.message.contains("retries"));

        let error = render("{{ .env.MISSING }}", &ctx).expect_err("undefined env");
        assert!(error.message.contains("HOST"));
    }

    #[test]
    fn escaped_expressions_survive_one_render_pass() {
        let ctx = context();
        assert_eq!(
            render(r"describe \{{ .env.HOST }} here", &ctx).expect("escape"),
            "describe {{ .env.HOST }} here"
        );
    }

    #[test]
    fn render_is_a_fixed_point_on_resolved_text() {
        let ctx = context();
        let once = render("host={{ .env.HOST }}", &ctx).expect("first pass");
        let twice = render(&once, &ctx).expect("second pass");
        assert_eq!(once, twice);
    }

    #[test]
    fn render_value_walks_nested_structures() {
        let ctx = context();
        let config = json!({
            "url": "https://{{ .env.HOST }}/health",
            "limits": [{"service": "{{ .vars.service.name }}"}],
            "count": 2
        });
        let rendered = render_value(&config, &ctx).expect("render config");
        assert_eq!(rendered["url"], "https://api.example.com/health");
        assert_eq!(rendered["limits"][0]["service"], "orders");
        assert_eq!(rendered["count"], 2);
    }

    #[test]
    fn unterminated_expression_is_an_error() {
        let ctx = context();
        let error = render("{{ .env.HOST", &ctx).expect_err("unterminated");
        assert!(error.message.contains("unterminated"));
    }
}
