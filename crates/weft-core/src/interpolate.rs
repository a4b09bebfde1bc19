//! Template interpolation over step inputs
//!
//! Walks a JSON tree and expands `{{ expr }}` templates in string leaves.
//! A string that is exactly one template keeps the expression's type; a
//! template embedded in a larger string is stringified in place.

use serde_json::Value;

use crate::context::RunContext;
use crate::expr::{evaluate, ExprError, ExprValue};

/// Recursively interpolate every string leaf of a JSON value
pub fn interpolate_value(value: &Value, ctx: &RunContext) -> Result<Value, ExprError> {
    match value {
        Value::String(s) => interpolate_string(s, ctx),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_value(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_value(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Interpolate one string
///
/// Strings without `{{` pass through untouched. A whole-string template
/// (`{{ e }}` with only surrounding whitespace) is replaced by the
/// expression's value with its type intact.
pub fn interpolate_string(s: &str, ctx: &RunContext) -> Result<Value, ExprError> {
    if !s.contains("{{") {
        return Ok(Value::String(s.to_string()));
    }

    if let Some(expr) = whole_template(s) {
        return Ok(evaluate(expr, ctx)?.into_json());
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let expr = &after[..end];
                out.push_str(&evaluate(expr, ctx)?.to_display_string());
                rest = &after[end + 2..];
            }
            None => {
                // Unclosed template: keep the literal text
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// Evaluate a string that may be either a bare expression or a template
///
/// Used for `condition`, `loop.over` and `returnValue` fields, where authors
/// write both `input.enabled` and `{{ input.enabled }}`.
pub fn evaluate_expression_or_template(s: &str, ctx: &RunContext) -> Result<ExprValue, ExprError> {
    match whole_template(s) {
        Some(expr) => evaluate(expr, ctx),
        None if s.contains("{{") => Ok(ExprValue::Value(interpolate_string(s, ctx)?)),
        None => evaluate(s, ctx),
    }
}

/// The inner expression when `s` is exactly one `{{ ... }}` template
fn whole_template(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}
