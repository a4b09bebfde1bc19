//! `utilities.*` modules: string, math, time and flow helpers

use serde_json::{json, Value};

use weft_core::ModuleError;

use crate::registry::{ModuleContext, ModuleFn, ModuleResult};

pub(crate) fn register(modules: &mut Vec<(String, Result<ModuleFn, String>)>) {
    super::entry(modules, "utilities.string.upper", string_upper);
    super::entry(modules, "utilities.string.lower", string_lower);
    super::entry(modules, "utilities.string.concat", string_concat);
    super::entry(modules, "utilities.echo", echo);
    super::entry(modules, "utilities.math.add", math_add);
    super::entry(modules, "utilities.sleep", sleep);
    super::entry(modules, "utilities.time.now", time_now);
}

fn text_input(inputs: &Value) -> Result<String, ModuleError> {
    inputs
        .get("text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ModuleError::validation("expected a string input 'text'"))
}

async fn string_upper(inputs: Value, _ctx: ModuleContext) -> ModuleResult {
    Ok(Value::String(text_input(&inputs)?.to_uppercase()))
}

async fn string_lower(inputs: Value, _ctx: ModuleContext) -> ModuleResult {
    Ok(Value::String(text_input(&inputs)?.to_lowercase()))
}

/// Join `parts` with an optional `separator`
async fn string_concat(inputs: Value, _ctx: ModuleContext) -> ModuleResult {
    let parts = inputs
        .get("parts")
        .and_then(Value::as_array)
        .ok_or_else(|| ModuleError::validation("expected an array input 'parts'"))?;
    let sep = inputs
        .get("separator")
        .and_then(Value::as_str)
        .unwrap_or("");
    let joined = parts
        .iter()
        .map(|p| match p {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(sep);
    Ok(Value::String(joined))
}

/// Return the input unchanged
///
/// With a single input key the bare value is returned, so
/// `{"v": 5}` echoes `5`; with several keys the whole map comes back.
async fn echo(inputs: Value, _ctx: ModuleContext) -> ModuleResult {
    match &inputs {
        Value::Object(map) if map.len() == 1 => Ok(map.values().next().cloned().unwrap()),
        other => Ok(other.clone()),
    }
}

fn numeric(inputs: &Value, key: &str) -> Result<f64, ModuleError> {
    let v = inputs
        .get(key)
        .ok_or_else(|| ModuleError::validation(format!("missing numeric input '{key}'")))?;
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ModuleError::validation(format!("input '{key}' is not finite"))),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| ModuleError::validation(format!("input '{key}' is not a number"))),
        _ => Err(ModuleError::validation(format!(
            "input '{key}' is not a number"
        ))),
    }
}

async fn math_add(inputs: Value, _ctx: ModuleContext) -> ModuleResult {
    let sum = numeric(&inputs, "a")? + numeric(&inputs, "b")?;
    if sum.fract() == 0.0 && sum.abs() < (i64::MAX as f64) {
        Ok(json!(sum as i64))
    } else {
        Ok(json!(sum))
    }
}

/// Suspend for `ms` milliseconds; a deliberate suspension point
async fn sleep(inputs: Value, _ctx: ModuleContext) -> ModuleResult {
    let ms = inputs.get("ms").and_then(Value::as_u64).unwrap_or(0);
    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    Ok(json!({ "slept_ms": ms }))
}

async fn time_now(_inputs: Value, _ctx: ModuleContext) -> ModuleResult {
    Ok(json!(chrono::Utc::now().to_rfc3339()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx() -> ModuleContext {
        ModuleContext::bare(Uuid::nil(), Uuid::nil())
    }

    #[tokio::test]
    async fn test_string_upper() {
        let out = string_upper(json!({"text": "hi"}), ctx()).await.unwrap();
        assert_eq!(out, json!("HI"));
    }

    #[tokio::test]
    async fn test_string_upper_requires_text() {
        let err = string_upper(json!({"value": "hi"}), ctx()).await.unwrap_err();
        assert_eq!(err.kind, weft_core::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_echo_unwraps_single_key() {
        assert_eq!(echo(json!({"v": 5}), ctx()).await.unwrap(), json!(5));
        assert_eq!(
            echo(json!({"a": 1, "b": 2}), ctx()).await.unwrap(),
            json!({"a": 1, "b": 2})
        );
    }

    #[tokio::test]
    async fn test_math_add() {
        assert_eq!(
            math_add(json!({"a": 5, "b": 3}), ctx()).await.unwrap(),
            json!(8)
        );
        assert_eq!(
            math_add(json!({"a": "5", "b": 3}), ctx()).await.unwrap(),
            json!(8)
        );
        assert_eq!(
            math_add(json!({"a": 0.5, "b": 1}), ctx()).await.unwrap(),
            json!(1.5)
        );
        assert!(math_add(json!({"a": "x", "b": 3}), ctx()).await.is_err());
    }

    #[tokio::test]
    async fn test_concat() {
        let out = string_concat(
            json!({"parts": ["a", "b", 3], "separator": "-"}),
            ctx(),
        )
        .await
        .unwrap();
        assert_eq!(out, json!("a-b-3"));
    }
}
