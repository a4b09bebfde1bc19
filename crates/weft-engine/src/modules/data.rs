//! `data.*` modules: JSON helpers and the durable per-workflow state store

use serde_json::{json, Value};

use weft_core::ModuleError;

use crate::registry::{ModuleContext, ModuleFn, ModuleResult};

pub(crate) fn register(modules: &mut Vec<(String, Result<ModuleFn, String>)>) {
    super::entry(modules, "data.json.parse", json_parse);
    super::entry(modules, "data.json.stringify", json_stringify);
    super::entry(modules, "data.state.get", state_get);
    super::entry(modules, "data.state.set", state_set);
}

async fn json_parse(inputs: Value, _ctx: ModuleContext) -> ModuleResult {
    let text = inputs
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| ModuleError::validation("expected a string input 'text'"))?;
    serde_json::from_str(text)
        .map_err(|e| ModuleError::validation(format!("invalid JSON: {e}")))
}

async fn json_stringify(inputs: Value, _ctx: ModuleContext) -> ModuleResult {
    let value = inputs
        .get("value")
        .ok_or_else(|| ModuleError::validation("missing input 'value'"))?;
    let pretty = inputs
        .get("pretty")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let text = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .map_err(|e| ModuleError::internal(format!("serialization failed: {e}")))?;
    Ok(Value::String(text))
}

fn key_input(inputs: &Value) -> Result<&str, ModuleError> {
    inputs
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| ModuleError::validation("expected a string input 'key'"))
}

/// Read a key from the workflow's durable state store
async fn state_get(inputs: Value, ctx: ModuleContext) -> ModuleResult {
    let key = key_input(&inputs)?;
    let value = ctx.state().load(ctx.workflow_id, key).await?;
    Ok(value.unwrap_or(Value::Null))
}

/// Write a key to the workflow's durable state store
async fn state_set(inputs: Value, ctx: ModuleContext) -> ModuleResult {
    let key = key_input(&inputs)?;
    let value = inputs
        .get("value")
        .ok_or_else(|| ModuleError::validation("missing input 'value'"))?;
    ctx.state().save(ctx.workflow_id, key, value).await?;
    Ok(json!({ "key": key, "saved": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx() -> ModuleContext {
        ModuleContext::bare(Uuid::nil(), Uuid::nil())
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let parsed = json_parse(json!({"text": "{\"a\":[1,2]}"}), ctx())
            .await
            .unwrap();
        assert_eq!(parsed, json!({"a": [1, 2]}));

        let text = json_stringify(json!({"value": {"a": [1, 2]}}), ctx())
            .await
            .unwrap();
        assert_eq!(text, json!("{\"a\":[1,2]}"));
    }

    #[tokio::test]
    async fn test_json_parse_invalid() {
        let err = json_parse(json!({"text": "{nope"}), ctx()).await.unwrap_err();
        assert_eq!(err.kind, weft_core::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_state_get_without_backend_is_null() {
        let out = state_get(json!({"key": "counter"}), ctx()).await.unwrap();
        assert_eq!(out, Value::Null);
    }

    #[tokio::test]
    async fn test_state_set_without_backend_fails() {
        let err = state_set(json!({"key": "counter", "value": 1}), ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, weft_core::ErrorKind::Internal);
    }
}
