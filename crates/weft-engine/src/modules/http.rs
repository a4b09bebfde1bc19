//! `http.request`: generic outbound HTTP call
//!
//! The escape hatch for services without a dedicated integration module.
//! Failures are classified by status code so the step retry policy and the
//! circuit breaker see the right kinds.

use serde_json::{json, Map, Value};

use weft_core::ModuleError;

use crate::registry::{ModuleContext, ModuleFn, ModuleResult};

pub(crate) fn register(modules: &mut Vec<(String, Result<ModuleFn, String>)>) {
    super::entry(modules, "http.request", request);
}

async fn request(inputs: Value, ctx: ModuleContext) -> ModuleResult {
    let url = inputs
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| ModuleError::validation("expected a string input 'url'"))?;
    let method = inputs
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .to_uppercase();

    let method: reqwest::Method = method
        .parse()
        .map_err(|_| ModuleError::validation(format!("invalid HTTP method '{method}'")))?;

    let mut req = ctx.http().request(method, url);

    if let Some(headers) = inputs.get("headers").and_then(Value::as_object) {
        for (name, value) in headers {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            req = req.header(name.as_str(), value);
        }
    }

    if let Some(body) = inputs.get("body") {
        req = match body {
            Value::String(s) => req.body(s.clone()),
            other => req.json(other),
        };
    }

    let response = req.send().await.map_err(|e| {
        if e.is_timeout() {
            ModuleError::timeout(format!("request to {url} timed out"))
        } else {
            ModuleError::transient(format!("request to {url} failed: {e}"))
        }
    })?;

    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let mut headers = Map::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.to_string(), Value::String(v.to_string()));
        }
    }

    let text = response
        .text()
        .await
        .map_err(|e| ModuleError::transient(format!("failed to read response body: {e}")))?;

    if status >= 400 {
        let mut err = ModuleError::from_status(status, format!("HTTP {status} from {url}"));
        if let Some(secs) = retry_after {
            err = err.with_retry_after(secs);
        }
        return Err(err);
    }

    // Body decodes as JSON when it is JSON, otherwise stays a string
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

    Ok(json!({
        "status": status,
        "headers": Value::Object(headers),
        "body": body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_rejects_missing_url() {
        let ctx = ModuleContext::bare(Uuid::nil(), Uuid::nil());
        let err = request(json!({"method": "GET"}), ctx).await.unwrap_err();
        assert_eq!(err.kind, weft_core::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_rejects_bad_method() {
        let ctx = ModuleContext::bare(Uuid::nil(), Uuid::nil());
        let err = request(
            json!({"url": "http://localhost:1", "method": "NOT A METHOD"}),
            ctx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, weft_core::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_connection_failure_is_transient() {
        let ctx = ModuleContext::bare(Uuid::nil(), Uuid::nil());
        // Nothing listens on this port
        let err = request(json!({"url": "http://127.0.0.1:9/none"}), ctx)
            .await
            .unwrap_err();
        assert!(err.retryable());
    }
}
