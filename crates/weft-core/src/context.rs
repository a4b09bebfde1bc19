//! Per-run variable scope
//!
//! A single owned map consulted during interpolation. Step outputs form a
//! tree rooted at `steps`, keyed by step id; `outputAs` bindings are extra
//! top-level keys holding the same value. Credential plaintext lives only
//! here and is discarded when the run completes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Plaintext credential map materialized for one run
pub type CredentialMap = HashMap<String, Value>;

/// Variable scope for one run
#[derive(Debug, Clone)]
pub struct RunContext {
    vars: Map<String, Value>,
}

impl RunContext {
    pub fn new(workflow_id: Uuid, run_id: Uuid) -> Self {
        let mut vars = Map::new();
        vars.insert("workflowId".into(), Value::String(workflow_id.to_string()));
        vars.insert("runId".into(), Value::String(run_id.to_string()));
        vars.insert("steps".into(), Value::Object(Map::new()));
        Self { vars }
    }

    /// Bind trigger-supplied parameters under `input.*`
    pub fn set_input(&mut self, input: Value) {
        self.vars.insert("input".into(), input);
    }

    /// Project the credential map under `user.*`, `credential.*`, and each
    /// bare platform name
    ///
    /// All three spellings resolve to the same value. Bare platform names
    /// never overwrite keys already present in the scope.
    pub fn set_credentials(&mut self, creds: &CredentialMap) {
        let projected: Map<String, Value> =
            creds.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.vars
            .insert("credential".into(), Value::Object(projected.clone()));
        self.vars.insert("user".into(), Value::Object(projected));

        for (platform, secret) in creds {
            if !self.vars.contains_key(platform) {
                self.vars.insert(platform.clone(), secret.clone());
            }
        }
    }

    /// Expose whitelisted environment variables under `env.*`
    pub fn set_env(&mut self, env: HashMap<String, String>) {
        let projected: Map<String, Value> = env
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        self.vars.insert("env".into(), Value::Object(projected));
    }

    /// Bind a completed step's output under `steps.<stepId>`
    pub fn bind_step_output(&mut self, step_id: &str, output: Value) {
        if let Some(Value::Object(steps)) = self.vars.get_mut("steps") {
            steps.insert(step_id.to_string(), output);
        }
    }

    /// Bind an `outputAs` alias as a top-level key
    pub fn bind_alias(&mut self, name: &str, output: Value) {
        self.vars.insert(name.to_string(), output);
    }

    /// Bind a loop iteration variable
    pub fn set_var(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    /// Remove a loop iteration variable when the loop ends
    pub fn remove_var(&mut self, name: &str) {
        self.vars.remove(name);
    }

    /// Resolve a root identifier
    pub fn get_root(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Output of a completed step, if any
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.vars.get("steps")?.get(step_id)
    }

    /// Clock consulted by the `now()` function
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_present() {
        let wf = Uuid::now_v7();
        let run = Uuid::now_v7();
        let ctx = RunContext::new(wf, run);
        assert_eq!(ctx.get_root("workflowId"), Some(&json!(wf.to_string())));
        assert_eq!(ctx.get_root("runId"), Some(&json!(run.to_string())));
    }

    #[test]
    fn test_credential_projections_agree() {
        let mut ctx = RunContext::new(Uuid::nil(), Uuid::nil());
        let mut creds = CredentialMap::new();
        creds.insert("openai".into(), json!("sk-123"));
        ctx.set_credentials(&creds);

        assert_eq!(ctx.get_root("openai"), Some(&json!("sk-123")));
        assert_eq!(
            ctx.get_root("credential").unwrap().get("openai"),
            Some(&json!("sk-123"))
        );
        assert_eq!(
            ctx.get_root("user").unwrap().get("openai"),
            Some(&json!("sk-123"))
        );
    }

    #[test]
    fn test_platform_name_never_shadows_existing_key() {
        let mut ctx = RunContext::new(Uuid::nil(), Uuid::nil());
        ctx.set_input(json!({ "q": 1 }));
        let mut creds = CredentialMap::new();
        creds.insert("input".into(), json!("sneaky"));
        ctx.set_credentials(&creds);

        // `input` keeps the trigger parameters; the projection is still
        // reachable through `credential.input`.
        assert_eq!(ctx.get_root("input"), Some(&json!({ "q": 1 })));
        assert_eq!(
            ctx.get_root("credential").unwrap().get("input"),
            Some(&json!("sneaky"))
        );
    }

    #[test]
    fn test_step_and_alias_binding() {
        let mut ctx = RunContext::new(Uuid::nil(), Uuid::nil());
        ctx.bind_step_output("x", json!(5));
        ctx.bind_alias("n", json!(5));

        assert_eq!(ctx.step_output("x"), Some(&json!(5)));
        assert_eq!(ctx.get_root("n"), Some(&json!(5)));
    }

    #[test]
    fn test_loop_var_lifecycle() {
        let mut ctx = RunContext::new(Uuid::nil(), Uuid::nil());
        ctx.set_var("item", json!("a"));
        assert_eq!(ctx.get_root("item"), Some(&json!("a")));
        ctx.remove_var("item");
        assert_eq!(ctx.get_root("item"), None);
    }
}
