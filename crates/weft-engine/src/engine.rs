//! The execution engine: workflow document in, terminal run out
//!
//! `execute` never returns an error to its caller; every failure lands
//! inside the returned [`Run`]. Steps run sequentially in declaration
//! order. Only a `loop` step with `parallel: true` and an explicit
//! concurrency limit runs work concurrently, and its aggregate output is
//! indexed by iteration number.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use weft_core::model::{LoopSpec, Run, RunStatus, Step, StepResult, StepStatus, Workflow};
use weft_core::{
    evaluate_expression_or_template, interpolate_value, CredentialMap, ErrorKind, ModuleError,
    RunContext, RunError,
};

use crate::registry::{ModuleContext, ModuleRegistry, NullStateBackend, StateBackend};
use crate::resilience::{CallGuards, RetryPolicy};

/// Interprets workflow documents against the module registry
///
/// One engine serves every concurrent run in the worker; per-run state
/// lives on the stack of `execute`.
pub struct Engine {
    registry: Arc<ModuleRegistry>,
    guards: Arc<CallGuards>,
    http: reqwest::Client,
    state: Arc<dyn StateBackend>,
    /// Whitelisted environment variables projected as `env.*`
    env: HashMap<String, String>,
}

impl Engine {
    pub fn new(registry: Arc<ModuleRegistry>, guards: Arc<CallGuards>) -> Self {
        Self {
            registry,
            guards,
            http: reqwest::Client::new(),
            state: Arc::new(NullStateBackend),
            env: HashMap::new(),
        }
    }

    pub fn with_state_backend(mut self, state: Arc<dyn StateBackend>) -> Self {
        self.state = state;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Execute a workflow to a terminal run
    ///
    /// The whole run is bounded by the workflow's configured timeout;
    /// exceeding it drops in-flight step work (best effort) and marks the
    /// run with a timeout error. Cancellation is observed at every
    /// suspension point. Credential plaintext lives in the run context for
    /// the duration of this call and is dropped with it.
    #[instrument(skip_all, fields(workflow_id = %workflow.id, run_id = %run.id))]
    pub async fn execute(
        &self,
        workflow: &Workflow,
        run: &Run,
        input: Value,
        credentials: CredentialMap,
        cancel: CancellationToken,
    ) -> Run {
        let mut out = run.clone();
        let started_at = Utc::now();
        out.status = RunStatus::Running;
        out.started_at = Some(started_at);

        let credentials = Arc::new(credentials);
        let mut ctx = RunContext::new(workflow.id, run.id);
        ctx.set_input(input);
        ctx.set_credentials(&credentials);
        if !self.env.is_empty() {
            ctx.set_env(self.env.clone());
        }

        // Step results live outside the raced future so a timeout keeps
        // everything completed so far.
        let results: Arc<Mutex<Vec<StepResult>>> = Arc::new(Mutex::new(Vec::new()));

        let timeout = Duration::from_millis(workflow.config.timeout);
        let body = self.run_steps(
            workflow,
            run,
            &mut ctx,
            &credentials,
            Arc::clone(&results),
            cancel.clone(),
        );

        let (status, error, output) = tokio::select! {
            outcome = body => match outcome {
                Ok(output) => (RunStatus::Success, None, output),
                Err(err) => {
                    let status = if err.kind == ErrorKind::Cancelled {
                        RunStatus::Cancelled
                    } else {
                        RunStatus::Error
                    };
                    (status, Some(err), None)
                }
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_ms = workflow.config.timeout, "run timed out");
                (RunStatus::Error, Some(RunError::timeout(workflow.config.timeout)), None)
            }
            _ = cancel.cancelled() => {
                (RunStatus::Cancelled, Some(RunError::cancelled()), None)
            }
        };

        out.steps = results.lock().clone();
        out.status = status;
        out.error = error;
        out.output = output;
        out.finished_at = Some(Utc::now());

        info!(status = %out.status, steps = out.steps.len(), "run finished");
        out
    }

    /// The sequential step loop; returns the run output
    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        workflow: &Workflow,
        run: &Run,
        ctx: &mut RunContext,
        credentials: &Arc<CredentialMap>,
        results: Arc<Mutex<Vec<StepResult>>>,
        cancel: CancellationToken,
    ) -> Result<Option<Value>, RunError> {
        let mut last_output: Option<Value> = None;

        for step in &workflow.config.steps {
            if cancel.is_cancelled() {
                return Err(RunError::cancelled());
            }

            let result = self
                .exec_step(workflow, run, step, ctx, credentials, &cancel)
                .await;
            let failed = matches!(result.status, StepStatus::Error | StepStatus::Cancelled);
            let was_cancelled = result.status == StepStatus::Cancelled;
            let step_error = result.error.clone();

            if result.status == StepStatus::Success {
                if let Some(output) = &result.output {
                    ctx.bind_step_output(&step.id, output.clone());
                    if let Some(alias) = &step.output_as {
                        ctx.bind_alias(alias, output.clone());
                    }
                    last_output = Some(output.clone());
                }
            }
            results.lock().push(result);

            if failed {
                // Cancellation always ends the run; continue_on_error only
                // spans ordinary step failures.
                if step.continue_on_error && !was_cancelled {
                    continue;
                }
                let err = step_error
                    .as_ref()
                    .map(RunError::from)
                    .unwrap_or_else(|| RunError::new(ErrorKind::Internal, "step failed"));
                return Err(err);
            }
        }

        // Explicit return value wins; otherwise the last non-skipped output
        if let Some(expr) = &workflow.config.return_value {
            let value = evaluate_expression_or_template(expr, ctx)
                .map_err(|e| RunError::new(ErrorKind::Validation, e.to_string()))?;
            return Ok(Some(value.into_json()));
        }
        Ok(last_output)
    }

    /// Execute one step: condition, loop handling, module invocation
    async fn exec_step(
        &self,
        workflow: &Workflow,
        run: &Run,
        step: &Step,
        ctx: &mut RunContext,
        credentials: &Arc<CredentialMap>,
        cancel: &CancellationToken,
    ) -> StepResult {
        let started_at = Utc::now();

        if let Some(condition) = &step.condition {
            match evaluate_expression_or_template(condition, ctx) {
                Ok(v) if !v.is_truthy() => {
                    return StepResult::skipped(&step.id, started_at);
                }
                Ok(_) => {}
                Err(e) => {
                    return step_failure(
                        step,
                        started_at,
                        ModuleError::validation(format!("bad condition: {e}")),
                        1,
                    );
                }
            }
        }

        let outcome = match &step.loop_spec {
            Some(spec) => {
                self.exec_loop(workflow, run, step, spec, ctx, credentials, cancel)
                    .await
            }
            None => match interpolate_value(&step.inputs, ctx) {
                Ok(interpolated) => {
                    self.invoke_with_retry(workflow, run, step, interpolated, credentials, cancel)
                        .await
                }
                Err(e) => Err((ModuleError::validation(format!("bad inputs: {e}")), 1)),
            },
        };

        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        match outcome {
            Ok((output, attempts)) => StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Success,
                output: Some(output),
                error: None,
                started_at,
                finished_at,
                duration_ms,
                attempts,
            },
            Err((error, attempts)) => StepResult {
                step_id: step.id.clone(),
                status: if error.kind == ErrorKind::Cancelled {
                    StepStatus::Cancelled
                } else {
                    StepStatus::Error
                },
                output: None,
                error: Some(error),
                started_at,
                finished_at,
                duration_ms,
                attempts,
            },
        }
    }

    /// Iterate the step body over a sequence
    ///
    /// Sequential by default; `parallel: true` with an explicit concurrency
    /// limit fans iterations out with no cross-iteration ordering. The
    /// aggregate output is always indexed by iteration number.
    #[allow(clippy::too_many_arguments)]
    async fn exec_loop(
        &self,
        workflow: &Workflow,
        run: &Run,
        step: &Step,
        spec: &LoopSpec,
        ctx: &mut RunContext,
        credentials: &Arc<CredentialMap>,
        cancel: &CancellationToken,
    ) -> Result<(Value, u32), (ModuleError, u32)> {
        let over = evaluate_expression_or_template(&spec.over, ctx)
            .map_err(|e| (ModuleError::validation(format!("bad loop expression: {e}")), 1))?;
        let items = match over.into_json() {
            Value::Array(items) => items,
            other => {
                return Err((
                    ModuleError::validation(format!(
                        "loop expression must produce an array, got {}",
                        type_name(&other)
                    )),
                    1,
                ))
            }
        };

        let mut total_attempts = 0u32;

        if spec.parallel {
            let limit = spec.concurrency.unwrap_or(1).max(1);
            let semaphore = Arc::new(tokio::sync::Semaphore::new(limit));
            let mut join_set = JoinSet::new();

            for (index, item) in items.into_iter().enumerate() {
                let mut iter_ctx = ctx.clone();
                iter_ctx.set_var(&spec.as_name, item);
                let inputs = interpolate_value(&step.inputs, &iter_ctx)
                    .map_err(|e| (ModuleError::validation(format!("bad inputs: {e}")), 1))?;

                let engine = self.clone_refs();
                let workflow = workflow.clone();
                let run = run.clone();
                let step = step.clone();
                let credentials = Arc::clone(credentials);
                let cancel = cancel.clone();
                let semaphore = Arc::clone(&semaphore);

                join_set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let result = engine
                        .invoke_with_retry(&workflow, &run, &step, inputs, &credentials, &cancel)
                        .await;
                    (index, result)
                });
            }

            let mut outputs: Vec<(usize, Value)> = Vec::new();
            let mut first_error: Option<ModuleError> = None;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((index, Ok((value, attempts)))) => {
                        total_attempts += attempts;
                        outputs.push((index, value));
                    }
                    Ok((_, Err((err, attempts)))) => {
                        total_attempts += attempts;
                        if first_error.is_none() {
                            first_error = Some(err);
                            join_set.abort_all();
                        }
                    }
                    Err(join_err) if join_err.is_cancelled() => {}
                    Err(join_err) => {
                        if first_error.is_none() {
                            first_error =
                                Some(ModuleError::internal(format!("loop task failed: {join_err}")));
                        }
                    }
                }
            }
            if let Some(err) = first_error {
                return Err((err, total_attempts.max(1)));
            }

            outputs.sort_by_key(|(index, _)| *index);
            let collected: Vec<Value> = outputs.into_iter().map(|(_, v)| v).collect();
            Ok((Value::Array(collected), total_attempts.max(1)))
        } else {
            let mut collected = Vec::with_capacity(items.len());
            for item in items {
                if cancel.is_cancelled() {
                    ctx.remove_var(&spec.as_name);
                    return Err((
                        ModuleError::new(ErrorKind::Cancelled, "run was cancelled"),
                        total_attempts.max(1),
                    ));
                }
                ctx.set_var(&spec.as_name, item);
                let inputs = match interpolate_value(&step.inputs, ctx) {
                    Ok(v) => v,
                    Err(e) => {
                        ctx.remove_var(&spec.as_name);
                        return Err((ModuleError::validation(format!("bad inputs: {e}")), 1));
                    }
                };
                match self
                    .invoke_with_retry(workflow, run, step, inputs, credentials, cancel)
                    .await
                {
                    Ok((value, attempts)) => {
                        total_attempts += attempts;
                        collected.push(value);
                    }
                    Err((err, attempts)) => {
                        ctx.remove_var(&spec.as_name);
                        return Err((err, total_attempts + attempts));
                    }
                }
            }
            ctx.remove_var(&spec.as_name);
            Ok((Value::Array(collected), total_attempts.max(1)))
        }
    }

    /// Resolve and invoke the module under the step's retry policy
    async fn invoke_with_retry(
        &self,
        workflow: &Workflow,
        run: &Run,
        step: &Step,
        inputs: Value,
        credentials: &Arc<CredentialMap>,
        cancel: &CancellationToken,
    ) -> Result<(Value, u32), (ModuleError, u32)> {
        let Some(handler) = self.registry.get(&step.module) else {
            return Err((
                ModuleError::validation(format!("unknown module '{}'", step.module)),
                1,
            ));
        };

        let retries = step.retries.unwrap_or(workflow.config.retries);
        let policy = RetryPolicy::for_retries(retries);

        let module_ctx = ModuleContext::new(
            run.id,
            workflow.id,
            run.user_id,
            Arc::clone(credentials),
            self.http.clone(),
            Arc::clone(&self.state),
        );

        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err((
                    ModuleError::new(ErrorKind::Cancelled, "run was cancelled"),
                    attempt,
                ));
            }

            let handler = Arc::clone(&handler);
            let call_inputs = inputs.clone();
            let call_ctx = module_ctx.clone();
            let result = self
                .guards
                .invoke(&step.module, move || handler(call_inputs, call_ctx))
                .await;

            match result {
                Ok(value) => return Ok((value, attempt)),
                Err(err) => {
                    if !policy.should_retry(&err, attempt) {
                        return Err((err, attempt));
                    }
                    let delay = policy.delay_for_attempt(attempt + 1, Some(&err));
                    tracing::debug!(
                        step = %step.id,
                        module = %step.module,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        kind = %err.kind,
                        "retrying step after transient failure"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err((
                                ModuleError::new(ErrorKind::Cancelled, "run was cancelled"),
                                attempt,
                            ));
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Shallow handle for parallel loop tasks
    fn clone_refs(&self) -> Engine {
        Engine {
            registry: Arc::clone(&self.registry),
            guards: Arc::clone(&self.guards),
            http: self.http.clone(),
            state: Arc::clone(&self.state),
            env: self.env.clone(),
        }
    }
}

fn step_failure(
    step: &Step,
    started_at: chrono::DateTime<Utc>,
    error: ModuleError,
    attempts: u32,
) -> StepResult {
    let finished_at = Utc::now();
    StepResult {
        step_id: step.id.clone(),
        status: StepStatus::Error,
        output: None,
        error: Some(error),
        started_at,
        finished_at,
        duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        attempts,
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleRegistry;
    use crate::resilience::{CircuitBreakerConfig, GuardConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;
    use weft_core::model::{Trigger, TriggeredBy, WorkflowConfig};

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow {
            id: Uuid::now_v7(),
            user_id: Uuid::now_v7(),
            organization_id: None,
            name: "test".into(),
            description: String::new(),
            status: weft_core::model::WorkflowStatus::Active,
            trigger: Trigger::Manual,
            config: WorkflowConfig {
                steps,
                ..Default::default()
            },
            metadata: None,
            run_count: 0,
            last_run_at: None,
            last_run_status: None,
            last_run_output: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn queued_run(wf: &Workflow) -> Run {
        Run {
            id: Uuid::now_v7(),
            workflow_id: wf.id,
            user_id: wf.user_id,
            organization_id: None,
            triggered_by: TriggeredBy::Manual,
            scheduled_for: None,
            status: RunStatus::Queued,
            steps: vec![],
            error: None,
            output: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }

    fn step(id: &str, module: &str, inputs: Value) -> Step {
        Step {
            id: id.into(),
            module: module.into(),
            inputs,
            output_as: None,
            condition: None,
            loop_spec: None,
            retries: None,
            continue_on_error: false,
        }
    }

    fn engine() -> Engine {
        let mut registry = ModuleRegistry::new();
        registry.preload();
        Engine::new(
            Arc::new(registry),
            Arc::new(CallGuards::new(GuardConfig::default())),
        )
    }

    fn engine_with<F>(customize: F) -> Engine
    where
        F: FnOnce(&mut ModuleRegistry),
    {
        let mut registry = ModuleRegistry::new();
        registry.preload();
        customize(&mut registry);
        Engine::new(
            Arc::new(registry),
            Arc::new(CallGuards::new(GuardConfig::default())),
        )
    }

    async fn run_workflow(engine: &Engine, wf: &Workflow, input: Value) -> Run {
        let run = queued_run(wf);
        engine
            .execute(wf, &run, input, CredentialMap::new(), CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_single_step_success() {
        let wf = workflow(vec![step(
            "a",
            "utilities.string.upper",
            json!({"text": "hi"}),
        )]);
        let run = run_workflow(&engine(), &wf, json!({})).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.output, Some(json!("HI")));
        assert_eq!(run.steps.len(), 1);
        assert_eq!(run.steps[0].status, StepStatus::Success);
        assert_eq!(run.steps[0].attempts, 1);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_interpolation_and_chaining() {
        let mut first = step("x", "utilities.echo", json!({"v": 5}));
        first.output_as = Some("n".into());
        let second = step("y", "utilities.math.add", json!({"a": "{{ n }}", "b": 3}));

        let wf = workflow(vec![first, second]);
        let run = run_workflow(&engine(), &wf, json!({})).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.steps[1].output, Some(json!(8)));
        assert_eq!(run.output, Some(json!(8)));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_to_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_module = Arc::clone(&calls);
        let engine = engine_with(move |registry| {
            registry.register("test.flaky", move |_inputs, _ctx| {
                let calls = Arc::clone(&calls_in_module);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ModuleError::from_status(503, "upstream hiccup"))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            });
        });

        let mut s = step("a", "test.flaky", json!({}));
        s.retries = Some(2);
        let wf = workflow(vec![s]);
        let run = run_workflow(&engine, &wf, json!({})).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.steps[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_module = Arc::clone(&calls);
        let engine = engine_with(move |registry| {
            registry.register("test.denied", move |_inputs, _ctx| {
                let calls = Arc::clone(&calls_in_module);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ModuleError::from_status(403, "forbidden"))
                }
            });
        });

        let mut s = step("a", "test.denied", json!({}));
        s.retries = Some(5);
        let wf = workflow(vec![s]);
        let run = run_workflow(&engine, &wf, json!({})).await;

        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.steps[0].attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(run.error.as_ref().unwrap().kind, ErrorKind::PermanentUpstream);
    }

    #[tokio::test]
    async fn test_condition_skips_step() {
        let mut gated = step("a", "utilities.string.upper", json!({"text": "x"}));
        gated.condition = Some("input.enabled".into());
        let after = step("b", "utilities.echo", json!({"v": "ran"}));

        let wf = workflow(vec![gated, after]);
        let run = run_workflow(&engine(), &wf, json!({"enabled": false})).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.steps[0].status, StepStatus::Skipped);
        assert_eq!(run.steps[1].status, StepStatus::Success);
        // The skipped step contributes no output
        assert_eq!(run.output, Some(json!("ran")));
    }

    #[tokio::test]
    async fn test_unknown_module_is_validation_error() {
        let wf = workflow(vec![step("a", "social.mastodon.boost", json!({}))]);
        let run = run_workflow(&engine(), &wf, json!({})).await;

        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error.as_ref().unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let mut failing = step("a", "no.such.module", json!({}));
        failing.continue_on_error = true;
        let after = step("b", "utilities.echo", json!({"v": 1}));

        let wf = workflow(vec![failing, after]);
        let run = run_workflow(&engine(), &wf, json!({})).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.steps[0].status, StepStatus::Error);
        assert_eq!(run.steps[1].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_sequential_loop_collects_outputs() {
        let mut looped = step("a", "utilities.string.upper", json!({"text": "{{ item }}"}));
        looped.loop_spec = Some(LoopSpec {
            over: "input.words".into(),
            as_name: "item".into(),
            parallel: false,
            concurrency: None,
        });

        let wf = workflow(vec![looped]);
        let run = run_workflow(&engine(), &wf, json!({"words": ["a", "b", "c"]})).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.output, Some(json!(["A", "B", "C"])));
    }

    #[tokio::test]
    async fn test_parallel_loop_outputs_indexed_by_iteration() {
        let mut looped = step("a", "utilities.echo", json!({"v": "{{ item }}"}));
        looped.loop_spec = Some(LoopSpec {
            over: "input.items".into(),
            as_name: "item".into(),
            parallel: true,
            concurrency: Some(3),
        });

        let wf = workflow(vec![looped]);
        let run = run_workflow(&engine(), &wf, json!({"items": [1, 2, 3, 4, 5]})).await;

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.output, Some(json!([1, 2, 3, 4, 5])));
    }

    #[tokio::test]
    async fn test_loop_over_non_array_fails_validation() {
        let mut looped = step("a", "utilities.echo", json!({"v": 1}));
        looped.loop_spec = Some(LoopSpec {
            over: "input.not_a_list".into(),
            as_name: "item".into(),
            parallel: false,
            concurrency: None,
        });

        let wf = workflow(vec![looped]);
        let run = run_workflow(&engine(), &wf, json!({"not_a_list": 42})).await;

        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error.as_ref().unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_return_value_expression() {
        let mut wf = workflow(vec![step("a", "utilities.echo", json!({"v": 5}))]);
        wf.config.return_value = Some("{{ steps.a + 1 }}".into());

        let run = run_workflow(&engine(), &wf, json!({})).await;
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.output, Some(json!(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_bounds_duration() {
        let mut wf = workflow(vec![step("a", "utilities.sleep", json!({"ms": 60_000}))]);
        wf.config.timeout = 100;

        let run = run_workflow(&engine(), &wf, json!({})).await;
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_cancellation_produces_cancelled_run() {
        let engine = engine();
        let wf = workflow(vec![step("a", "utilities.sleep", json!({"ms": 10_000}))]);
        let run = queued_run(&wf);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let done = engine
            .execute(&wf, &run, json!({}), CredentialMap::new(), cancel)
            .await;
        assert_eq!(done.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_credentials_reach_module_and_context() {
        let engine = engine_with(|registry| {
            registry.register("test.whoami", |_inputs, ctx| async move {
                Ok(ctx.credential("openai").cloned().unwrap_or(Value::Null))
            });
        });

        let key_step = step("k", "test.whoami", json!({}));
        let tmpl_step = step(
            "t",
            "utilities.echo",
            json!({"v": "{{ credential.openai }}"}),
        );
        let wf = workflow(vec![key_step, tmpl_step]);
        let run = queued_run(&wf);

        let mut creds = CredentialMap::new();
        creds.insert("openai".into(), json!("sk-user-b"));

        let done = engine
            .execute(&wf, &run, json!({}), creds, CancellationToken::new())
            .await;
        assert_eq!(done.status, RunStatus::Success);
        assert_eq!(done.steps[0].output, Some(json!("sk-user-b")));
        assert_eq!(done.steps[1].output, Some(json!("sk-user-b")));
    }

    #[tokio::test]
    async fn test_breaker_open_fails_fast_with_kind() {
        let mut registry = ModuleRegistry::new();
        registry.register("test.broken", |_inputs, _ctx| async {
            Err(ModuleError::from_status(500, "boom"))
        });
        let guards = CallGuards::new(GuardConfig::default());
        guards.configure_breaker(
            "test.broken",
            CircuitBreakerConfig::default().with_volume_threshold(10),
        );
        let engine = Engine::new(Arc::new(registry), Arc::new(guards));

        let wf = workflow(vec![step("a", "test.broken", json!({}))]);
        // Ten failing runs trip the breaker
        for _ in 0..10 {
            let run = queued_run(&wf);
            let done = engine
                .execute(&wf, &run, json!({}), CredentialMap::new(), CancellationToken::new())
                .await;
            assert_eq!(done.status, RunStatus::Error);
        }

        let run = queued_run(&wf);
        let done = engine
            .execute(&wf, &run, json!({}), CredentialMap::new(), CancellationToken::new())
            .await;
        assert_eq!(done.error.as_ref().unwrap().kind, ErrorKind::BreakerOpen);
    }

    #[tokio::test]
    async fn test_terminal_run_fields_set() {
        let wf = workflow(vec![step("a", "utilities.echo", json!({"v": 1}))]);
        let run = run_workflow(&engine(), &wf, json!({})).await;

        assert!(run.status.is_terminal());
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_some());
        assert!(run.finished_at >= run.started_at);
    }
}
