//! End-to-end substrate tests: queue -> worker pool -> engine
//!
//! Exercises the full execution path against the in-memory queue, which
//! carries the same claim semantics as the Postgres implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use weft_core::model::{
    Run, RunStatus, Step, Trigger, TriggeredBy, Workflow, WorkflowConfig, WorkflowStatus,
};
use weft_core::CredentialMap;
use weft_engine::{
    CallGuards, Engine, GuardConfig, InMemoryWorkQueue, ModuleRegistry, RunProcessor, WorkItem,
    WorkQueue, WorkerConfig, WorkerPool,
};

/// Storage-free run processor: workflows and finished runs live in maps
struct TestHarness {
    engine: Engine,
    workflows: HashMap<Uuid, Workflow>,
    /// Credentials per owning user
    credentials: HashMap<Uuid, CredentialMap>,
    finished: Mutex<Vec<Run>>,
}

#[async_trait]
impl RunProcessor for TestHarness {
    async fn process(
        &self,
        item: WorkItem,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunStatus> {
        let workflow = self.workflows.get(&item.workflow_id).expect("workflow exists");
        let run = queued_run(workflow, item.run_id);
        let credentials = self
            .credentials
            .get(&workflow.user_id)
            .cloned()
            .unwrap_or_default();

        let done = self
            .engine
            .execute(workflow, &run, item.input, credentials, cancel)
            .await;
        let status = done.status;
        self.finished.lock().push(done);
        Ok(status)
    }
}

fn queued_run(workflow: &Workflow, run_id: Uuid) -> Run {
    Run {
        id: run_id,
        workflow_id: workflow.id,
        user_id: workflow.user_id,
        organization_id: workflow.organization_id,
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

fn workflow(user_id: Uuid, steps: Vec<Step>) -> Workflow {
    Workflow {
        id: Uuid::now_v7(),
        user_id,
        organization_id: None,
        name: "test".into(),
        description: String::new(),
        status: WorkflowStatus::Active,
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

async fn drain(queue: &InMemoryWorkQueue, harness: &TestHarness, expected: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let depth = queue.depth().await.unwrap();
            if harness.finished.lock().len() == expected
                && depth.ready == 0
                && depth.in_flight == 0
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue should drain");
}

#[tokio::test]
async fn concurrent_enqueues_of_one_workflow_serialize_fifo() {
    let user = Uuid::now_v7();
    let wf = workflow(
        user,
        vec![
            step("wait", "utilities.sleep", json!({"ms": 200})),
            step("echo", "utilities.echo", json!({"v": "{{ input.tag }}"})),
        ],
    );

    let queue = Arc::new(InMemoryWorkQueue::new());
    let harness = Arc::new(TestHarness {
        engine: engine(),
        workflows: HashMap::from([(wf.id, wf.clone())]),
        credentials: HashMap::new(),
        finished: Mutex::new(Vec::new()),
    });

    // Three runs enqueued back to back
    let mut run_ids = Vec::new();
    for tag in ["first", "second", "third"] {
        let run_id = Uuid::now_v7();
        run_ids.push(run_id);
        queue
            .enqueue(wf.id, run_id, json!({"tag": tag}))
            .await
            .unwrap();
    }

    let pool = WorkerPool::new(
        Arc::clone(&queue) as Arc<dyn WorkQueue>,
        Arc::clone(&harness) as Arc<dyn RunProcessor>,
        WorkerConfig::default().with_worker_name("itest"),
    );

    let started = std::time::Instant::now();
    pool.start();
    drain(&queue, &harness, 3).await;
    let elapsed = started.elapsed();
    pool.shutdown().await.unwrap();

    // Serialized: three 200ms runs cannot overlap
    assert!(elapsed >= Duration::from_millis(600), "elapsed {elapsed:?}");

    let finished = harness.finished.lock();
    assert_eq!(finished.len(), 3);

    // Completion order matches enqueue order, and no run overlapped the next
    let ids: Vec<Uuid> = finished.iter().map(|r| r.id).collect();
    assert_eq!(ids, run_ids);
    for pair in finished.windows(2) {
        assert!(pair[0].finished_at.unwrap() <= pair[1].started_at.unwrap());
    }

    // Outputs correspond to FIFO inputs
    let outputs: Vec<&Value> = finished.iter().map(|r| r.output.as_ref().unwrap()).collect();
    assert_eq!(outputs, vec![&json!("first"), &json!("second"), &json!("third")]);
}

#[tokio::test]
async fn runs_observe_only_their_owners_credentials() {
    let user_a = Uuid::now_v7();
    let user_b = Uuid::now_v7();

    let wf_b = workflow(
        user_b,
        vec![step("key", "utilities.echo", json!({"v": "{{ openai }}"}))],
    );

    let mut creds_a = CredentialMap::new();
    creds_a.insert("openai".into(), json!("K_A"));
    let mut creds_b = CredentialMap::new();
    creds_b.insert("openai".into(), json!("K_B"));

    let queue = Arc::new(InMemoryWorkQueue::new());
    let harness = Arc::new(TestHarness {
        engine: engine(),
        workflows: HashMap::from([(wf_b.id, wf_b.clone())]),
        credentials: HashMap::from([(user_a, creds_a), (user_b, creds_b)]),
        finished: Mutex::new(Vec::new()),
    });

    queue
        .enqueue(wf_b.id, Uuid::now_v7(), json!({}))
        .await
        .unwrap();

    let pool = WorkerPool::new(
        Arc::clone(&queue) as Arc<dyn WorkQueue>,
        Arc::clone(&harness) as Arc<dyn RunProcessor>,
        WorkerConfig::default().with_worker_name("itest"),
    );
    pool.start();
    drain(&queue, &harness, 1).await;
    pool.shutdown().await.unwrap();

    let finished = harness.finished.lock();
    let run = &finished[0];
    assert_eq!(run.status, RunStatus::Success);

    // The module observed B's key and never A's
    assert_eq!(run.output, Some(json!("K_B")));
    let serialized = serde_json::to_string(&*run).unwrap();
    assert!(!serialized.contains("K_A"));
}

#[tokio::test]
async fn cancellation_via_heartbeat_stops_a_running_workflow() {
    let user = Uuid::now_v7();
    let wf = workflow(
        user,
        vec![step("wait", "utilities.sleep", json!({"ms": 30_000}))],
    );

    let queue = Arc::new(InMemoryWorkQueue::new());
    let harness = Arc::new(TestHarness {
        engine: engine(),
        workflows: HashMap::from([(wf.id, wf.clone())]),
        credentials: HashMap::new(),
        finished: Mutex::new(Vec::new()),
    });

    let run_id = Uuid::now_v7();
    queue.enqueue(wf.id, run_id, json!({})).await.unwrap();

    let mut config = WorkerConfig::default().with_worker_name("itest");
    config.heartbeat_interval = Duration::from_millis(50);
    let pool = WorkerPool::new(
        Arc::clone(&queue) as Arc<dyn WorkQueue>,
        Arc::clone(&harness) as Arc<dyn RunProcessor>,
        config,
    );
    pool.start();

    // Let the run start, then request cancellation out of band
    tokio::time::sleep(Duration::from_millis(200)).await;
    queue.request_cancel(run_id);

    drain(&queue, &harness, 1).await;
    pool.shutdown().await.unwrap();

    let finished = harness.finished.lock();
    assert_eq!(finished[0].status, RunStatus::Cancelled);
}
