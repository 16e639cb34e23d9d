//! End-to-end tests for the scheduler, driven through the `Engine` facade
//! with `MockNode` actions and the in-memory store.
//!
//! Timing-sensitive tests run on a paused clock so back-offs and timeouts
//! advance instantly and deterministically.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nodes::mock::{Journal, MockNode};
use nodes::{ExecutableNode, NodeCatalog};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::admission::AdmissionGate;
use crate::config::{EngineConfig, RetryPolicy};
use crate::error::{AdmissionError, EngineError};
use crate::events::{BroadcastEventPublisher, EngineEvent};
use crate::metrics::TracingMetrics;
use crate::models::{Edge, ExecutionStatus, FailureReason, NodeSpec, StepStatus, WorkflowDefinition};
use crate::scheduler::ExecutionScheduler;
use crate::step::StepExecutor;
use crate::store::InMemoryStore;
use crate::tenant::{InMemoryTenantRegistry, TenantLimits};
use crate::{Engine, WorkflowCompiler};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Every node uses its own id as node type, so each can be backed by its
/// own mock.
fn workflow(ids: &[&str], edges: &[(&str, &str)]) -> WorkflowDefinition {
    WorkflowDefinition::new(
        "test",
        ids.iter().map(|id| NodeSpec::new(*id, *id)).collect(),
        edges.iter().map(|(from, to)| Edge::new(*from, *to)).collect(),
    )
}

fn catalog(mocks: &[(&str, &Arc<MockNode>)]) -> NodeCatalog {
    let mut catalog = NodeCatalog::new();
    for (name, mock) in mocks {
        catalog.register_shared(*name, Arc::clone(*mock) as Arc<dyn ExecutableNode>);
    }
    catalog
}

fn engine_with(mocks: &[(&str, &Arc<MockNode>)], config: EngineConfig) -> (Engine, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::builder(catalog(mocks), store.clone()).config(config).build();
    (engine, store)
}

fn engine(mocks: &[(&str, &Arc<MockNode>)]) -> Engine {
    engine_with(mocks, EngineConfig::default()).0
}

fn ok(name: &str) -> Arc<MockNode> {
    Arc::new(MockNode::returning(name, json!({})))
}

fn start(engine: &Engine, def: &WorkflowDefinition, input: Value) -> Uuid {
    let plan = engine.compile_workflow(def).unwrap();
    engine.start_execution(plan, Uuid::new_v4(), input).unwrap()
}

fn statuses(execution: &crate::models::Execution) -> Vec<(&str, StepStatus)> {
    execution
        .steps
        .iter()
        .map(|s| (s.node_id.as_str(), s.status))
        .collect()
}

fn position(journal: &Journal, entry: &str) -> usize {
    let journal = journal.lock().unwrap();
    journal
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{entry} missing from {journal:?}"))
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failing_middle_step_skips_the_rest() {
    let a = ok("a");
    let b = Arc::new(MockNode::failing_retryable("b", "upstream api down"));
    let c = ok("c");
    let engine = engine(&[("a", &a), ("b", &b), ("c", &c)]);

    let def = workflow(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
    let id = start(&engine, &def, json!({}));
    let done = engine.wait_for_completion(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(
        statuses(&done),
        vec![("a", StepStatus::Succeeded), ("b", StepStatus::Failed), ("c", StepStatus::Skipped)]
    );
    match &done.failure {
        Some(FailureReason::StepFailed { node_id, message }) => {
            assert_eq!(node_id, "b");
            assert!(message.contains("upstream api down"));
        }
        other => panic!("unexpected failure: {other:?}"),
    }
    assert_eq!(b.call_count(), 3);
    assert_eq!(done.step("b").unwrap().attempt, 3);
    assert_eq!(c.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn diamond_joins_after_both_branches() {
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let a = Arc::new(MockNode::returning("a", json!({})).with_journal(journal.clone()));
    let b = Arc::new(
        MockNode::returning("b", json!({}))
            .with_delay(Duration::from_millis(10))
            .with_journal(journal.clone()),
    );
    let c = Arc::new(
        MockNode::returning("c", json!({}))
            .with_delay(Duration::from_millis(30))
            .with_journal(journal.clone()),
    );
    let d = Arc::new(MockNode::returning("d", json!({})).with_journal(journal.clone()));
    let engine = engine(&[("a", &a), ("b", &b), ("c", &c), ("d", &d)]);

    let def = workflow(&["a", "b", "c", "d"], &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
    let id = start(&engine, &def, json!({}));
    let done = engine.wait_for_completion(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Succeeded);
    assert!(done.steps.iter().all(|s| s.status == StepStatus::Succeeded));
    assert!(position(&journal, "start:d") > position(&journal, "end:b"));
    assert!(position(&journal, "start:d") > position(&journal, "end:c"));
    // b and c are independent, so they overlap.
    assert!(position(&journal, "start:c") < position(&journal, "end:b"));
}

#[tokio::test]
async fn tolerant_failure_hands_null_downstream() {
    let a = Arc::new(MockNode::failing_fatal("a", "bad row"));
    let b = ok("b");
    let engine = engine(&[("a", &a), ("b", &b)]);

    let mut def = workflow(&["a", "b"], &[("a", "b")]);
    def.nodes[0].tolerant = true;
    let id = start(&engine, &def, json!({ "row": 1 }));
    let done = engine.wait_for_completion(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Succeeded);
    assert_eq!(done.failure, None);
    let a_record = done.step("a").unwrap();
    assert_eq!(a_record.status, StepStatus::Failed);
    assert!(a_record.error.as_deref().unwrap().contains("bad row"));
    assert_eq!(done.step("b").unwrap().status, StepStatus::Succeeded);
    assert_eq!(*b.calls.lock().unwrap(), vec![Value::Null]);
}

#[tokio::test(start_paused = true)]
async fn flaky_step_succeeds_on_retry() {
    let a = Arc::new(MockNode::flaky("a", 2, json!({ "ok": true })));
    let engine = engine(&[("a", &a)]);

    let id = start(&engine, &workflow(&["a"], &[]), json!({}));
    let done = engine.wait_for_completion(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Succeeded);
    let record = done.step("a").unwrap();
    assert_eq!(record.attempt, 3);
    assert_eq!(record.output, Some(json!({ "node": "a", "ok": true })));
    assert_eq!(record.error, None);
}

#[tokio::test]
async fn fatal_failure_is_not_retried() {
    let a = Arc::new(MockNode::failing_fatal("a", "invalid credentials"));
    let engine = engine(&[("a", &a)]);

    let id = start(&engine, &workflow(&["a"], &[]), json!({}));
    let done = engine.wait_for_completion(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(a.call_count(), 1);
    assert_eq!(done.step("a").unwrap().attempt, 1);
}

#[tokio::test(start_paused = true)]
async fn timed_out_attempts_are_retried_then_fail() {
    let a = Arc::new(MockNode::returning("a", json!({})).with_delay(Duration::from_secs(5)));
    let engine = engine(&[("a", &a)]);

    let mut def = workflow(&["a"], &[]);
    def.nodes[0].timeout_ms = Some(100);
    def.nodes[0].retry = Some(RetryPolicy { max_attempts: 2, base_delay_ms: 10, max_delay_ms: 10 });
    let id = start(&engine, &def, json!({}));
    let done = engine.wait_for_completion(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Failed);
    let record = done.step("a").unwrap();
    assert_eq!(record.attempt, 2);
    assert!(record.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(a.call_count(), 2);
}

// ---------------------------------------------------------------------------
// Data flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inputs_follow_edges_and_slots() {
    let a = Arc::new(MockNode::returning("a", json!({ "total": 42 })));
    let b = ok("b");
    let c = ok("c");
    let engine = engine(&[("a", &a), ("b", &b), ("c", &c)]);

    let mut def = workflow(&["a", "b", "c"], &[("a", "c"), ("b", "c")]);
    def.edges[0].output_slot = Some("total".into());
    let id = start(&engine, &def, json!({ "seed": 1 }));
    let done = engine.wait_for_completion(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Succeeded);
    assert_eq!(*a.calls.lock().unwrap(), vec![json!({ "seed": 1 })]);
    assert_eq!(
        *c.calls.lock().unwrap(),
        vec![json!({ "a": 42, "b": { "node": "b" } })]
    );
}

// ---------------------------------------------------------------------------
// Cancellation and deadlines
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_lets_running_step_finish_and_dispatches_nothing_new() {
    let a = Arc::new(MockNode::returning("a", json!({})).with_delay(Duration::from_secs(1)));
    let b = ok("b");
    let engine = engine(&[("a", &a), ("b", &b)]);

    let id = start(&engine, &workflow(&["a", "b"], &[("a", "b")]), json!({}));
    engine.cancel_execution(id).await.unwrap();
    let done = engine.wait_for_completion(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Cancelled);
    assert_eq!(
        statuses(&done),
        vec![("a", StepStatus::Succeeded), ("b", StepStatus::Cancelled)]
    );
    assert_eq!(b.call_count(), 0);

    // Cancelling a finished execution is a no-op.
    engine.cancel_execution(id).await.unwrap();
    assert_eq!(engine.get_execution_status(id).await.unwrap(), done);
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_retry_backoff() {
    let a = Arc::new(MockNode::failing_retryable("a", "flapping"));
    let engine = engine(&[("a", &a)]);

    let mut def = workflow(&["a"], &[]);
    def.nodes[0].retry = Some(RetryPolicy { max_attempts: 5, base_delay_ms: 60_000, max_delay_ms: 60_000 });
    let id = start(&engine, &def, json!({}));
    tokio::time::sleep(Duration::from_secs(1)).await;
    engine.cancel_execution(id).await.unwrap();
    let done = engine.wait_for_completion(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Cancelled);
    assert_eq!(done.step("a").unwrap().status, StepStatus::Cancelled);
    assert_eq!(a.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn execution_deadline_fails_the_run() {
    let a = Arc::new(MockNode::returning("a", json!({})).with_delay(Duration::from_secs(2)));
    let b = ok("b");
    let config = EngineConfig { execution_timeout_ms: 500, ..EngineConfig::default() };
    let (engine, _) = engine_with(&[("a", &a), ("b", &b)], config);

    let id = start(&engine, &workflow(&["a", "b"], &[("a", "b")]), json!({}));
    let done = engine.wait_for_completion(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert_eq!(done.failure, Some(FailureReason::ExecutionTimeout));
    assert_eq!(done.step("b").unwrap().status, StepStatus::Cancelled);
    assert_eq!(b.call_count(), 0);
}

// ---------------------------------------------------------------------------
// Concurrency and admission
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrency_ceiling_is_respected() {
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));
    let ids = ["n1", "n2", "n3", "n4", "n5"];
    let mocks: Vec<Arc<MockNode>> = ids
        .iter()
        .map(|id| {
            Arc::new(
                MockNode::returning(*id, json!({}))
                    .with_delay(Duration::from_millis(50))
                    .with_journal(journal.clone()),
            )
        })
        .collect();
    let named: Vec<(&str, &Arc<MockNode>)> = ids.iter().copied().zip(mocks.iter()).collect();
    let engine = engine(&named);

    let mut def = workflow(&ids, &[]);
    def.settings.max_concurrency = Some(2);
    let id = start(&engine, &def, json!({}));
    let done = engine.wait_for_completion(id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Succeeded);

    let journal = journal.lock().unwrap().clone();
    let mut running = 0i32;
    let mut peak = 0;
    for entry in &journal {
        running += if entry.starts_with("start:") { 1 } else { -1 };
        peak = peak.max(running);
    }
    assert_eq!(peak, 2);
    // Lowest topological index goes first.
    assert_eq!(&journal[..2], &["start:n1".to_string(), "start:n2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn tenant_capacity_frees_on_terminal_status() {
    let a = Arc::new(MockNode::returning("a", json!({})).with_delay(Duration::from_millis(100)));
    let tenant_id = Uuid::new_v4();
    let registry = Arc::new(InMemoryTenantRegistry::new(TenantLimits::default()));
    registry.set(tenant_id, TenantLimits { max_concurrent_executions: 1, max_steps_per_workflow: 10 });
    let engine = Engine::builder(catalog(&[("a", &a)]), Arc::new(InMemoryStore::new()))
        .tenants(registry)
        .build();
    let plan = engine.compile_workflow(&workflow(&["a"], &[])).unwrap();

    let first = engine.start_execution(plan.clone(), tenant_id, json!({})).unwrap();
    let err = engine.start_execution(plan.clone(), tenant_id, json!({})).unwrap_err();
    assert_eq!(err, AdmissionError::TenantAtCapacity { tenant_id, limit: 1 });

    // Other tenants are unaffected.
    engine.start_execution(plan.clone(), Uuid::new_v4(), json!({})).unwrap();

    engine.wait_for_completion(first).await.unwrap();
    assert_eq!(engine.gate().quota(tenant_id).current_running, 0);
    engine.start_execution(plan, tenant_id, json!({})).unwrap();
}

#[tokio::test]
async fn step_limit_rejects_large_plans() {
    let a = ok("a");
    let b = ok("b");
    let tenant_id = Uuid::new_v4();
    let registry = Arc::new(InMemoryTenantRegistry::new(TenantLimits::default()));
    registry.set(tenant_id, TenantLimits { max_concurrent_executions: 5, max_steps_per_workflow: 1 });
    let engine = Engine::builder(catalog(&[("a", &a), ("b", &b)]), Arc::new(InMemoryStore::new()))
        .tenants(registry)
        .build();
    let plan = engine.compile_workflow(&workflow(&["a", "b"], &[("a", "b")])).unwrap();

    let err = engine.start_execution(plan, tenant_id, json!({})).unwrap_err();
    assert_eq!(err, AdmissionError::StepLimitExceeded { steps: 2, limit: 1 });
    assert_eq!(engine.gate().quota(tenant_id).current_running, 0);
}

// ---------------------------------------------------------------------------
// Status, persistence and infrastructure failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn terminal_status_is_stable_and_persisted() {
    let a = ok("a");
    let (engine, store) = engine_with(&[("a", &a)], EngineConfig::default());

    let id = start(&engine, &workflow(&["a"], &[]), json!({ "k": "v" }));
    let done = engine.wait_for_completion(id).await.unwrap();

    let first = engine.get_execution_status(id).await.unwrap();
    let second = engine.get_execution_status(id).await.unwrap();
    assert_eq!(first, done);
    assert_eq!(first, second);

    let stored = crate::store::ExecutionStore::load_execution(store.as_ref(), id).await.unwrap();
    assert_eq!(stored, done);
    assert_eq!(store.step_record(id, "a").unwrap().status, StepStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn transient_store_failures_are_retried() {
    let a = ok("a");
    let (engine, store) = engine_with(&[("a", &a)], EngineConfig::default());
    store.fail_next_writes(2);

    let id = start(&engine, &workflow(&["a"], &[]), json!({}));
    let done = engine.wait_for_completion(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn persistent_store_failure_fails_the_execution() {
    let a = ok("a");
    let (engine, store) = engine_with(&[("a", &a)], EngineConfig::default());
    store.fail_next_writes(100);

    let id = start(&engine, &workflow(&["a"], &[]), json!({}));
    let done = engine.wait_for_completion(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert!(matches!(done.failure, Some(FailureReason::InfrastructureError { .. })));
    assert_eq!(done.step("a").unwrap().status, StepStatus::Cancelled);
    assert_eq!(a.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unavailable_executor_fails_with_infrastructure_error() {
    let a = ok("a");
    let config = EngineConfig::default();
    // The plan is compiled against a catalog that knows "a"; the executor's
    // catalog does not.
    let compiler = WorkflowCompiler::new(Arc::new(catalog(&[("a", &a)])), &config);
    let plan = Arc::new(compiler.compile(&workflow(&["a"], &[])).unwrap());
    let scheduler = ExecutionScheduler::new(
        Arc::new(StepExecutor::new(Arc::new(NodeCatalog::new()))),
        Arc::new(InMemoryStore::new()),
        Arc::new(TracingMetrics),
        Arc::new(BroadcastEventPublisher::new(16)),
        &config,
    );
    let gate = AdmissionGate::new(Arc::new(InMemoryTenantRegistry::new(TenantLimits::default())));
    let tenant_id = Uuid::new_v4();

    let id = scheduler.start(plan, tenant_id, json!({}), gate.reserve(tenant_id).unwrap());
    let done = scheduler.wait_for_terminal(id).await.unwrap();

    assert_eq!(done.status, ExecutionStatus::Failed);
    assert!(matches!(done.failure, Some(FailureReason::InfrastructureError { .. })));
    let record = done.step("a").unwrap();
    assert_eq!(record.status, StepStatus::Failed);
    assert_eq!(record.attempt, 0);
    assert_eq!(a.call_count(), 0);
    assert_eq!(gate.quota(tenant_id).current_running, 0);
}

#[tokio::test(start_paused = true)]
async fn finished_executions_leave_memory_after_retention() {
    let a = ok("a");
    let config = EngineConfig { terminal_retention_ms: 1_000, ..EngineConfig::default() };
    let catalog = Arc::new(catalog(&[("a", &a)]));
    let plan = Arc::new(
        WorkflowCompiler::new(catalog.clone(), &config)
            .compile(&workflow(&["a"], &[]))
            .unwrap(),
    );
    let scheduler = ExecutionScheduler::new(
        Arc::new(StepExecutor::new(catalog)),
        Arc::new(InMemoryStore::new()),
        Arc::new(TracingMetrics),
        Arc::new(BroadcastEventPublisher::new(16)),
        &config,
    );
    let gate = AdmissionGate::new(Arc::new(InMemoryTenantRegistry::new(TenantLimits::default())));
    let tenant_id = Uuid::new_v4();

    let mut last = Uuid::nil();
    for _ in 0..200 {
        last = scheduler.start(plan.clone(), tenant_id, json!({}), gate.reserve(tenant_id).unwrap());
        let done = scheduler.wait_for_terminal(last).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Succeeded);
    }
    assert!(scheduler.status(last).is_some());

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(scheduler.tracked(), 0);
    assert!(scheduler.status(last).is_none());
}

#[tokio::test(start_paused = true)]
async fn evicted_execution_is_read_back_from_store() {
    let a = ok("a");
    let config = EngineConfig { terminal_retention_ms: 1_000, ..EngineConfig::default() };
    let (engine, _) = engine_with(&[("a", &a)], config);

    let id = start(&engine, &workflow(&["a"], &[]), json!({ "k": "v" }));
    let done = engine.wait_for_completion(id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(engine.get_execution_status(id).await.unwrap(), done);
    assert_eq!(engine.wait_for_completion(id).await.unwrap(), done);
    engine.cancel_execution(id).await.unwrap();
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let a = ok("a");
    let events = Arc::new(BroadcastEventPublisher::new(64));
    let mut rx = events.subscribe();
    let engine = Engine::builder(catalog(&[("a", &a)]), Arc::new(InMemoryStore::new()))
        .events(events)
        .build();

    let id = start(&engine, &workflow(&["a"], &[]), json!({}));
    engine.wait_for_completion(id).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(match event {
            EngineEvent::Execution(e) => format!("execution:{}", e.status),
            EngineEvent::Step(s) => format!("{}:{}", s.node_id, s.status),
        });
    }
    assert_eq!(
        seen,
        vec!["execution:running", "a:running", "a:succeeded", "execution:succeeded"]
    );
}

#[tokio::test]
async fn unknown_execution_cannot_be_awaited() {
    let engine = engine(&[]);
    let err = engine.wait_for_completion(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownExecution(_)));
}
