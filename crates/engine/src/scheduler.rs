//! Execution scheduler.
//!
//! `ExecutionScheduler::start` spawns one task per execution. That task owns
//! the [`Execution`] record and walks the plan:
//! 1. Steps whose upstream steps have all settled enter a ready-set ordered
//!    by topological index.
//! 2. Ready steps are dispatched onto a `JoinSet` up to the plan's
//!    concurrency ceiling. Each step task runs its attempts through the
//!    [`StepExecutor`], retrying with back-off per the step's policy.
//! 3. Completed steps release their downstream steps, or skip them when a
//!    non-tolerant step failed.
//! 4. Once nothing is in flight the execution is finalized, its tenant slot
//!    released, and a terminal snapshot published.
//!
//! Callers observe progress through a `watch` channel of snapshots. A
//! finished execution leaves the in-memory table after the configured
//! retention; the store answers for it from then on.

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use nodes::ExecutionContext;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::admission::TenantSlot;
use crate::config::{EngineConfig, RetryPolicy};
use crate::error::StoreError;
use crate::events::{EventPublisher, ExecutionEvent, StepEvent};
use crate::metrics::MetricsRecorder;
use crate::models::{CompiledPlan, Execution, ExecutionStatus, FailureReason, StepStatus};
use crate::step::StepExecutor;
use crate::store::ExecutionStore;

// ---------------------------------------------------------------------------
// ExecutionScheduler
// ---------------------------------------------------------------------------

struct ExecutionHandle {
    snapshot: watch::Receiver<Execution>,
    cancel: CancellationToken,
}

/// Runs executions and tracks the ones started by this process.
///
/// Cloning is cheap; clones share the same execution table.
#[derive(Clone)]
pub struct ExecutionScheduler {
    executor: Arc<StepExecutor>,
    store: Arc<dyn ExecutionStore>,
    metrics: Arc<dyn MetricsRecorder>,
    events: Arc<dyn EventPublisher>,
    execution_timeout: Duration,
    infra_retry: RetryPolicy,
    terminal_retention: Duration,
    executions: Arc<DashMap<Uuid, ExecutionHandle>>,
}

impl ExecutionScheduler {
    pub fn new(
        executor: Arc<StepExecutor>,
        store: Arc<dyn ExecutionStore>,
        metrics: Arc<dyn MetricsRecorder>,
        events: Arc<dyn EventPublisher>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            executor,
            store,
            metrics,
            events,
            execution_timeout: config.execution_timeout(),
            infra_retry: config.infra_retry,
            terminal_retention: config.terminal_retention(),
            executions: Arc::new(DashMap::new()),
        }
    }

    /// Start running `plan` and return the new execution's id at once.
    ///
    /// `slot` is the tenant's admission reservation; it is released when the
    /// execution reaches a terminal status.
    pub fn start(
        &self,
        plan: Arc<CompiledPlan>,
        tenant_id: Uuid,
        trigger_input: Value,
        slot: TenantSlot,
    ) -> Uuid {
        let execution = Execution::new(&plan, tenant_id, trigger_input);
        let execution_id = execution.id;
        let (snapshot_tx, snapshot_rx) = watch::channel(execution.clone());
        let cancel = CancellationToken::new();

        self.executions.insert(
            execution_id,
            ExecutionHandle { snapshot: snapshot_rx, cancel: cancel.clone() },
        );

        let span = info_span!(
            "execution",
            %execution_id,
            workflow_id = %plan.workflow_id,
            %tenant_id,
        );
        let run = ExecutionRun {
            scheduler: self.clone(),
            waiting_on: plan.steps.iter().map(|s| s.upstream.len()).collect(),
            plan,
            execution,
            ready: BTreeSet::new(),
            halted: None,
            snapshot: snapshot_tx,
            interrupt: cancel.child_token(),
            cancel,
            slot: Some(slot),
        };
        tokio::spawn(run.drive().instrument(span));

        execution_id
    }

    /// Number of executions still held in memory, running or recently
    /// finished.
    pub fn tracked(&self) -> usize {
        self.executions.len()
    }

    /// Latest snapshot of an execution started by this scheduler.
    ///
    /// Finished executions are dropped from memory after the configured
    /// retention; `None` then means "ask the store".
    pub fn status(&self, execution_id: Uuid) -> Option<Execution> {
        self.executions
            .get(&execution_id)
            .map(|handle| handle.snapshot.borrow().clone())
    }

    /// Request cooperative cancellation. Returns `false` when the execution
    /// is unknown to this scheduler. Cancelling a terminal execution is a
    /// no-op.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.executions.get(&execution_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until the execution is terminal and return that snapshot.
    ///
    /// If the run task dies before finishing, the last published snapshot is
    /// returned instead.
    pub async fn wait_for_terminal(&self, execution_id: Uuid) -> Option<Execution> {
        let mut snapshot = self.executions.get(&execution_id)?.snapshot.clone();
        let terminal = snapshot
            .wait_for(|e| e.status.is_terminal())
            .await
            .map(|e| e.clone());
        match terminal {
            Ok(execution) => Some(execution),
            Err(_) => Some(snapshot.borrow().clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// One execution run
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Halt {
    Cancelled,
    Failed(FailureReason),
}

struct ExecutionRun {
    scheduler: ExecutionScheduler,
    plan: Arc<CompiledPlan>,
    execution: Execution,
    /// Unsettled upstream steps per step.
    waiting_on: Vec<usize>,
    /// Dispatchable steps, lowest topological index first.
    ready: BTreeSet<usize>,
    /// First reason the run stopped dispatching, if any.
    halted: Option<Halt>,
    snapshot: watch::Sender<Execution>,
    cancel: CancellationToken,
    /// Cut short retry back-offs once the run halts for any reason.
    interrupt: CancellationToken,
    slot: Option<TenantSlot>,
}

impl ExecutionRun {
    async fn drive(mut self) {
        let started = Instant::now();
        let deadline_at = started
            .checked_add(self.scheduler.execution_timeout)
            .unwrap_or_else(|| started + Duration::from_secs(86_400 * 365));
        let deadline = tokio::time::sleep_until(deadline_at);
        tokio::pin!(deadline);

        self.execution.status = ExecutionStatus::Running;
        self.execution.started_at = Some(Utc::now());
        self.scheduler.metrics.record_execution_started(self.execution.tenant_id);
        info!(steps = self.plan.len(), "execution started");
        if let Err(e) = self.persist_execution().await {
            self.halt_on_store_error("saving execution", e);
        }
        self.publish_execution_event();
        self.publish_snapshot();

        for step in self.plan.steps.iter().filter(|s| s.upstream.is_empty()) {
            self.execution.steps[step.index].status = StepStatus::Ready;
            self.ready.insert(step.index);
        }

        let mut in_flight: JoinSet<StepReport> = JoinSet::new();
        loop {
            if self.halted.is_none() {
                while in_flight.len() < self.plan.max_concurrency {
                    let Some(index) = self.ready.pop_first() else { break };
                    if let Some(task) = self.dispatch(index).await {
                        let span = info_span!("step", node_id = %self.plan.steps[index].node_id);
                        in_flight.spawn(task.run().instrument(span));
                    }
                    if self.halted.is_some() {
                        break;
                    }
                }
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => match joined {
                    Some(Ok(report)) => self.settle(report).await,
                    Some(Err(e)) => {
                        error!("step task failed: {e}");
                        self.halt(Halt::Failed(FailureReason::InfrastructureError {
                            message: format!("step task failed: {e}"),
                        }));
                    }
                    None => break,
                },
                _ = self.cancel.cancelled(), if self.halted.is_none() => {
                    info!("cancellation requested");
                    self.halt(Halt::Cancelled);
                }
                _ = &mut deadline, if self.halted.is_none() => {
                    warn!(timeout = ?self.scheduler.execution_timeout, "execution timed out");
                    self.halt(Halt::Failed(FailureReason::ExecutionTimeout));
                }
            }
        }

        self.finalize(started.elapsed()).await;
    }

    /// Mark the step running and build its task. Returns `None` when the
    /// running state could not be persisted; the run is halted then.
    async fn dispatch(&mut self, index: usize) -> Option<StepTask> {
        let input = self.resolve_input(index);
        let record = &mut self.execution.steps[index];
        let previous = record.clone();
        record.status = StepStatus::Running;
        record.started_at = Some(Utc::now());

        if let Err(e) = self.persist_step(index).await {
            self.execution.steps[index] = previous;
            self.halt_on_store_error("saving step", e);
            return None;
        }
        self.publish_step_event(index);
        self.publish_snapshot();

        Some(StepTask {
            executor: self.scheduler.executor.clone(),
            plan: self.plan.clone(),
            index,
            input,
            workflow_id: self.execution.workflow_id,
            execution_id: self.execution.id,
            tenant_id: self.execution.tenant_id,
            infra_retry: self.scheduler.infra_retry,
            interrupt: self.interrupt.clone(),
        })
    }

    /// Entry steps get the trigger input. A single upstream passes its output
    /// through; several upstreams are merged into an object keyed by node id.
    fn resolve_input(&self, index: usize) -> Value {
        let upstream_value = |u: &crate::models::Upstream| {
            let output = self.execution.steps[u.index].output.clone().unwrap_or(Value::Null);
            match &u.output_slot {
                Some(key) => output.get(key).cloned().unwrap_or(Value::Null),
                None => output,
            }
        };

        match self.plan.steps[index].upstream.as_slice() {
            [] => self.execution.trigger_input.clone(),
            [single] => upstream_value(single),
            many => Value::Object(
                many.iter()
                    .map(|u| (u.node_id.clone(), upstream_value(u)))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    async fn settle(&mut self, report: StepReport) {
        let index = report.index;
        let plan = self.plan.clone();
        let step = &plan.steps[index];

        let record = &mut self.execution.steps[index];
        record.attempt = report.attempts;
        record.finished_at = Some(Utc::now());

        let mut halt = None;
        let mut released = false;
        match report.result {
            StepResult::Succeeded(output) => {
                record.status = StepStatus::Succeeded;
                record.output = Some(output);
                released = true;
                info!(node_id = %step.node_id, attempts = report.attempts, "step succeeded");
            }
            StepResult::Failed(message) if step.tolerant => {
                warn!(node_id = %step.node_id, "tolerant step failed, continuing: {message}");
                record.status = StepStatus::Failed;
                record.error = Some(message);
                released = true;
            }
            StepResult::Failed(message) => {
                error!(node_id = %step.node_id, attempts = report.attempts, "step failed: {message}");
                record.status = StepStatus::Failed;
                record.error = Some(message.clone());
                halt = Some(Halt::Failed(FailureReason::StepFailed {
                    node_id: step.node_id.clone(),
                    message,
                }));
            }
            StepResult::Infrastructure(message) => {
                error!(node_id = %step.node_id, "step could not be executed: {message}");
                record.status = StepStatus::Failed;
                record.error = Some(message.clone());
                halt = Some(Halt::Failed(FailureReason::InfrastructureError { message }));
            }
            StepResult::Interrupted => {
                // Only a halt or a cancel request interrupts a step.
                info!(node_id = %step.node_id, "retry interrupted");
                record.status = StepStatus::Cancelled;
                halt = Some(Halt::Cancelled);
            }
        }
        let status = record.status;

        self.scheduler.metrics.record_step_completed(self.execution.tenant_id, status);
        self.publish_step_event(index);
        if let Err(e) = self.persist_step(index).await {
            self.halt_on_store_error("saving step", e);
        }

        if released {
            self.release_downstream(index);
        } else if status == StepStatus::Failed {
            self.skip_downstream(index).await;
        }
        if let Some(halt) = halt {
            self.halt(halt);
        }
        self.publish_snapshot();
    }

    fn release_downstream(&mut self, index: usize) {
        for &next in &self.plan.steps[index].downstream {
            self.waiting_on[next] = self.waiting_on[next].saturating_sub(1);
            let record = &mut self.execution.steps[next];
            if self.waiting_on[next] == 0 && record.status == StepStatus::Pending && self.halted.is_none() {
                record.status = StepStatus::Ready;
                self.ready.insert(next);
            }
        }
    }

    /// Settle every transitive downstream step of `index` as `Skipped`.
    async fn skip_downstream(&mut self, index: usize) {
        let plan = self.plan.clone();
        let mut queue: VecDeque<usize> = plan.steps[index].downstream.iter().copied().collect();
        let mut skipped = Vec::new();

        while let Some(next) = queue.pop_front() {
            let record = &mut self.execution.steps[next];
            if !matches!(record.status, StepStatus::Pending | StepStatus::Ready) {
                continue;
            }
            record.status = StepStatus::Skipped;
            record.finished_at = Some(Utc::now());
            self.ready.remove(&next);
            skipped.push(next);
            queue.extend(plan.steps[next].downstream.iter().copied());
        }

        for next in skipped {
            self.scheduler
                .metrics
                .record_step_completed(self.execution.tenant_id, StepStatus::Skipped);
            self.publish_step_event(next);
            if let Err(e) = self.persist_step(next).await {
                self.halt_on_store_error("saving step", e);
            }
        }
    }

    /// Stop dispatching. The first halt decides the final status.
    fn halt(&mut self, halt: Halt) {
        if self.halted.is_none() {
            self.halted = Some(halt);
            self.interrupt.cancel();
        }
    }

    fn halt_on_store_error(&mut self, what: &str, e: StoreError) {
        error!("{what} failed after retries: {e}");
        self.halt(Halt::Failed(FailureReason::InfrastructureError {
            message: format!("{what}: {e}"),
        }));
    }

    async fn finalize(mut self, elapsed: Duration) {
        let now = Utc::now();
        let unsettled: Vec<usize> = self
            .execution
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.status.is_settled())
            .map(|(i, _)| i)
            .collect();
        for &index in &unsettled {
            let record = &mut self.execution.steps[index];
            record.status = StepStatus::Cancelled;
            record.finished_at = Some(now);
            self.scheduler
                .metrics
                .record_step_completed(self.execution.tenant_id, StepStatus::Cancelled);
            self.publish_step_event(index);
            if let Err(e) = self.persist_step(index).await {
                error!("saving cancelled step failed after retries: {e}");
            }
        }

        let (status, failure) = match self.halted.take() {
            None => (ExecutionStatus::Succeeded, None),
            Some(Halt::Cancelled) => (ExecutionStatus::Cancelled, None),
            Some(Halt::Failed(reason)) => (ExecutionStatus::Failed, Some(reason)),
        };
        self.execution.status = status;
        self.execution.failure = failure;
        self.execution.finished_at = Some(now);

        if let Err(e) = self.persist_execution().await {
            error!("saving terminal execution failed after retries: {e}");
            self.execution.status = ExecutionStatus::Failed;
            self.execution.failure = Some(FailureReason::InfrastructureError {
                message: format!("saving execution: {e}"),
            });
        }

        let tenant_id = self.execution.tenant_id;
        self.scheduler.metrics.record_execution_completed(tenant_id, self.execution.status);
        self.scheduler.metrics.record_execution_duration(tenant_id, elapsed);
        self.publish_execution_event();

        // Free the tenant slot before anyone can observe the terminal status.
        drop(self.slot.take());
        info!(status = %self.execution.status, elapsed_ms = elapsed.as_millis() as u64, "execution finished");
        self.publish_snapshot();

        let scheduler = self.scheduler.clone();
        let execution_id = self.execution.id;
        drop(self);
        tokio::time::sleep(scheduler.terminal_retention).await;
        scheduler.executions.remove(&execution_id);
    }

    // -- persistence and notifications -------------------------------------

    async fn persist_execution(&self) -> Result<(), StoreError> {
        let store = &self.scheduler.store;
        let execution = &self.execution;
        with_infra_retry(self.scheduler.infra_retry, "saving execution", move || {
            store.save_execution(execution)
        })
        .await
    }

    async fn persist_step(&self, index: usize) -> Result<(), StoreError> {
        let store = &self.scheduler.store;
        let execution_id = self.execution.id;
        let record = &self.execution.steps[index];
        with_infra_retry(self.scheduler.infra_retry, "saving step", move || {
            store.save_step_execution(execution_id, record)
        })
        .await
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.execution.clone());
    }

    fn publish_execution_event(&self) {
        self.scheduler.events.publish_execution_event(ExecutionEvent {
            execution_id: self.execution.id,
            tenant_id: self.execution.tenant_id,
            workflow_id: self.execution.workflow_id,
            status: self.execution.status,
            at: Utc::now(),
        });
    }

    fn publish_step_event(&self, index: usize) {
        let record = &self.execution.steps[index];
        self.scheduler.events.publish_step_event(StepEvent {
            execution_id: self.execution.id,
            tenant_id: self.execution.tenant_id,
            node_id: record.node_id.clone(),
            status: record.status,
            attempt: record.attempt,
            at: Utc::now(),
        });
    }
}

/// Retry `op` per `policy`, returning the last error once attempts run out.
async fn with_infra_retry<F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= policy.attempts() => return Err(e),
            Err(e) => {
                let delay = policy.backoff(attempt);
                warn!(attempt, ?delay, "{what} failed, retrying: {e}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// One step, all of its attempts
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum StepResult {
    Succeeded(Value),
    /// Attempts exhausted, or a non-retryable failure.
    Failed(String),
    /// The run halted while the step waited to retry.
    Interrupted,
    /// The executor stayed unavailable through every infrastructure retry.
    Infrastructure(String),
}

#[derive(Debug)]
struct StepReport {
    index: usize,
    attempts: u32,
    result: StepResult,
}

struct StepTask {
    executor: Arc<StepExecutor>,
    plan: Arc<CompiledPlan>,
    index: usize,
    input: Value,
    workflow_id: Uuid,
    execution_id: Uuid,
    tenant_id: Uuid,
    infra_retry: RetryPolicy,
    interrupt: CancellationToken,
}

impl StepTask {
    async fn run(self) -> StepReport {
        let step = &self.plan.steps[self.index];
        let mut attempts = 0u32;
        let mut unavailable = 0u32;

        let result = loop {
            let attempt = attempts + 1;
            let ctx = ExecutionContext {
                workflow_id: self.workflow_id,
                execution_id: self.execution_id,
                tenant_id: self.tenant_id,
                node_id: step.node_id.clone(),
                parameters: step.parameters.clone(),
                attempt,
                deadline: Instant::now() + step.timeout,
            };

            let failure = match self.executor.run(step, self.input.clone(), ctx).await {
                Err(e) => {
                    unavailable += 1;
                    if unavailable >= self.infra_retry.attempts() {
                        break StepResult::Infrastructure(e.to_string());
                    }
                    let delay = self.infra_retry.backoff(unavailable);
                    warn!(?delay, "executor unavailable, retrying: {e}");
                    if !self.pause(delay).await {
                        break StepResult::Interrupted;
                    }
                    continue;
                }
                Ok(outcome) => {
                    attempts = attempt;
                    match outcome.into_result() {
                        Ok(output) => break StepResult::Succeeded(output),
                        Err(failure) => failure,
                    }
                }
            };

            if !failure.retryable || attempt >= step.retry.attempts() {
                break StepResult::Failed(failure.message);
            }
            let delay = step.retry.backoff(attempt);
            warn!(attempt, ?delay, "attempt failed, retrying: {}", failure.message);
            if !self.pause(delay).await {
                break StepResult::Interrupted;
            }
        };

        StepReport { index: self.index, attempts, result }
    }

    /// Sleep for `delay` unless the run halts first. Returns `false` when
    /// interrupted.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.interrupt.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
