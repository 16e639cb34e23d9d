//! The [`Engine`] facade: the operations callers use to compile, start,
//! inspect and cancel workflow executions.

use std::sync::Arc;

use dashmap::DashMap;
use nodes::NodeCatalog;
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::admission::{AdmissionGate, WebhookRequest};
use crate::compiler::WorkflowCompiler;
use crate::config::EngineConfig;
use crate::error::{AdmissionError, CompileError, EngineError};
use crate::events::{EventPublisher, NoopEventPublisher};
use crate::metrics::{MetricsRecorder, TracingMetrics};
use crate::models::{CompiledPlan, Execution, WorkflowDefinition};
use crate::scheduler::ExecutionScheduler;
use crate::step::StepExecutor;
use crate::store::ExecutionStore;
use crate::tenant::{InMemoryTenantRegistry, TenantRegistry};

/// Assembles an [`Engine`] from its collaborators. Unset collaborators get
/// in-process defaults.
pub struct EngineBuilder {
    catalog: NodeCatalog,
    store: Arc<dyn ExecutionStore>,
    config: EngineConfig,
    tenants: Option<Arc<dyn TenantRegistry>>,
    metrics: Arc<dyn MetricsRecorder>,
    events: Arc<dyn EventPublisher>,
}

impl EngineBuilder {
    pub fn new(catalog: NodeCatalog, store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            catalog,
            store,
            config: EngineConfig::default(),
            tenants: None,
            metrics: Arc::new(TracingMetrics),
            events: Arc::new(NoopEventPublisher),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tenants(mut self, tenants: Arc<dyn TenantRegistry>) -> Self {
        self.tenants = Some(tenants);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Engine {
        let catalog = Arc::new(self.catalog);
        let tenants = self.tenants.unwrap_or_else(|| {
            Arc::new(InMemoryTenantRegistry::new(self.config.default_tenant_limits))
        });
        let scheduler = ExecutionScheduler::new(
            Arc::new(StepExecutor::new(catalog.clone())),
            self.store.clone(),
            self.metrics,
            self.events,
            &self.config,
        );

        Engine {
            compiler: WorkflowCompiler::new(catalog, &self.config),
            scheduler,
            gate: AdmissionGate::new(tenants),
            store: self.store,
            plans: DashMap::new(),
            workflows: DashMap::new(),
            webhooks: DashMap::new(),
        }
    }
}

/// A workflow registered with the engine together with its compiled plan.
#[derive(Debug, Clone)]
pub struct RegisteredWorkflow {
    pub definition: Arc<WorkflowDefinition>,
    pub plan: Arc<CompiledPlan>,
}

pub struct Engine {
    compiler: WorkflowCompiler,
    scheduler: ExecutionScheduler,
    gate: AdmissionGate,
    store: Arc<dyn ExecutionStore>,
    /// Compiled plans keyed by `(workflow_id, version)`.
    plans: DashMap<(Uuid, u32), Arc<CompiledPlan>>,
    /// Latest registered version of each workflow.
    workflows: DashMap<Uuid, RegisteredWorkflow>,
    /// Webhook id to the workflow it starts.
    webhooks: DashMap<String, Uuid>,
}

impl Engine {
    pub fn builder(catalog: NodeCatalog, store: Arc<dyn ExecutionStore>) -> EngineBuilder {
        EngineBuilder::new(catalog, store)
    }

    // -- compilation and registration --------------------------------------

    /// Compile `definition`, reusing the cached plan for the same id and
    /// version.
    pub fn compile_workflow(&self, definition: &WorkflowDefinition) -> Result<Arc<CompiledPlan>, CompileError> {
        let key = (definition.id, definition.version);
        if let Some(plan) = self.plans.get(&key) {
            return Ok(plan.clone());
        }
        let plan = Arc::new(self.compiler.compile(definition)?);
        self.plans.insert(key, plan.clone());
        Ok(plan)
    }

    /// Compile and register `definition` as the current version of its
    /// workflow, binding its webhook if it has one.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<RegisteredWorkflow, CompileError> {
        let plan = self.compile_workflow(&definition)?;
        let definition = Arc::new(definition);

        let previous = self.workflows.get(&definition.id).map(|w| w.definition.clone());
        if let Some(previous) = previous {
            if let Some(old) = previous.webhook() {
                if definition.webhook().map(|w| &w.id) != Some(&old.id) {
                    self.webhooks.remove(&old.id);
                    self.gate.unregister_webhook(&old.id);
                }
            }
        }
        if let Some(webhook) = definition.webhook() {
            self.webhooks.insert(webhook.id.clone(), definition.id);
            self.gate.register_webhook(webhook.clone());
        }

        let registered = RegisteredWorkflow { definition: definition.clone(), plan };
        self.workflows.insert(definition.id, registered.clone());
        info!(workflow_id = %definition.id, version = definition.version, "workflow registered");
        Ok(registered)
    }

    /// Forget a workflow, its cached plans and its webhook. Returns whether
    /// it was registered.
    pub fn unregister_workflow(&self, workflow_id: Uuid) -> bool {
        let Some((_, registered)) = self.workflows.remove(&workflow_id) else {
            return false;
        };
        if let Some(webhook) = registered.definition.webhook() {
            self.webhooks.remove(&webhook.id);
            self.gate.unregister_webhook(&webhook.id);
        }
        self.plans.retain(|(id, _), _| *id != workflow_id);
        true
    }

    pub fn workflow(&self, workflow_id: Uuid) -> Option<RegisteredWorkflow> {
        self.workflows.get(&workflow_id).map(|w| w.clone())
    }

    /// Registered workflows, oldest first.
    pub fn workflows(&self) -> Vec<RegisteredWorkflow> {
        let mut all: Vec<RegisteredWorkflow> = self.workflows.iter().map(|w| w.clone()).collect();
        all.sort_by(|a, b| {
            a.definition
                .created_at
                .cmp(&b.definition.created_at)
                .then_with(|| a.definition.id.cmp(&b.definition.id))
        });
        all
    }

    /// The current plan of a workflow, loading and compiling its definition
    /// from the store when it is not registered.
    pub async fn plan_for(&self, workflow_id: Uuid) -> Result<Arc<CompiledPlan>, EngineError> {
        if let Some(registered) = self.workflows.get(&workflow_id) {
            return Ok(registered.plan.clone());
        }
        let definition = self
            .store
            .load_workflow_definition(workflow_id)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    EngineError::UnknownWorkflow(workflow_id)
                } else {
                    EngineError::Store(e)
                }
            })?;
        Ok(self.register_workflow(definition)?.plan)
    }

    // -- starting executions -----------------------------------------------

    /// Start `plan` for `tenant_id`. Returns as soon as the execution is
    /// admitted; the run continues in the background.
    #[instrument(skip(self, plan, trigger_input), fields(workflow_id = %plan.workflow_id))]
    pub fn start_execution(
        &self,
        plan: Arc<CompiledPlan>,
        tenant_id: Uuid,
        trigger_input: Value,
    ) -> Result<Uuid, AdmissionError> {
        self.gate.check_step_limit(tenant_id, plan.len())?;
        let slot = self.gate.reserve(tenant_id)?;
        let execution_id = self.scheduler.start(plan, tenant_id, trigger_input, slot);
        info!(%execution_id, "execution admitted");
        Ok(execution_id)
    }

    pub async fn start_workflow(
        &self,
        workflow_id: Uuid,
        tenant_id: Uuid,
        trigger_input: Value,
    ) -> Result<Uuid, EngineError> {
        let plan = self.plan_for(workflow_id).await?;
        Ok(self.start_execution(plan, tenant_id, trigger_input)?)
    }

    /// Admit and start the workflow bound to `webhook_id`.
    #[instrument(skip(self, request))]
    pub async fn trigger_webhook(&self, webhook_id: &str, request: &WebhookRequest) -> Result<Uuid, EngineError> {
        let unknown = || AdmissionError::UnknownWebhook(webhook_id.to_owned());
        let workflow_id = self.webhooks.get(webhook_id).map(|w| *w).ok_or_else(unknown)?;
        let config = self.gate.webhook(webhook_id).ok_or_else(unknown)?;
        let plan = self.plan_for(workflow_id).await?;

        let admission = self.gate.admit(webhook_id, config.tenant_id, request)?;
        self.gate.check_step_limit(config.tenant_id, plan.len())?;
        let execution_id = self
            .scheduler
            .start(plan, config.tenant_id, admission.trigger_input, admission.slot);
        info!(%execution_id, "webhook execution admitted");
        Ok(execution_id)
    }

    // -- observing and controlling executions ------------------------------

    /// Current snapshot. Executions not started by this process are read
    /// from the store.
    pub async fn get_execution_status(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        if let Some(execution) = self.scheduler.status(execution_id) {
            return Ok(execution);
        }
        self.store.load_execution(execution_id).await.map_err(|e| {
            if e.is_not_found() {
                EngineError::UnknownExecution(execution_id)
            } else {
                EngineError::Store(e)
            }
        })
    }

    /// Request cooperative cancellation. Cancelling a finished execution, or
    /// one run by another process, is a no-op.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<(), EngineError> {
        if self.scheduler.cancel(execution_id) {
            info!(%execution_id, "cancellation requested");
            return Ok(());
        }
        self.get_execution_status(execution_id).await.map(|_| ())
    }

    /// Resolve with the terminal snapshot of an execution.
    pub async fn wait_for_completion(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        match self.scheduler.wait_for_terminal(execution_id).await {
            Some(execution) => Ok(execution),
            None => self.get_execution_status(execution_id).await,
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn catalog(&self) -> &NodeCatalog {
        self.compiler.catalog()
    }
}
