//! `engine` crate - workflow compilation, admission and execution.
//!
//! The [`Engine`] facade ties the pieces together:
//! - [`WorkflowCompiler`] turns a [`WorkflowDefinition`] into an immutable
//!   [`CompiledPlan`],
//! - [`AdmissionGate`] authenticates, rate-limits and reserves tenant
//!   capacity for new executions,
//! - [`ExecutionScheduler`] runs plans step by step through the
//!   [`StepExecutor`].

pub mod admission;
pub mod compiler;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod service;
pub mod step;
pub mod store;
pub mod tenant;

pub use admission::{AdmissionGate, WebhookRequest};
pub use compiler::{validate_dag, WorkflowCompiler};
pub use config::{EngineConfig, RetryPolicy};
pub use error::{AdmissionError, CompileError, EngineError, StoreError};
pub use models::{
    CompiledPlan, Edge, Execution, ExecutionStatus, NodeSpec, StepExecution, StepStatus, Trigger,
    WorkflowDefinition,
};
pub use scheduler::ExecutionScheduler;
pub use service::{Engine, EngineBuilder, RegisteredWorkflow};
pub use step::StepExecutor;
pub use tenant::{InMemoryTenantRegistry, TenantLimits, TenantRegistry};

#[cfg(test)]
mod scheduler_tests;
