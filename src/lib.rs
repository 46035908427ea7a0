//! Durable workflow execution on top of a sharded entity substrate.
//!
//! A workflow is ordinary async Rust code. Every step that touches the outside
//! world (activities, timers, externally completed deferreds) is filed as a
//! durable request against the workflow's entity, so a crashed or rebalanced
//! execution can be re-run from the top and every step that already completed
//! resolves from the message log instead of running again.
//!
//! The crate is split the same way the runtime is layered:
//!
//! - [`providers`]: the durable message log contract and an in-memory log.
//! - [`sharding`]: the entity substrate contract and a single-process substrate.
//! - [`runtime`]: the workflow engine itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod _typed_codec;
pub mod error;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod sharding;
pub mod snowflake;

pub use error::EngineError;
pub use runtime::{
    Activity, ActivityContext, RuntimeOptions, WorkflowContext, WorkflowEngine, WorkflowInstance,
};

/// Logical identity of one running instance of a workflow. Doubles as the entity id.
pub type ExecutionId = String;

/// Name of the deferred used to deliver an external interrupt to a parked execution.
pub const INTERRUPT_SIGNAL: &str = "Workflow/InterruptSignal";

/// Shard group used when a workflow carries no shard-group annotation.
pub const DEFAULT_SHARD_GROUP: &str = "default";

type ShardGroupFn = dyn Fn(&str) -> String + Send + Sync;

/// Free-form annotations attached to a workflow definition.
///
/// The only annotation the engine interprets is the shard-group selector, which
/// maps an execution id to the shard group its entity is placed in.
#[derive(Clone, Default)]
pub struct Annotations {
    shard_group: Option<Arc<ShardGroupFn>>,
    values: BTreeMap<String, String>,
}

impl Annotations {
    pub fn shard_group_for(&self, execution_id: &str) -> String {
        match &self.shard_group {
            Some(select) => select(execution_id),
            None => DEFAULT_SHARD_GROUP.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub(crate) fn shard_group_selector(&self) -> Option<Arc<ShardGroupFn>> {
        self.shard_group.clone()
    }
}

impl fmt::Debug for Annotations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Annotations")
            .field("shard_group", &self.shard_group.as_ref().map(|_| "<fn>"))
            .field("values", &self.values)
            .finish()
    }
}

/// Immutable descriptor of a workflow. Created once, before registration.
///
/// Payload, success and error types are bound at registration time; see
/// [`WorkflowEngine::register_typed`].
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    name: String,
    annotations: Annotations,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotations: Annotations::default(),
        }
    }

    /// Place executions of this workflow in the shard group chosen by `select`.
    pub fn with_shard_group<F>(mut self, select: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.annotations.shard_group = Some(Arc::new(select));
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.values.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Entity type backing this workflow on the substrate.
    pub fn entity_type(&self) -> String {
        format!("Workflow/{}", self.name)
    }
}

/// Structured failure carried by outcomes and workflow results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorDetails {
    /// Business error raised by workflow or activity code.
    Application {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    /// The execution was interrupted while parked.
    Interrupted,
    /// Programmer error; never retried.
    Defect { message: String },
}

impl ErrorDetails {
    pub fn application(message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            message: message.into(),
            details: None,
        }
    }

    pub fn application_with(message: impl Into<String>, details: Value) -> Self {
        ErrorDetails::Application {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn defect(message: impl Into<String>) -> Self {
        ErrorDetails::Defect {
            message: message.into(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, ErrorDetails::Interrupted)
    }

    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { message, .. } => message.clone(),
            ErrorDetails::Interrupted => "interrupted".to_string(),
            ErrorDetails::Defect { message } => format!("defect: {message}"),
        }
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_message())
    }
}

/// Outcome stored in a reply: a success value or a structured failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "exit", rename_all = "snake_case")]
pub enum Outcome {
    Success { value: Value },
    Failure { error: ErrorDetails },
}

impl Outcome {
    pub fn success(value: Value) -> Self {
        Outcome::Success { value }
    }

    pub fn failure(error: ErrorDetails) -> Self {
        Outcome::Failure { error }
    }

    /// Success carrying no value.
    pub fn unit() -> Self {
        Outcome::Success { value: Value::Null }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn into_result(self) -> Result<Value, ErrorDetails> {
        match self {
            Outcome::Success { value } => Ok(value),
            Outcome::Failure { error } => Err(error),
        }
    }
}

impl From<Result<Value, ErrorDetails>> for Outcome {
    fn from(result: Result<Value, ErrorDetails>) -> Self {
        match result {
            Ok(value) => Outcome::Success { value },
            Err(error) => Outcome::Failure { error },
        }
    }
}

/// Result of running a workflow or an activity.
///
/// `Suspended` is not an error: the execution cannot make progress until an
/// external signal is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowResult {
    Success { value: Value },
    Error { error: ErrorDetails },
    Suspended,
}

impl WorkflowResult {
    pub fn is_suspended(&self) -> bool {
        matches!(self, WorkflowResult::Suspended)
    }

    /// `None` while suspended.
    pub fn into_result(self) -> Option<Result<Value, ErrorDetails>> {
        match self {
            WorkflowResult::Success { value } => Some(Ok(value)),
            WorkflowResult::Error { error } => Some(Err(error)),
            WorkflowResult::Suspended => None,
        }
    }
}

impl From<Result<Value, ErrorDetails>> for WorkflowResult {
    fn from(result: Result<Value, ErrorDetails>) -> Self {
        match result {
            Ok(value) => WorkflowResult::Success { value },
            Err(error) => WorkflowResult::Error { error },
        }
    }
}

/// A named, durably recorded one-shot signal a workflow can await.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DurableDeferred {
    name: String,
}

impl DurableDeferred {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The reserved deferred used by [`WorkflowEngine::interrupt`].
    pub fn interrupt_signal() -> Self {
        Self::new(INTERRUPT_SIGNAL)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A persisted timer. Fires once, `duration` after it is first scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableClock {
    name: String,
    duration: Duration,
}

impl DurableClock {
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Deferred completed when the clock fires.
    pub fn deferred(&self) -> DurableDeferred {
        DurableDeferred::new(format!("DurableClock/{}", self.name))
    }
}
