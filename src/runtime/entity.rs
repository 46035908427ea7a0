//! The entity type generated for every registered workflow and its handler.
//!
//! Operations:
//! - `run(payload)`: persisted, uninterruptible, one per execution. A reset
//!   that lands while the run is executing only applies if it ends suspended.
//! - `deferred({name, outcome})`: persisted, uninterruptible, keyed by name.
//! - `activity({name, attempt})`: persisted, keyed by `name/attempt`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, info_span, warn};

use super::activity::ClaimedActivity;
use super::instance::{Exit, WorkflowContext, WorkflowInstance};
use super::{WeakEngine, WorkflowEngine, WorkflowHandler};
use crate::_typed_codec::{Codec, Json};
use crate::error::EngineError;
use crate::sharding::{EntityHandler, EntityType, IncomingRequest, OperationSpec};
use crate::{ErrorDetails, Outcome, WorkflowDefinition, WorkflowResult};

pub const RUN: &str = "run";
pub const DEFERRED: &str = "deferred";
pub const ACTIVITY: &str = "activity";

/// Body of a `deferred` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredPayload {
    pub name: String,
    pub outcome: Outcome,
}

/// Body of an `activity` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityPayload {
    pub name: String,
    pub attempt: u32,
}

impl ActivityPayload {
    pub fn primary_key(&self) -> String {
        format!("{}/{}", self.name, self.attempt)
    }
}

fn run_key(_payload: &serde_json::Value) -> String {
    String::new()
}

fn run_reset_applies(outcome: &Outcome) -> bool {
    match outcome {
        Outcome::Success { value } => Json::decode::<WorkflowResult>(value).is_ok_and(|r| r.is_suspended()),
        Outcome::Failure { .. } => false,
    }
}

fn deferred_key(payload: &serde_json::Value) -> String {
    payload["name"].as_str().unwrap_or_default().to_string()
}

fn activity_key(payload: &serde_json::Value) -> String {
    match Json::decode::<ActivityPayload>(payload) {
        Ok(activity) => activity.primary_key(),
        Err(_) => String::new(),
    }
}

pub(crate) fn workflow_entity(definition: &WorkflowDefinition) -> EntityType {
    let entity = EntityType::new(definition.entity_type())
        .with_operation(
            OperationSpec::new(RUN)
                .persisted()
                .uninterruptible()
                .with_primary_key(run_key)
                .with_reset_filter(run_reset_applies),
        )
        .with_operation(
            OperationSpec::new(DEFERRED)
                .persisted()
                .uninterruptible()
                .with_primary_key(deferred_key),
        )
        .with_operation(OperationSpec::new(ACTIVITY).persisted().with_primary_key(activity_key));
    match definition.annotations().shard_group_selector() {
        Some(select) => entity.with_shard_group(select),
        None => entity,
    }
}

pub(crate) fn encode_result(result: &WorkflowResult) -> Result<Outcome, EngineError> {
    Json::encode(result).map(Outcome::success).map_err(EngineError::defect)
}

/// Read a `run` or `activity` reply back into a workflow result.
pub(crate) fn decode_result(outcome: Outcome) -> Result<WorkflowResult, EngineError> {
    match outcome {
        Outcome::Success { value } => Json::decode(&value).map_err(EngineError::defect),
        Outcome::Failure { error } => Ok(WorkflowResult::Error { error }),
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(request: &IncomingRequest) -> Result<T, EngineError> {
    Json::decode(&request.payload)
        .map_err(|e| EngineError::defect(format!("{} payload for {}: {e}", request.tag, request.address)))
}

pub(crate) struct WorkflowEntityHandler {
    engine: WeakEngine,
    definition: WorkflowDefinition,
    handler: Arc<dyn WorkflowHandler>,
}

impl WorkflowEntityHandler {
    pub fn new(engine: WeakEngine, definition: WorkflowDefinition, handler: Arc<dyn WorkflowHandler>) -> Self {
        Self {
            engine,
            definition,
            handler,
        }
    }

    async fn run(&self, request: IncomingRequest) -> Result<Outcome, EngineError> {
        let engine = self.engine.upgrade()?;
        let execution_id = request.address.entity_id.clone();
        let instance = WorkflowInstance::new(self.definition.clone(), execution_id.clone());
        let ctx = WorkflowContext::new(engine.clone(), instance.clone());
        let span = info_span!("workflow", workflow = %self.definition.name(), execution_id = %execution_id);

        let exit = instance
            .drive(self.handler.run(ctx, request.payload))
            .instrument(span.clone())
            .await;
        let result = match exit {
            Exit::Completed(result) => WorkflowResult::from(result),
            Exit::Suspended => engine.settle_suspended(&instance).instrument(span).await?,
            Exit::Failed(e) => return Err(e),
        };
        encode_result(&result)
    }

    async fn deferred(&self, request: IncomingRequest) -> Result<Outcome, EngineError> {
        let payload: DeferredPayload = decode_payload(&request)?;
        let engine = self.engine.upgrade()?;
        let workflow = self.definition.clone();
        let execution_id = request.address.entity_id.clone();
        let resend = request.payload.clone();
        debug!(workflow = %workflow.name(), execution_id = %execution_id, deferred = %payload.name, "deferred completed");

        // Resume only once this reply is on record, so the re-run observes it.
        tokio::spawn(async move {
            if let Err(e) = engine.resume_after_deferred(&workflow, &execution_id, resend).await {
                warn!(workflow = %workflow.name(), execution_id = %execution_id, error = %e, "resume after deferred failed");
            }
        });
        Ok(payload.outcome)
    }

    async fn activity(&self, request: IncomingRequest) -> Result<Outcome, EngineError> {
        let payload: ActivityPayload = decode_payload(&request)?;
        let engine = self.engine.upgrade()?;
        let execution_id = request.address.entity_id.as_str();

        let Some(claimed) = self.claim(&engine, execution_id, &payload.name).await? else {
            debug!(
                workflow = %self.definition.name(),
                execution_id = %execution_id,
                activity = %payload.name,
                "execution already finished; abandoning activity"
            );
            return encode_result(&WorkflowResult::Error {
                error: ErrorDetails::Interrupted,
            });
        };
        let instance = WorkflowInstance::new(claimed.context.workflow.clone(), execution_id);
        let ctx = claimed.context_for(execution_id, payload.attempt, instance.clone());
        let span = info_span!(
            parent: &claimed.context.span,
            "activity",
            activity = %payload.name,
            attempt = payload.attempt,
        );
        let exit = instance.drive(claimed.activity.invoke(ctx)).instrument(span).await;
        drop(claimed);

        let result = match exit {
            Exit::Completed(result) => WorkflowResult::from(result),
            Exit::Suspended => WorkflowResult::Suspended,
            Exit::Failed(e) => return Err(e),
        };
        encode_result(&result)
    }

    /// Wait for the call site to register the activity. `None` once the run
    /// has a terminal result: no call site will register it again.
    async fn claim(
        &self,
        engine: &WorkflowEngine,
        execution_id: &str,
        name: &str,
    ) -> Result<Option<ClaimedActivity>, EngineError> {
        let recheck = engine.options().sharding.storage_poll_interval.max(Duration::from_millis(10));
        loop {
            if engine.run_finished(&self.definition, execution_id).await? {
                return Ok(None);
            }
            if let Ok(claimed) = tokio::time::timeout(recheck, engine.bridge().claim(execution_id, name)).await {
                return Ok(Some(claimed));
            }
        }
    }
}

#[async_trait]
impl EntityHandler for WorkflowEntityHandler {
    async fn handle(&self, request: IncomingRequest) -> Result<Outcome, EngineError> {
        match request.tag.as_str() {
            RUN => self.run(request).await,
            DEFERRED => self.deferred(request).await,
            ACTIVITY => self.activity(request).await,
            other => Err(EngineError::defect(format!(
                "{} has no operation {other}",
                self.definition.entity_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primary_keys_follow_wire_contract() {
        let entity = workflow_entity(&WorkflowDefinition::new("Order"));
        let key = |tag: &str, payload: serde_json::Value| {
            let op = entity.operation(tag).unwrap();
            (op.primary_key.unwrap())(&payload)
        };
        assert_eq!(key(RUN, json!({"order": 1})), "");
        assert_eq!(key(DEFERRED, json!({"name": "approval", "outcome": Outcome::unit()})), "approval");
        assert_eq!(key(ACTIVITY, json!({"name": "charge-card", "attempt": 2})), "charge-card/2");

        assert!(!entity.operation(ACTIVITY).unwrap().uninterruptible);
        let run = entity.operation(RUN).unwrap();
        assert!(run.reset_applies(&encode_result(&WorkflowResult::Suspended).unwrap()));
        assert!(!run.reset_applies(&encode_result(&WorkflowResult::Success { value: json!(1) }).unwrap()));
        assert!(entity.operation(ACTIVITY).unwrap().reset_applies(&Outcome::unit()));
        assert!(entity.operation(DEFERRED).unwrap().uninterruptible);
    }

    #[test]
    fn failure_outcome_decodes_as_error_result() {
        let result = decode_result(Outcome::failure(ErrorDetails::application("declined"))).unwrap();
        assert_eq!(
            result,
            WorkflowResult::Error {
                error: ErrorDetails::application("declined")
            }
        );
        let suspended = encode_result(&WorkflowResult::Suspended).unwrap();
        assert!(decode_result(suspended).unwrap().is_suspended());
    }
}
