//! Durable clock entity: one persisted timer per `(execution, name)` that
//! completes the clock's deferred when it fires.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::WeakEngine;
use super::retry::retry_with;
use crate::_typed_codec::{Codec, Json};
use crate::error::EngineError;
use crate::sharding::{EntityHandler, EntityType, IncomingRequest, OperationSpec};
use crate::{DurableClock, Outcome};

pub const CLOCK_ENTITY: &str = "Workflow/-/DurableClock";
pub const CLOCK_RUN: &str = "run";

/// Payload of a clock `run` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockTimer {
    pub name: String,
    pub workflow_name: String,
    pub wake_up: DateTime<Utc>,
}

fn clock_key(payload: &serde_json::Value) -> String {
    payload["name"].as_str().unwrap_or_default().to_string()
}

pub(crate) fn clock_entity() -> EntityType {
    EntityType::new(CLOCK_ENTITY).with_operation(
        OperationSpec::new(CLOCK_RUN)
            .persisted()
            .uninterruptible()
            .with_primary_key(clock_key),
    )
}

/// Clock entities are keyed per execution, so timer names only need to be
/// unique within one execution.
pub(crate) fn clock_entity_id(workflow_name: &str, execution_id: &str) -> String {
    format!("{workflow_name}/{execution_id}")
}

pub(crate) struct ClockHandler {
    engine: WeakEngine,
}

impl ClockHandler {
    pub fn new(engine: WeakEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EntityHandler for ClockHandler {
    async fn handle(&self, request: IncomingRequest) -> Result<Outcome, EngineError> {
        let timer: ClockTimer = Json::decode(&request.payload).map_err(EngineError::defect)?;
        let prefix = format!("{}/", timer.workflow_name);
        let execution_id = request
            .address
            .entity_id
            .strip_prefix(&prefix)
            .ok_or_else(|| {
                EngineError::defect(format!(
                    "clock entity {} does not belong to {}",
                    request.address.entity_id, timer.workflow_name
                ))
            })?
            .to_string();
        let engine = self.engine.upgrade()?;
        debug!(clock = %timer.name, workflow = %timer.workflow_name, execution_id = %execution_id, "clock fired");

        let deferred = DurableClock::new(timer.name.as_str(), std::time::Duration::ZERO).deferred();
        retry_with(
            &engine.options().clock_retry,
            "clock deferred_done",
            |e| !matches!(e, EngineError::Shutdown),
            || engine.deferred_done(&timer.workflow_name, &execution_id, &deferred, Outcome::unit()),
        )
        .await?;
        info!(clock = %timer.name, workflow = %timer.workflow_name, execution_id = %execution_id, "clock delivered");
        Ok(Outcome::unit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timers_are_keyed_by_name_per_execution() {
        let entity = clock_entity();
        let op = entity.operation(CLOCK_RUN).unwrap();
        assert!(op.persisted && op.uninterruptible);
        let timer = ClockTimer {
            name: "nap".into(),
            workflow_name: "Order".into(),
            wake_up: Utc::now(),
        };
        assert_eq!((op.primary_key.unwrap())(&json!(timer)), "nap");
        assert_eq!(clock_entity_id("Order", "E1"), "Order/E1");
    }
}
