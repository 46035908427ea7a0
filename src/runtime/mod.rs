//! The workflow engine.
//!
//! [`WorkflowEngine`] binds workflow definitions to entity types on a
//! [`Sharding`] substrate and exposes the durable operations workflow code is
//! written against. Each execution is one entity; its `run` request hosts the
//! workflow code and its `activity`/`deferred` requests record every step.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::_typed_codec::{Codec, Json};
use crate::error::EngineError;
use crate::providers::MessageStorage;
use crate::sharding::{EntityClient, LocalSharding, SendOptions, Sharding, ShardingConfig};
use crate::{DurableClock, DurableDeferred, ErrorDetails, Outcome, WorkflowDefinition, WorkflowResult};

pub mod activity;
pub mod client_cache;
pub mod clock;
pub mod correlator;
pub mod entity;
pub mod instance;
pub mod registry;
pub mod retry;

pub use activity::{Activity, ActivityContext};
pub use instance::{WorkflowContext, WorkflowInstance};
pub use retry::RetryPolicy;

use activity::{ActivityBridge, InvocationContext};
use client_cache::{CacheGuard, ClientCache};
use clock::{CLOCK_RUN, ClockHandler, ClockTimer, clock_entity, clock_entity_id};
use correlator::{CorrelationKey, RequestCorrelator};
use entity::{ACTIVITY, ActivityPayload, DEFERRED, DeferredPayload, RUN, WorkflowEntityHandler, decode_result};
use registry::WorkflowRegistry;

/// Configuration options for the engine.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Backoff for message-log reads and writes made by the engine.
    /// Default: 3 retries, 250ms base, doubling.
    pub persistence_retry: RetryPolicy,
    /// Backoff for clock delivery. Default: unbounded, 200ms base, x1.5, 60s cap.
    pub clock_retry: RetryPolicy,
    /// How long an unused workflow client is kept. Default: 5 minutes.
    pub client_idle_ttl: Duration,
    /// Sleeps at or below this run in memory instead of scheduling a durable
    /// clock. Default: zero.
    pub clock_in_memory_threshold: Duration,
    /// Substrate settings used by [`WorkflowEngine::start_local`].
    pub sharding: ShardingConfig,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            persistence_retry: RetryPolicy::persistence(),
            clock_retry: RetryPolicy::clock(),
            client_idle_ttl: Duration::from_secs(5 * 60),
            clock_in_memory_threshold: Duration::ZERO,
            sharding: ShardingConfig::default(),
        }
    }
}

/// Trait implemented by workflow handlers that can be invoked by the engine.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn run(&self, ctx: WorkflowContext, payload: Value) -> Result<Value, ErrorDetails>;
}

/// Function wrapper that implements `WorkflowHandler`.
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ErrorDetails>> + Send + 'static;

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ErrorDetails>> + Send + 'static,
{
    async fn run(&self, ctx: WorkflowContext, payload: Value) -> Result<Value, ErrorDetails> {
        (self.0)(ctx, payload).await
    }
}

struct EngineInner {
    sharding: Arc<dyn Sharding>,
    storage: Arc<dyn MessageStorage>,
    options: RuntimeOptions,
    registry: Arc<WorkflowRegistry>,
    bridge: Arc<ActivityBridge>,
    clients: ClientCache<String, EntityClient>,
    correlator: RequestCorrelator,
    clock: EntityClient,
}

/// Durable workflow engine. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

/// Handle kept by entity handlers so the engine can be dropped.
#[derive(Clone)]
pub(crate) struct WeakEngine(Weak<EngineInner>);

impl WeakEngine {
    pub fn upgrade(&self) -> Result<WorkflowEngine, EngineError> {
        self.0
            .upgrade()
            .map(|inner| WorkflowEngine { inner })
            .ok_or(EngineError::Shutdown)
    }
}

impl WorkflowEngine {
    /// Create an engine on an existing substrate and register the clock entity.
    pub async fn new(
        sharding: Arc<dyn Sharding>,
        storage: Arc<dyn MessageStorage>,
        options: RuntimeOptions,
    ) -> Result<Self, EngineError> {
        let registry = Arc::new(WorkflowRegistry::default());
        let clients = {
            let registry = registry.clone();
            let sharding = sharding.clone();
            ClientCache::new(options.client_idle_ttl, move |name: &String| {
                registry
                    .entity(name)
                    .map(|entity| EntityClient::new(sharding.clone(), entity))
                    .ok_or_else(|| EngineError::defect(format!("workflow {name} is not registered")))
            })
        };
        let clock_type = clock_entity();
        let engine = Self {
            inner: Arc::new(EngineInner {
                correlator: RequestCorrelator::new(sharding.clone(), storage.clone()),
                clock: EntityClient::new(sharding.clone(), Arc::new(clock_type.clone())),
                sharding,
                storage,
                options,
                registry,
                bridge: Arc::new(ActivityBridge::default()),
                clients,
            }),
        };
        engine
            .inner
            .sharding
            .register_entity(clock_type, Arc::new(ClockHandler::new(engine.downgrade())))
            .await?;
        Ok(engine)
    }

    /// Start a single-process engine on [`LocalSharding`].
    pub async fn start_local(storage: Arc<dyn MessageStorage>, options: RuntimeOptions) -> Result<Self, EngineError> {
        let sharding = LocalSharding::start(storage.clone(), options.sharding.clone());
        Self::new(sharding, storage, options).await
    }

    pub(crate) fn downgrade(&self) -> WeakEngine {
        WeakEngine(Arc::downgrade(&self.inner))
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    pub fn storage(&self) -> &Arc<dyn MessageStorage> {
        &self.inner.storage
    }

    pub fn sharding(&self) -> &Arc<dyn Sharding> {
        &self.inner.sharding
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.inner.correlator
    }

    pub fn registered_workflows(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Activity call sites currently waiting for their request to execute.
    pub fn pending_activity_registrations(&self) -> usize {
        self.inner.bridge.len()
    }

    pub fn is_activity_pending(&self, execution_id: &str, activity_name: &str) -> bool {
        self.inner.bridge.contains(execution_id, activity_name)
    }

    pub(crate) fn bridge(&self) -> &Arc<ActivityBridge> {
        &self.inner.bridge
    }

    fn client_for(&self, workflow_name: &str) -> Result<CacheGuard<String, EntityClient>, EngineError> {
        self.inner.clients.get(&workflow_name.to_string())
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        retry::retry_transient(&self.inner.options.persistence_retry, operation, f).await
    }

    /// Register a workflow. Names are unique per engine.
    pub async fn register<F, Fut>(&self, definition: WorkflowDefinition, f: F) -> Result<(), EngineError>
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorDetails>> + Send + 'static,
    {
        self.register_handler(definition, Arc::new(FnWorkflow(f))).await
    }

    /// Register a workflow with typed payload and success value.
    ///
    /// A payload that does not decode as `In` fails the execution with a defect.
    pub async fn register_typed<In, Out, F, Fut>(&self, definition: WorkflowDefinition, f: F) -> Result<(), EngineError>
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, ErrorDetails>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(definition, move |ctx, payload| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&payload).map_err(ErrorDetails::defect)?;
                let output = (*f)(ctx, input).await?;
                Json::encode(&output).map_err(ErrorDetails::defect)
            }
        })
        .await
    }

    pub async fn register_handler(
        &self,
        definition: WorkflowDefinition,
        handler: Arc<dyn WorkflowHandler>,
    ) -> Result<(), EngineError> {
        let entity = self.inner.registry.insert(&definition)?;
        let entity_handler = WorkflowEntityHandler::new(self.downgrade(), definition.clone(), handler);
        if let Err(e) = self
            .inner
            .sharding
            .register_entity(entity.as_ref().clone(), Arc::new(entity_handler))
            .await
        {
            self.inner.registry.remove(definition.name());
            return Err(e);
        }
        info!(workflow = %definition.name(), "registered workflow");
        Ok(())
    }

    /// Start (or join) the execution `execution_id` of `workflow`.
    ///
    /// With `discard` the call returns `None` once the run is filed. Otherwise
    /// it waits for the run's reply, which is `Suspended` while the execution
    /// is parked. Repeated calls return the recorded result.
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        execution_id: &str,
        payload: Value,
        discard: bool,
    ) -> Result<Option<WorkflowResult>, EngineError> {
        let client = self.client_for(workflow.name())?;
        let options = if discard {
            SendOptions::discard()
        } else {
            SendOptions::default()
        };
        debug!(workflow = %workflow.name(), execution_id, discard, "execute");
        let reply = self
            .with_retry("execute", || client.send(execution_id, RUN, payload.clone(), options))
            .await?;
        reply.map(|outcome| surface(decode_result(outcome)?)).transpose()
    }

    /// Last recorded result of an execution; `None` while it has never replied.
    pub async fn poll(&self, workflow: &WorkflowDefinition, execution_id: &str) -> Result<Option<WorkflowResult>, EngineError> {
        self.run_result(workflow, execution_id)
            .await?
            .map(surface)
            .transpose()
    }

    async fn run_result(&self, workflow: &WorkflowDefinition, execution_id: &str) -> Result<Option<WorkflowResult>, EngineError> {
        let entity_type = workflow.entity_type();
        let key = CorrelationKey {
            workflow,
            entity_type: &entity_type,
            execution_id,
            tag: RUN,
            id: "",
        };
        let reply = self
            .with_retry("run reply", || self.inner.correlator.request_reply(&key))
            .await?;
        reply.map(|reply| decode_result(reply.outcome)).transpose()
    }

    /// True once the execution's run has recorded a terminal result.
    pub(crate) async fn run_finished(&self, workflow: &WorkflowDefinition, execution_id: &str) -> Result<bool, EngineError> {
        Ok(self
            .run_result(workflow, execution_id)
            .await?
            .is_some_and(|result| !result.is_suspended()))
    }

    /// Interrupt a parked execution. No-op once it has a terminal result.
    pub async fn interrupt(&self, workflow: &WorkflowDefinition, execution_id: &str) -> Result<(), EngineError> {
        self.client_for(workflow.name())?;
        if self.run_finished(workflow, execution_id).await? {
            debug!(workflow = %workflow.name(), execution_id, "execution already finished; nothing to interrupt");
            return Ok(());
        }
        info!(workflow = %workflow.name(), execution_id, "interrupting execution");
        self.deferred_done(
            workflow.name(),
            execution_id,
            &DurableDeferred::interrupt_signal(),
            Outcome::unit(),
        )
        .await
    }

    /// Re-deliver a parked execution so it replays with every recorded step.
    ///
    /// A run that is still being handled is delivered again once it finishes,
    /// if it finishes suspended.
    pub async fn resume(&self, workflow: &WorkflowDefinition, execution_id: &str) -> Result<(), EngineError> {
        let entity_type = workflow.entity_type();
        let key = CorrelationKey {
            workflow,
            entity_type: &entity_type,
            execution_id,
            tag: RUN,
            id: "",
        };
        let correlator = &self.inner.correlator;
        let Some(request_id) = self.with_retry("resume lookup", || correlator.request_id_for(&key)).await? else {
            debug!(workflow = %workflow.name(), execution_id, "nothing to resume");
            return Ok(());
        };
        let reply = self
            .with_retry("resume reply", || correlator.reply_for_request(request_id))
            .await?;
        let parked = match reply {
            Some(reply) => decode_result(reply.outcome)?.is_suspended(),
            None => true,
        };
        if !parked {
            return Ok(());
        }
        self.with_retry("resume reset", || self.inner.sharding.reset(request_id))
            .await?;
        self.with_retry("resume poll", || self.inner.sharding.poll_storage())
            .await?;
        info!(workflow = %workflow.name(), execution_id, request_id = %request_id, "resumed execution");
        Ok(())
    }

    /// Called for a freshly completed deferred: wait until its reply is on
    /// record, then resume the execution.
    pub(crate) async fn resume_after_deferred(
        &self,
        workflow: &WorkflowDefinition,
        execution_id: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let client = self.client_for(workflow.name())?;
        self.with_retry("deferred reply", || {
            client.send(execution_id, DEFERRED, payload.clone(), SendOptions::default())
        })
        .await?;
        drop(client);
        self.resume(workflow, execution_id).await
    }

    /// Settle a run whose workflow code parked: an interrupt that arrived in
    /// the meantime ends the execution, otherwise it stays suspended.
    pub(crate) async fn settle_suspended(&self, instance: &WorkflowInstance) -> Result<WorkflowResult, EngineError> {
        let interrupt = self
            .deferred_result(instance, &DurableDeferred::interrupt_signal())
            .await?;
        instance.clear_suspended();
        if interrupt.is_none() {
            debug!(workflow = %instance.workflow().name(), execution_id = %instance.execution_id(), "execution suspended");
            return Ok(WorkflowResult::Suspended);
        }
        if let Err(e) = self.clear_clock(instance.workflow().name(), instance.execution_id()).await {
            warn!(execution_id = %instance.execution_id(), error = %e, "failed to clear clocks of interrupted execution");
        }
        info!(workflow = %instance.workflow().name(), execution_id = %instance.execution_id(), "execution interrupted");
        Ok(WorkflowResult::Error {
            error: ErrorDetails::Interrupted,
        })
    }

    /// Run `activity` for the instance and return its recorded result.
    ///
    /// A `Suspended` reply while the call site's registration is still live
    /// was left by a former owner that never ran the activity; the stored
    /// request is reset and sent again.
    pub async fn activity_execute(
        &self,
        instance: &WorkflowInstance,
        activity: &Activity,
        attempt: u32,
    ) -> Result<WorkflowResult, EngineError> {
        let workflow = instance.workflow();
        let execution_id = instance.execution_id();
        let registration = self.inner.bridge.register(
            execution_id,
            activity,
            InvocationContext {
                workflow: workflow.clone(),
                span: tracing::Span::current(),
            },
        )?;
        let client = self.client_for(workflow.name())?;
        let payload = Json::encode(&ActivityPayload {
            name: activity.name().to_string(),
            attempt,
        })
        .map_err(EngineError::defect)?;

        loop {
            let outcome = client.request(execution_id, ACTIVITY, payload.clone()).await?;
            let result = decode_result(outcome)?;
            if result.is_suspended() && registration.is_live() {
                debug!(activity = %activity.name(), attempt, "stale activity reply; resetting");
                self.reset_activity_attempt(workflow, execution_id, activity.name(), attempt)
                    .await?;
                continue;
            }
            return Ok(result);
        }
    }

    async fn reset_activity_attempt(
        &self,
        workflow: &WorkflowDefinition,
        execution_id: &str,
        name: &str,
        attempt: u32,
    ) -> Result<(), EngineError> {
        let entity_type = workflow.entity_type();
        let id = format!("{name}/{attempt}");
        let key = CorrelationKey {
            workflow,
            entity_type: &entity_type,
            execution_id,
            tag: ACTIVITY,
            id: &id,
        };
        let correlator = &self.inner.correlator;
        if let Some(request_id) = self.with_retry("activity lookup", || correlator.request_id_for(&key)).await? {
            self.with_retry("activity reset", || self.inner.sharding.reset(request_id))
                .await?;
        }
        Ok(())
    }

    /// Recorded outcome of `deferred` for the instance, if it was completed.
    pub async fn deferred_result(
        &self,
        instance: &WorkflowInstance,
        deferred: &DurableDeferred,
    ) -> Result<Option<Result<Value, ErrorDetails>>, EngineError> {
        let entity_type = instance.workflow().entity_type();
        let key = CorrelationKey {
            workflow: instance.workflow(),
            entity_type: &entity_type,
            execution_id: instance.execution_id(),
            tag: DEFERRED,
            id: deferred.name(),
        };
        let reply = self
            .with_retry("deferred_result", || self.inner.correlator.request_reply(&key))
            .await?;
        Ok(reply.map(|reply| reply.outcome.into_result()))
    }

    /// Complete `deferred` for an execution. Only the first completion counts.
    pub async fn deferred_done(
        &self,
        workflow_name: &str,
        execution_id: &str,
        deferred: &DurableDeferred,
        outcome: Outcome,
    ) -> Result<(), EngineError> {
        let client = self.client_for(workflow_name)?;
        let payload = Json::encode(&DeferredPayload {
            name: deferred.name().to_string(),
            outcome,
        })
        .map_err(EngineError::defect)?;
        self.with_retry("deferred_done", || {
            client.send(execution_id, DEFERRED, payload.clone(), SendOptions::discard())
        })
        .await?;
        debug!(workflow = %workflow_name, execution_id, deferred = %deferred.name(), "deferred done");
        Ok(())
    }

    /// File a durable timer for the execution. Scheduling the same clock name
    /// again is a no-op.
    pub async fn schedule_clock(
        &self,
        workflow: &WorkflowDefinition,
        execution_id: &str,
        clock: &DurableClock,
    ) -> Result<(), EngineError> {
        let delay = chrono::Duration::from_std(clock.duration())
            .map_err(|e| EngineError::defect(format!("clock {} duration: {e}", clock.name())))?;
        let wake_up = Utc::now()
            .checked_add_signed(delay)
            .ok_or_else(|| EngineError::defect(format!("clock {} wakes up out of range", clock.name())))?;
        let timer = ClockTimer {
            name: clock.name().to_string(),
            workflow_name: workflow.name().to_string(),
            wake_up,
        };
        let options = SendOptions {
            discard: true,
            deliver_at: Some(timer.wake_up),
        };
        let payload = Json::encode(&timer).map_err(EngineError::defect)?;
        let entity_id = clock_entity_id(workflow.name(), execution_id);
        self.with_retry("schedule_clock", || {
            self.inner.clock.send(&entity_id, CLOCK_RUN, payload.clone(), options)
        })
        .await?;
        debug!(workflow = %workflow.name(), execution_id, clock = %clock.name(), wake_up = %timer.wake_up, "clock scheduled");
        Ok(())
    }

    /// Drop every clock filed for the execution.
    pub async fn clear_clock(&self, workflow_name: &str, execution_id: &str) -> Result<(), EngineError> {
        let address = self.inner.clock.address(&clock_entity_id(workflow_name, execution_id));
        self.with_retry("clear_clock", || async {
            self.inner.storage.clear_address(&address).await.map_err(EngineError::from)
        })
        .await
    }

    pub async fn shutdown(&self) {
        self.inner.sharding.shutdown().await;
        info!("workflow engine shut down");
    }
}

/// Defects recorded as results are engine failures, not business errors.
fn surface(result: WorkflowResult) -> Result<WorkflowResult, EngineError> {
    match result {
        WorkflowResult::Error {
            error: ErrorDetails::Defect { message },
        } => Err(EngineError::Defect { message }),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryMessageStorage;
    use serde_json::json;

    async fn engine() -> WorkflowEngine {
        let storage = Arc::new(InMemoryMessageStorage::new());
        WorkflowEngine::start_local(storage, RuntimeOptions::default()).await.unwrap()
    }

    #[test]
    fn default_options() {
        let options = RuntimeOptions::default();
        assert_eq!(options.persistence_retry.max_retries, Some(3));
        assert_eq!(options.clock_retry.max_retries, None);
        assert_eq!(options.client_idle_ttl, Duration::from_secs(300));
        assert_eq!(options.clock_in_memory_threshold, Duration::ZERO);
    }

    #[tokio::test]
    async fn execute_unregistered_workflow_is_a_defect() {
        let engine = engine().await;
        let err = engine
            .execute(&WorkflowDefinition::new("Missing"), "E1", json!({}), false)
            .await
            .unwrap_err();
        assert!(err.is_defect());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn defect_results_surface_as_engine_errors() {
        let engine = engine().await;
        let workflow = WorkflowDefinition::new("Broken");
        engine
            .register(workflow.clone(), |_ctx, _payload| async {
                Err(ErrorDetails::defect("bad state"))
            })
            .await
            .unwrap();
        let err = engine.execute(&workflow, "E1", json!({}), false).await.unwrap_err();
        assert!(matches!(err, EngineError::Defect { message } if message == "bad state"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn clock_beyond_calendar_range_is_a_defect() {
        let engine = engine().await;
        let workflow = WorkflowDefinition::new("Forever");
        let clock = DurableClock::new("heat-death", Duration::from_secs(300_000 * 365 * 24 * 3600));
        let err = engine.schedule_clock(&workflow, "E1", &clock).await.unwrap_err();
        assert!(err.is_defect());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn poll_reports_nothing_before_first_run() {
        let engine = engine().await;
        let workflow = WorkflowDefinition::new("Idle");
        engine
            .register(workflow.clone(), |_ctx, payload| async move { Ok(payload) })
            .await
            .unwrap();
        assert_eq!(engine.poll(&workflow, "E1").await.unwrap(), None);
        engine.execute(&workflow, "E1", json!(3), false).await.unwrap();
        assert_eq!(
            engine.poll(&workflow, "E1").await.unwrap(),
            Some(WorkflowResult::Success { value: json!(3) })
        );
        engine.shutdown().await;
    }
}
