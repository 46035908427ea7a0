//! Per-execution control state and the handle workflow code runs against.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use super::WorkflowEngine;
use super::activity::Activity;
use crate::error::EngineError;
use crate::{DurableClock, DurableDeferred, ErrorDetails, WorkflowDefinition, WorkflowResult};

#[derive(Debug, Clone)]
enum InstanceState {
    Running,
    Suspended,
    Failed(EngineError),
}

/// How a driven computation ended.
#[derive(Debug)]
pub enum Exit<T> {
    Completed(T),
    /// The instance parked itself waiting on an external signal.
    Suspended,
    /// An engine call failed; the invocation must not record a reply.
    Failed(EngineError),
}

/// Runtime state of one execution, owned by a single handler invocation.
///
/// Cloning shares the state. Code running inside [`WorkflowInstance::drive`]
/// can park the instance with [`suspend`](Self::suspend); the driven future is
/// then dropped at its current await point.
#[derive(Clone)]
pub struct WorkflowInstance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    workflow: WorkflowDefinition,
    execution_id: String,
    state: watch::Sender<InstanceState>,
}

impl WorkflowInstance {
    pub fn new(workflow: WorkflowDefinition, execution_id: impl Into<String>) -> Self {
        let (state, _) = watch::channel(InstanceState::Running);
        Self {
            inner: Arc::new(InstanceInner {
                workflow,
                execution_id: execution_id.into(),
                state,
            }),
        }
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.inner.workflow
    }

    pub fn execution_id(&self) -> &str {
        &self.inner.execution_id
    }

    pub fn is_suspended(&self) -> bool {
        matches!(*self.inner.state.borrow(), InstanceState::Suspended)
    }

    pub(crate) fn clear_suspended(&self) {
        self.inner.state.send_if_modified(|state| {
            if matches!(state, InstanceState::Suspended) {
                *state = InstanceState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Park the instance. Never returns; the surrounding [`drive`](Self::drive)
    /// call finishes with [`Exit::Suspended`].
    pub async fn suspend<T>(&self) -> T {
        self.inner.state.send_if_modified(|state| {
            if matches!(state, InstanceState::Running) {
                *state = InstanceState::Suspended;
                true
            } else {
                false
            }
        });
        std::future::pending().await
    }

    /// Abort the invocation with an engine error. Never returns.
    pub(crate) async fn fail<T>(&self, error: EngineError) -> T {
        self.inner.state.send_if_modified(|state| {
            if matches!(state, InstanceState::Failed(_)) {
                false
            } else {
                *state = InstanceState::Failed(error);
                true
            }
        });
        std::future::pending().await
    }

    /// Run `fut` until it completes or the instance is suspended or failed.
    pub(crate) async fn drive<F: Future>(&self, fut: F) -> Exit<F::Output> {
        let mut rx = self.inner.state.subscribe();
        let halted = async move {
            let state = rx
                .wait_for(|s| !matches!(s, InstanceState::Running))
                .await
                .map(|s| s.clone());
            match state {
                Ok(state) => state,
                Err(_) => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            state = halted => match state {
                InstanceState::Failed(e) => Exit::Failed(e),
                _ => Exit::Suspended,
            },
            out = fut => Exit::Completed(out),
        }
    }
}

impl std::fmt::Debug for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("workflow", &self.inner.workflow.name())
            .field("execution_id", &self.inner.execution_id)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

/// Handle passed to workflow code.
///
/// Every method that reaches outside the workflow is durable: on a re-run it
/// resolves from the message log instead of doing the work again. Methods that
/// cannot complete yet park the execution; they never return in that case.
#[derive(Clone)]
pub struct WorkflowContext {
    engine: WorkflowEngine,
    instance: WorkflowInstance,
}

impl WorkflowContext {
    pub(crate) fn new(engine: WorkflowEngine, instance: WorkflowInstance) -> Self {
        Self { engine, instance }
    }

    pub fn workflow_name(&self) -> &str {
        self.instance.workflow().name()
    }

    pub fn execution_id(&self) -> &str {
        self.instance.execution_id()
    }

    pub fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    /// Run `activity` as attempt 0.
    pub async fn activity(&self, activity: &Activity) -> Result<Value, ErrorDetails> {
        self.activity_attempt(activity, 0).await
    }

    pub async fn activity_attempt(&self, activity: &Activity, attempt: u32) -> Result<Value, ErrorDetails> {
        match self.engine.activity_execute(&self.instance, activity, attempt).await {
            Ok(WorkflowResult::Success { value }) => Ok(value),
            Ok(WorkflowResult::Error { error }) => Err(error),
            Ok(WorkflowResult::Suspended) => self.instance.suspend().await,
            Err(e) => self.instance.fail(e).await,
        }
    }

    /// Run `activity`, retrying application errors up to `times` more times.
    /// Each attempt is recorded separately.
    pub async fn activity_with_retry(&self, activity: &Activity, times: u32) -> Result<Value, ErrorDetails> {
        let mut attempt = 0;
        loop {
            match self.activity_attempt(activity, attempt).await {
                Err(error @ ErrorDetails::Application { .. }) if attempt < times => {
                    debug!(activity = %activity.name(), attempt, error = %error, "activity failed; retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Wait for a named deferred to be completed with
    /// [`WorkflowEngine::deferred_done`].
    pub async fn await_deferred(&self, deferred: &DurableDeferred) -> Result<Value, ErrorDetails> {
        match self.engine.deferred_result(&self.instance, deferred).await {
            Ok(Some(result)) => result,
            Ok(None) => self.instance.suspend().await,
            Err(e) => self.instance.fail(e).await,
        }
    }

    /// Durable sleep. Short sleeps run in memory as an activity; longer ones
    /// schedule a durable clock and park the execution until it fires.
    pub async fn sleep(&self, name: &str, duration: Duration) -> Result<(), ErrorDetails> {
        let clock = DurableClock::new(name, duration);
        if duration <= self.engine.options().clock_in_memory_threshold {
            let nap = Activity::new(clock.deferred().name(), move |_ctx| async move {
                tokio::time::sleep(duration).await;
                Ok(Value::Null)
            });
            return self.activity(&nap).await.map(|_| ());
        }
        if let Err(e) = self
            .engine
            .schedule_clock(self.instance.workflow(), self.instance.execution_id(), &clock)
            .await
        {
            return self.instance.fail(e).await;
        }
        self.await_deferred(&clock.deferred()).await.map(|_| ())
    }

    /// Park the execution until it is resumed.
    pub async fn suspend<T>(&self) -> T {
        self.instance.suspend().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(WorkflowDefinition::new("Order"), "E1")
    }

    #[tokio::test]
    async fn completed_future_is_returned() {
        let instance = instance();
        match instance.drive(async { 5 }).await {
            Exit::Completed(v) => assert_eq!(v, 5),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!instance.is_suspended());
    }

    #[tokio::test]
    async fn suspend_halts_the_driven_future() {
        let instance = instance();
        let inner = instance.clone();
        let exit = instance
            .drive(async move {
                inner.suspend::<()>().await;
                unreachable!("suspended code never resumes")
            })
            .await;
        assert!(matches!(exit, Exit::Suspended));
        assert!(instance.is_suspended());

        instance.clear_suspended();
        assert!(!instance.is_suspended());
    }

    #[tokio::test]
    async fn failure_wins_over_suspension() {
        let instance = instance();
        let inner = instance.clone();
        let exit = instance
            .drive(async move {
                let a = inner.clone();
                let b = inner.clone();
                let ((), ()) = tokio::join!(
                    async move { a.fail::<()>(EngineError::defect("lookup failed")).await },
                    async move { b.suspend::<()>().await },
                );
            })
            .await;
        assert!(matches!(exit, Exit::Failed(EngineError::Defect { .. })));
    }
}
