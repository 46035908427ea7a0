//! Activities and the bridge that pairs an activity call site with the
//! entity request that executes it.
//!
//! The closure that knows how to run an activity exists only inside the
//! workflow code that reached the call site, while the request that actually
//! executes it arrives through the substrate. The call site registers the
//! closure under `executionId/name`; the `activity` handler claims it, waiting
//! on a per-key latch if it got there first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use super::instance::WorkflowInstance;
use crate::_typed_codec::{Codec, Json};
use crate::error::EngineError;
use crate::{ErrorDetails, WorkflowDefinition};

type ActivityFn = dyn Fn(ActivityContext) -> BoxFuture<'static, Result<Value, ErrorDetails>> + Send + Sync;

/// A named, retryable step of a workflow.
#[derive(Clone)]
pub struct Activity {
    name: String,
    run: Arc<ActivityFn>,
}

impl Activity {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorDetails>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move |ctx| -> BoxFuture<'static, Result<Value, ErrorDetails>> { Box::pin(f(ctx)) }),
        }
    }

    /// Activity whose success value is any serializable type.
    pub fn typed<Out, F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        Out: Serialize + Send + 'static,
        F: Fn(ActivityContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, ErrorDetails>> + Send + 'static,
    {
        Self::new(name, move |ctx| {
            let fut = f(ctx);
            async move {
                let out = fut.await?;
                Json::encode(&out).map_err(ErrorDetails::defect)
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, ctx: ActivityContext) -> BoxFuture<'static, Result<Value, ErrorDetails>> {
        (self.run)(ctx)
    }
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activity").field("name", &self.name).finish()
    }
}

/// What an activity closure sees while it runs.
#[derive(Clone, Debug)]
pub struct ActivityContext {
    workflow_name: String,
    execution_id: String,
    activity_name: String,
    attempt: u32,
    instance: WorkflowInstance,
}

impl ActivityContext {
    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// Zero-based attempt number requested by the caller.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Park the activity; the caller observes it as suspended.
    pub async fn suspend<T>(&self) -> T {
        self.instance.suspend().await
    }
}

/// Captured at the call site and replayed on the executing side.
#[derive(Clone)]
pub(crate) struct InvocationContext {
    pub workflow: WorkflowDefinition,
    pub span: tracing::Span,
}

#[derive(Clone)]
struct Registration {
    activity: Activity,
    context: InvocationContext,
    generation: u64,
}

/// Wakes requests that arrived before their call site registered.
struct Latch {
    notify: Arc<Notify>,
    waiters: usize,
}

#[derive(Default)]
struct BridgeState {
    registrations: HashMap<String, Registration>,
    latches: HashMap<String, Latch>,
    next_generation: u64,
}

#[derive(Default)]
pub(crate) struct ActivityBridge {
    state: Mutex<BridgeState>,
}

fn bridge_key(execution_id: &str, name: &str) -> String {
    format!("{execution_id}/{name}")
}

impl ActivityBridge {
    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `activity` for `execution_id` and wake any request already
    /// waiting for it. Fails if the key is still held by another call site.
    pub fn register(
        self: &Arc<Self>,
        execution_id: &str,
        activity: &Activity,
        context: InvocationContext,
    ) -> Result<RegistrationGuard, EngineError> {
        let key = bridge_key(execution_id, activity.name());
        let (generation, latch) = {
            let mut state = self.lock();
            if state.registrations.contains_key(&key) {
                return Err(EngineError::defect(format!("activity {key} is already running")));
            }
            let generation = state.next_generation;
            state.next_generation += 1;
            state.registrations.insert(
                key.clone(),
                Registration {
                    activity: activity.clone(),
                    context,
                    generation,
                },
            );
            (generation, state.latches.remove(&key))
        };
        if let Some(latch) = latch {
            latch.notify.notify_waiters();
        }
        Ok(RegistrationGuard {
            bridge: self.clone(),
            key,
            generation,
        })
    }

    /// Wait until an activity is registered under `execution_id/name`.
    ///
    /// Cancel safe: a dropped claim releases its latch.
    pub async fn claim(self: &Arc<Self>, execution_id: &str, name: &str) -> ClaimedActivity {
        let key = bridge_key(execution_id, name);
        loop {
            let waiting = {
                let mut state = self.lock();
                if let Some(registration) = state.registrations.get(&key) {
                    return ClaimedActivity {
                        activity: registration.activity.clone(),
                        context: registration.context.clone(),
                        _remove: RegistrationGuard {
                            bridge: self.clone(),
                            key,
                            generation: registration.generation,
                        },
                    };
                }
                let latch = state.latches.entry(key.clone()).or_insert_with(|| Latch {
                    notify: Arc::new(Notify::new()),
                    waiters: 0,
                });
                latch.waiters += 1;
                LatchWait {
                    bridge: self.clone(),
                    key: key.clone(),
                    notify: latch.notify.clone(),
                }
            };
            let notified = waiting.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().registrations.contains_key(&key) {
                continue;
            }
            debug!(activity = %key, "activity request arrived before its call site; waiting");
            notified.await;
        }
    }

    pub fn contains(&self, execution_id: &str, name: &str) -> bool {
        self.lock().registrations.contains_key(&bridge_key(execution_id, name))
    }

    pub fn len(&self) -> usize {
        self.lock().registrations.len()
    }

    #[cfg(test)]
    fn latch_count(&self) -> usize {
        self.lock().latches.len()
    }

    fn release_latch(&self, key: &str, notify: &Arc<Notify>) {
        let mut state = self.lock();
        let Some(latch) = state.latches.get_mut(key) else { return };
        // `register` already took this latch; a newer one is not ours.
        if !Arc::ptr_eq(&latch.notify, notify) {
            return;
        }
        latch.waiters = latch.waiters.saturating_sub(1);
        if latch.waiters == 0 {
            state.latches.remove(key);
        }
    }

    fn remove(&self, key: &str, generation: u64) {
        let mut state = self.lock();
        if state.registrations.get(key).is_some_and(|r| r.generation == generation) {
            state.registrations.remove(key);
        }
    }

    fn is_registered(&self, key: &str, generation: u64) -> bool {
        self.lock()
            .registrations
            .get(key)
            .is_some_and(|r| r.generation == generation)
    }
}

/// One claim parked on a latch.
struct LatchWait {
    bridge: Arc<ActivityBridge>,
    key: String,
    notify: Arc<Notify>,
}

impl Drop for LatchWait {
    fn drop(&mut self) {
        self.bridge.release_latch(&self.key, &self.notify);
    }
}

/// Removes its registration on drop, unless a newer one replaced it.
pub(crate) struct RegistrationGuard {
    bridge: Arc<ActivityBridge>,
    key: String,
    generation: u64,
}

impl RegistrationGuard {
    /// False once the executing side consumed the registration.
    pub fn is_live(&self) -> bool {
        self.bridge.is_registered(&self.key, self.generation)
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.bridge.remove(&self.key, self.generation);
    }
}

/// A registration picked up by the executing side. Dropping it consumes the
/// registration, on every exit path.
pub(crate) struct ClaimedActivity {
    pub activity: Activity,
    pub context: InvocationContext,
    _remove: RegistrationGuard,
}

impl ClaimedActivity {
    pub fn context_for(&self, execution_id: &str, attempt: u32, instance: WorkflowInstance) -> ActivityContext {
        ActivityContext {
            workflow_name: self.context.workflow.name().to_string(),
            execution_id: execution_id.to_string(),
            activity_name: self.activity.name().to_string(),
            attempt,
            instance,
        }
    }
}
