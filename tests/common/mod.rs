// Not every test file uses every helper.
#![allow(dead_code)]

pub mod fault_injection;

use entity_workflow::logging::{LogFormat, LoggingConfig, init_logging};
use entity_workflow::providers::in_memory::InMemoryMessageStorage;
use entity_workflow::providers::MessageStorage;
use entity_workflow::sharding::ShardingConfig;
use entity_workflow::{RuntimeOptions, WorkflowDefinition, WorkflowEngine, WorkflowResult};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Options tuned for fast tests: quick storage polls and short backoff.
pub fn fast_options() -> RuntimeOptions {
    let mut options = RuntimeOptions::default();
    options.persistence_retry.base_delay = Duration::from_millis(5);
    options.clock_retry.base_delay = Duration::from_millis(5);
    options.sharding = ShardingConfig {
        storage_poll_interval: Duration::from_millis(50),
        ..ShardingConfig::default()
    };
    options
}

pub async fn start_engine() -> (WorkflowEngine, Arc<InMemoryMessageStorage>) {
    start_engine_with(fast_options()).await
}

pub async fn start_engine_with(options: RuntimeOptions) -> (WorkflowEngine, Arc<InMemoryMessageStorage>) {
    // Ignore the error: another test in this binary may have installed it.
    let _ = init_logging(&LoggingConfig {
        format: LogFormat::Compact,
        level: "warn".to_string(),
    });
    let storage = Arc::new(InMemoryMessageStorage::new());
    let engine = WorkflowEngine::start_local(storage.clone() as Arc<dyn MessageStorage>, options)
        .await
        .expect("engine start");
    (engine, storage)
}

/// Poll until the execution has a result that is not `Suspended`.
pub async fn wait_for_result(
    engine: &WorkflowEngine,
    workflow: &WorkflowDefinition,
    execution_id: &str,
    timeout_ms: u64,
) -> Option<WorkflowResult> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(Some(result)) = engine.poll(workflow, execution_id).await
            && !result.is_suspended()
        {
            return Some(result);
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `predicate` holds.
pub async fn wait_until<F>(predicate: F, timeout_ms: u64) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while !predicate() {
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}
