use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chorus_core::clock::ManualClock;
use chorus_db::MemoryStore;
use chorus_events::EventBus;
use chorus_provider::{GenerationOutput, GenerationProvider, ProviderError};
use chrono::{TimeZone, Utc};

use crate::config::QueueConfig;
use crate::queue::JobQueue;

/// Provider that replays a script of results, then succeeds.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<GenerationOutput, ProviderError>>>,
    seen: Mutex<Vec<serde_json::Value>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<GenerationOutput, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Vec::new())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// The `n` field of every payload, in call order.
    pub fn payload_ids(&self) -> Vec<u64> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|p| p["n"].as_u64().unwrap())
            .collect()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    async fn generate(
        &self,
        payload: &serde_json::Value,
        _timeout: Duration,
    ) -> Result<GenerationOutput, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.seen.lock().unwrap().push(payload.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(GenerationOutput::new(serde_json::json!({"clip": payload["n"]}))))
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<ScriptedProvider>,
    pub clock: Arc<ManualClock>,
    pub bus: Arc<EventBus>,
    pub queue: Arc<JobQueue>,
}

pub fn harness(provider: ScriptedProvider) -> Harness {
    harness_with(provider, QueueConfig::default())
}

pub fn harness_with(provider: ScriptedProvider, config: QueueConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(provider);
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()));
    let bus = Arc::new(EventBus::default());
    let queue = Arc::new(JobQueue::new(
        store.clone(),
        provider.clone(),
        bus.clone(),
        clock.clone(),
        config,
    ));
    Harness {
        store,
        provider,
        clock,
        bus,
        queue,
    }
}

pub fn payload(n: usize) -> serde_json::Value {
    serde_json::json!({ "n": n, "prompt": "test" })
}
