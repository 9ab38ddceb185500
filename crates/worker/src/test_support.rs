use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chorus_core::clock::ManualClock;
use chorus_core::day_key::DayCalendar;
use chorus_db::MemoryStore;
use chorus_economy::{EconomyConfig, TokenEconomy};
use chorus_events::EventBus;
use chorus_provider::{
    Contribution, FixedContribution, GenerationOutput, GenerationProvider, ProviderError,
};
use chorus_queue::{JobQueue, QueueConfig};
use chrono::{TimeZone, Utc};

use crate::admission::{Admission, PriorityPolicy};

/// Provider that echoes the prompt back.
pub struct EchoProvider;

#[async_trait]
impl GenerationProvider for EchoProvider {
    async fn generate(
        &self,
        payload: &serde_json::Value,
        _timeout: Duration,
    ) -> Result<GenerationOutput, ProviderError> {
        Ok(GenerationOutput::new(serde_json::json!({ "prompt": payload["prompt"] })))
    }
}

pub struct Stack {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub economy: Arc<TokenEconomy>,
    pub queue: Arc<JobQueue>,
    pub admission: Admission,
}

pub fn stack() -> Stack {
    stack_with(QueueConfig::default())
}

/// Full in-memory stack; the clock starts at 2026-04-01 12:00 UTC.
pub fn stack_with(config: QueueConfig) -> Stack {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()));
    let economy = Arc::new(TokenEconomy::new(
        store.clone(),
        store.clone(),
        Arc::new(FixedContribution(Contribution::new(40, 60))),
        clock.clone(),
        EconomyConfig::default(),
    ));
    let queue = Arc::new(JobQueue::new(
        store.clone(),
        Arc::new(EchoProvider),
        Arc::new(EventBus::default()),
        clock.clone(),
        config,
    ));
    let admission = Admission::new(
        economy.clone(),
        queue.clone(),
        clock.clone(),
        DayCalendar::utc(),
        PriorityPolicy::default(),
    );
    Stack {
        store,
        clock,
        economy,
        queue,
        admission,
    }
}
