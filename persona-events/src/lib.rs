#![deny(missing_docs)]
//! The Event Processor tick (§4.6): periodically drains pending events,
//! matches them against subscriptions, enforces each persona's
//! concurrency ceiling, and hands matches to the Dispatcher.
//!
//! Prompt assembly itself is not duplicated here — a matched
//! subscription is submitted to [`persona_dispatch::Dispatcher`] exactly
//! like any other request, and the Dispatcher's own `dispatchToWorker`
//! step does the persona/tool lookup and prompt assembly it already
//! needs to do for every submission.
//!
//! Matches are dispatched one at a time, in order, rather than fanned
//! out concurrently: `dispatch_match`'s concurrency check
//! (`count_running_executions` then `submit`) is check-then-act with no
//! lock held across the gap, so two matches for the same persona
//! spawned side by side could both read the running count before either
//! submits and both pass a `maxConcurrent` gate meant to admit only one.
//! Awaiting each match before starting the next closes that window.

use persona_dispatch::{DispatchRequest, Dispatcher};
use persona_store::PersonaStore;
use persona_types::{match_event, Event, EventStatus, EventSubscription, StoreError};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// How often the Event Processor drains pending events.
pub const EVENT_TICK_INTERVAL: Duration = Duration::from_secs(2);

/// Maximum events drained per tick.
pub const EVENT_BATCH_LIMIT: usize = 50;

const ALL_MATCHES_FAILED_MESSAGE: &str = "All subscription matches failed";

/// Drives the periodic event-to-persona delivery loop.
pub struct EventProcessor {
    store: Arc<dyn PersonaStore>,
    dispatcher: Arc<Dispatcher>,
}

impl EventProcessor {
    /// Build a processor against a store and the dispatcher it submits
    /// matched executions to.
    pub fn new(store: Arc<dyn PersonaStore>, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self { store, dispatcher })
    }

    /// Spawn the background tick loop. Holds the returned handle for the
    /// life of the process.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVENT_TICK_INTERVAL);
            loop {
                interval.tick().await;
                processor.run_tick().await;
            }
        })
    }

    /// Run one tick synchronously (used directly by tests; `spawn` just
    /// calls this on a timer).
    pub async fn run_tick(&self) {
        let events = match self.store.read_pending_events(EVENT_BATCH_LIMIT).await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "failed to read pending events, skipping this tick");
                return;
            }
        };

        for event in events {
            if let Err(e) = self.process_event(event).await {
                error!(error = %e, "event processor tick failed for one event");
            }
        }
    }

    async fn process_event(&self, event: Event) -> Result<(), StoreError> {
        if !self.store.try_claim_event(&event.id).await? {
            return Ok(());
        }

        let subscriptions = self
            .store
            .list_subscriptions(&event.project_id, &event.event_type)
            .await?;
        let matches = match_event(&event, &subscriptions);

        if matches.is_empty() {
            self.store
                .set_event_status(&event.id, EventStatus::Skipped, Some(now_ms()), None)
                .await?;
            return Ok(());
        }

        let mut delivered = 0usize;
        let mut failed = 0usize;
        for sub in &matches {
            let outcome = dispatch_match(
                &self.store,
                &self.dispatcher,
                sub.persona_id.clone(),
                event.payload.clone(),
            )
            .await;
            match outcome {
                Ok(()) => delivered += 1,
                Err(reason) => {
                    warn!(
                        subscription_id = %sub.id,
                        persona_id = %sub.persona_id,
                        reason,
                        "subscription match not dispatched"
                    );
                    failed += 1;
                }
            }
        }

        let (status, error_message) = if failed == 0 {
            (EventStatus::Delivered, None)
        } else if delivered > 0 {
            (EventStatus::Partial, None)
        } else {
            (EventStatus::Failed, Some(ALL_MATCHES_FAILED_MESSAGE.to_string()))
        };
        self.store
            .set_event_status(&event.id, status, Some(now_ms()), error_message)
            .await?;
        Ok(())
    }
}

async fn dispatch_match(
    store: &Arc<dyn PersonaStore>,
    dispatcher: &Arc<Dispatcher>,
    persona_id: persona_types::PersonaId,
    payload: Option<String>,
) -> Result<(), String> {
    let persona = store
        .load_persona(&persona_id)
        .await
        .map_err(|e| format!("persona lookup failed: {e}"))?;
    let persona = match persona {
        Some(persona) => persona,
        None => return Err("persona not found".to_string()),
    };

    let running = store
        .count_running_executions(&persona.id)
        .await
        .map_err(|e| format!("concurrency check failed: {e}"))?;
    if running >= persona.max_concurrent {
        return Err("concurrency limit reached".to_string());
    }

    let input_data = payload
        .as_deref()
        .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "raw": raw })));

    dispatcher
        .submit(DispatchRequest {
            project_id: persona.project_id,
            persona_id: persona.id,
            prompt: String::new(),
            input_data,
            timeout_ms: None,
        })
        .await;

    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
