#![deny(missing_docs)]
//! The Trigger Scheduler tick (§4.7): periodically fires due time-based
//! triggers, synthesizing a pending event for each and recomputing its
//! next fire time.

use persona_store::PersonaStore;
use persona_types::{Event, EventId, ProjectId, StoreError, Trigger, TriggerId, TriggerType};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// How often the Trigger Scheduler evaluates due triggers.
pub const TRIGGER_TICK_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_EVENT_TYPE: &str = "trigger_fired";
const FALLBACK_INTERVAL_MS: u64 = 60 * 60 * 1_000;

static CRON_LITE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^every (\d+)([smhd])$").expect("static pattern"));

/// Drives the periodic trigger-to-event synthesis loop.
pub struct TriggerScheduler {
    store: Arc<dyn PersonaStore>,
}

impl TriggerScheduler {
    /// Build a scheduler against a store.
    pub fn new(store: Arc<dyn PersonaStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Spawn the background tick loop. Holds the returned handle for the
    /// life of the process.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TRIGGER_TICK_INTERVAL);
            loop {
                interval.tick().await;
                scheduler.run_tick().await;
            }
        })
    }

    /// Run one tick synchronously (used directly by tests; `spawn` just
    /// calls this on a timer).
    pub async fn run_tick(&self) {
        let now = now_ms();
        let due = match self.store.due_triggers(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to read due triggers, skipping this tick");
                return;
            }
        };

        for trigger in due {
            if trigger.trigger_type == TriggerType::Polling {
                continue;
            }
            let trigger_id = trigger.id.clone();
            if let Err(e) = self.fire_trigger(trigger, now).await {
                error!(trigger_id = %trigger_id, error = %e, "trigger tick failed for one trigger");
            }
        }
    }

    async fn fire_trigger(&self, trigger: Trigger, now: u64) -> Result<(), StoreError> {
        let config: serde_json::Value =
            serde_json::from_str(&trigger.config).unwrap_or_else(|_| serde_json::json!({}));

        let event_type = config
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_EVENT_TYPE)
            .to_string();
        let payload = config.get("payload").map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        });

        let project_id = match self.store.load_persona(&trigger.persona_id).await? {
            Some(persona) => persona.project_id,
            None => {
                warn!(persona_id = %trigger.persona_id, trigger_id = %trigger.id, "trigger targets a missing persona");
                ProjectId::default_project()
            }
        };

        self.store
            .insert_event(Event::pending(
                EventId::new(""),
                project_id,
                event_type,
                "trigger".to_string(),
                Some(trigger.id.to_string()),
                Some(trigger.persona_id.clone()),
                payload,
                trigger.use_case_id.clone(),
                now,
            ))
            .await?;

        let next = next_trigger_at(trigger.trigger_type, &config, now, &trigger.id);
        self.store
            .update_trigger_timings(&trigger.id, now, next)
            .await
    }
}

fn next_trigger_at(trigger_type: TriggerType, config: &serde_json::Value, now: u64, trigger_id: &TriggerId) -> u64 {
    if trigger_type == TriggerType::Schedule {
        if let Some(cron) = config.get("cron").and_then(|v| v.as_str()) {
            if let Some(caps) = CRON_LITE.captures(cron) {
                let amount: u64 = caps[1].parse().unwrap_or(0);
                let unit_ms = match caps[2].to_ascii_lowercase().as_str() {
                    "s" => 1_000,
                    "m" => 60_000,
                    "h" => 3_600_000,
                    "d" => 86_400_000,
                    _ => 0,
                };
                if amount > 0 && unit_ms > 0 {
                    return now + amount * unit_ms;
                }
            }
        }
        if let Some(secs) = config.get("interval_seconds").and_then(|v| v.as_u64()) {
            return now + secs * 1_000;
        }
    }

    warn!(trigger_id = %trigger_id, config = %config, "trigger has no recognized schedule, falling back to +1h");
    now + FALLBACK_INTERVAL_MS
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
