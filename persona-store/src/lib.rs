#![deny(missing_docs)]
//! The persistence contract (§6) and an in-memory reference
//! implementation.
//!
//! `PersonaStore` is the opaque key-value persona/credential/event/
//! subscription/trigger/execution store the core is driven against. A
//! single-instance deployment can use [`InMemoryStore`] directly; a
//! multi-process deployment needs a backend where reading pending
//! events and transitioning them to `processing` is race-safe, and
//! where trigger due-selection and timing updates together do not
//! double-fire — [`InMemoryStore`] satisfies both trivially by holding
//! everything behind a single `RwLock`.

use async_trait::async_trait;
use persona_types::{
    CredentialRecord, Event, EventId, EventStatus, EventSubscription, ExecutionId,
    ExecutionRecord, ExecutionStatus, Persona, PersonaId, ProjectId, StoreError, ToolDefinition,
    ToolId, Trigger, TriggerId,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// The persistence contract consumed by the Dispatcher, Event Processor
/// tick, and Trigger Scheduler tick (§6).
#[async_trait]
pub trait PersonaStore: Send + Sync {
    /// Load a persona by id.
    async fn load_persona(&self, id: &PersonaId) -> Result<Option<Persona>, StoreError>;

    /// Load the tool definitions bound to a persona.
    async fn load_tools(&self, ids: &[ToolId]) -> Result<Vec<ToolDefinition>, StoreError>;

    /// Load the encrypted credential records bound to a persona.
    async fn load_credentials(
        &self,
        ids: &[persona_types::CredentialId],
    ) -> Result<Vec<CredentialRecord>, StoreError>;

    /// Insert a freshly queued execution record.
    async fn insert_execution(&self, record: ExecutionRecord) -> Result<(), StoreError>;

    /// Fetch an execution record by id.
    async fn get_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Replace an execution record wholesale (status transitions, output
    /// append, timing fields).
    async fn put_execution(&self, record: ExecutionRecord) -> Result<(), StoreError>;

    /// Count executions currently `running` for a persona (§4.6 concurrency gate).
    async fn count_running_executions(&self, persona_id: &PersonaId) -> Result<u32, StoreError>;

    /// Insert a new pending event, returning its assigned id.
    async fn insert_event(&self, event: Event) -> Result<EventId, StoreError>;

    /// Read up to `limit` pending events in ascending `created_at_ms` order.
    async fn read_pending_events(&self, limit: usize) -> Result<Vec<Event>, StoreError>;

    /// Fetch an event by id regardless of status (diagnostics, tests).
    async fn get_event(&self, id: &EventId) -> Result<Option<Event>, StoreError>;

    /// Atomically transition an event from `pending` to `processing`.
    /// Returns `false` if the event was not in `pending` (lost the
    /// race, or already handled) — the guard described in §5.
    async fn try_claim_event(&self, id: &EventId) -> Result<bool, StoreError>;

    /// Set an event's terminal (or otherwise updated) status.
    async fn set_event_status(
        &self,
        id: &EventId,
        status: EventStatus,
        processed_at_ms: Option<u64>,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;

    /// Subscriptions enabled for `event_type`, optionally narrowed to a
    /// non-default project (§4.6 step 2).
    async fn list_subscriptions(
        &self,
        project_id: &ProjectId,
        event_type: &str,
    ) -> Result<Vec<EventSubscription>, StoreError>;

    /// Triggers due to fire: `enabled=true AND next_trigger_at_ms <= now_ms`.
    async fn due_triggers(&self, now_ms: u64) -> Result<Vec<Trigger>, StoreError>;

    /// Persist a trigger's `last_triggered_at_ms`/`next_trigger_at_ms` after it fires.
    async fn update_trigger_timings(
        &self,
        id: &TriggerId,
        last_triggered_at_ms: u64,
        next_trigger_at_ms: u64,
    ) -> Result<(), StoreError>;
}

/// In-memory implementation of [`PersonaStore`], suitable for tests,
/// prototyping, and single-process deployments.
#[derive(Default)]
pub struct InMemoryStore {
    personas: RwLock<HashMap<PersonaId, Persona>>,
    tools: RwLock<HashMap<ToolId, ToolDefinition>>,
    credentials: RwLock<HashMap<persona_types::CredentialId, CredentialRecord>>,
    executions: RwLock<HashMap<ExecutionId, ExecutionRecord>>,
    events: RwLock<HashMap<EventId, Event>>,
    next_event_seq: RwLock<u64>,
    subscriptions: RwLock<HashMap<persona_types::SubscriptionId, EventSubscription>>,
    triggers: RwLock<HashMap<TriggerId, Trigger>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a persona (test/bootstrap helper).
    pub async fn put_persona(&self, persona: Persona) {
        self.personas.write().await.insert(persona.id.clone(), persona);
    }

    /// Seed a tool definition.
    pub async fn put_tool(&self, tool: ToolDefinition) {
        self.tools.write().await.insert(tool.id.clone(), tool);
    }

    /// Seed a credential record.
    pub async fn put_credential(&self, credential: CredentialRecord) {
        self.credentials
            .write()
            .await
            .insert(credential.id.clone(), credential);
    }

    /// Seed a subscription.
    pub async fn put_subscription(&self, subscription: EventSubscription) {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id.clone(), subscription);
    }

    /// Seed a trigger.
    pub async fn put_trigger(&self, trigger: Trigger) {
        self.triggers.write().await.insert(trigger.id.clone(), trigger);
    }
}

#[async_trait]
impl PersonaStore for InMemoryStore {
    async fn load_persona(&self, id: &PersonaId) -> Result<Option<Persona>, StoreError> {
        Ok(self.personas.read().await.get(id).cloned())
    }

    async fn load_tools(&self, ids: &[ToolId]) -> Result<Vec<ToolDefinition>, StoreError> {
        let tools = self.tools.read().await;
        Ok(ids.iter().filter_map(|id| tools.get(id).cloned()).collect())
    }

    async fn load_credentials(
        &self,
        ids: &[persona_types::CredentialId],
    ) -> Result<Vec<CredentialRecord>, StoreError> {
        let credentials = self.credentials.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| credentials.get(id).cloned())
            .collect())
    }

    async fn insert_execution(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        self.executions.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn put_execution(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        self.executions.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn count_running_executions(&self, persona_id: &PersonaId) -> Result<u32, StoreError> {
        let executions = self.executions.read().await;
        Ok(executions
            .values()
            .filter(|e| &e.persona_id == persona_id && e.status == ExecutionStatus::Running)
            .count() as u32)
    }

    async fn insert_event(&self, mut event: Event) -> Result<EventId, StoreError> {
        let mut seq = self.next_event_seq.write().await;
        if event.id.as_str().is_empty() {
            event.id = EventId::new(format!("evt-{}", *seq));
        }
        *seq += 1;
        let id = event.id.clone();
        self.events.write().await.insert(id.clone(), event);
        Ok(id)
    }

    async fn read_pending_events(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let events = self.events.read().await;
        let mut pending: Vec<Event> = events
            .values()
            .filter(|e| e.status == EventStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at_ms);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn get_event(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        Ok(self.events.read().await.get(id).cloned())
    }

    async fn try_claim_event(&self, id: &EventId) -> Result<bool, StoreError> {
        let mut events = self.events.write().await;
        match events.get_mut(id) {
            Some(event) if event.status == EventStatus::Pending => {
                event.status = EventStatus::Processing;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_event_status(
        &self,
        id: &EventId,
        status: EventStatus,
        processed_at_ms: Option<u64>,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut events = self.events.write().await;
        match events.get_mut(id) {
            Some(event) => {
                event.status = status;
                event.processed_at_ms = processed_at_ms;
                event.error_message = error_message;
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn list_subscriptions(
        &self,
        project_id: &ProjectId,
        event_type: &str,
    ) -> Result<Vec<EventSubscription>, StoreError> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .values()
            .filter(|s| s.event_type == event_type)
            .filter(|s| project_id.is_default() || &s.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn due_triggers(&self, now_ms: u64) -> Result<Vec<Trigger>, StoreError> {
        let triggers = self.triggers.read().await;
        Ok(triggers
            .values()
            .filter(|t| t.enabled)
            .filter(|t| t.next_trigger_at_ms.map(|at| at <= now_ms).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn update_trigger_timings(
        &self,
        id: &TriggerId,
        last_triggered_at_ms: u64,
        next_trigger_at_ms: u64,
    ) -> Result<(), StoreError> {
        let mut triggers = self.triggers.write().await;
        match triggers.get_mut(id) {
            Some(trigger) => {
                trigger.last_triggered_at_ms = Some(last_triggered_at_ms);
                trigger.next_trigger_at_ms = Some(next_trigger_at_ms);
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }
}
