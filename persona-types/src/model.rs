//! The data model (§3): Persona, Tool Definition, Event, Event
//! Subscription, Trigger, and Execution Record.

use crate::duration::DurationMs;
use crate::id::{
    CredentialId, EventId, ExecutionId, PersonaId, ProjectId, SubscriptionId, ToolId, TriggerId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The template of an executable agent. Immutable at execution time —
/// created and updated by external CRUD, never by the core.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Persona identifier.
    pub id: PersonaId,
    /// Tenancy boundary.
    pub project_id: ProjectId,
    /// Human-readable name, used as the prompt header.
    pub name: String,
    /// Raw system-prompt string, used when `structured_prompt` is absent
    /// or unparseable.
    pub system_prompt: String,
    /// Optional structured-prompt blob (Identity/Instructions/ToolGuidance/
    /// Examples/ErrorHandling/CustomSections/WebSearch sections).
    pub structured_prompt: Option<serde_json::Value>,
    /// Whether this persona accepts new executions.
    pub enabled: bool,
    /// Upper bound on simultaneously `running` executions for this persona.
    pub max_concurrent: u32,
    /// Default worker-side execution timeout.
    pub timeout_ms: u64,
    /// Opaque descriptor selecting the upstream model provider.
    pub model_profile: Option<ModelProfile>,
    /// Spending ceiling across this persona's executions, in USD. Stored
    /// for external CRUD and billing to read; nothing in this core
    /// compares it against accumulated `ExecutionRecord::cost_usd` or
    /// rejects a dispatch because of it.
    pub budget_usd: Option<Decimal>,
    /// Spending ceiling for a single execution, in USD. Same storage-only
    /// treatment as `budget_usd`.
    pub max_cost_per_execution_usd: Option<Decimal>,
    /// Credential identifiers bound to this persona.
    pub bound_credentials: Vec<CredentialId>,
    /// Tool identifiers bound to this persona.
    pub bound_tools: Vec<ToolId>,
}

impl Persona {
    /// Construct a `Persona` from its fields.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: PersonaId,
        project_id: ProjectId,
        name: String,
        system_prompt: String,
        structured_prompt: Option<serde_json::Value>,
        enabled: bool,
        max_concurrent: u32,
        timeout_ms: u64,
        model_profile: Option<ModelProfile>,
        budget_usd: Option<Decimal>,
        max_cost_per_execution_usd: Option<Decimal>,
        bound_credentials: Vec<CredentialId>,
        bound_tools: Vec<ToolId>,
    ) -> Self {
        Self {
            id,
            project_id,
            name,
            system_prompt,
            structured_prompt,
            enabled,
            max_concurrent,
            timeout_ms,
            model_profile,
            budget_usd,
            max_cost_per_execution_usd,
            bound_credentials,
            bound_tools,
        }
    }
}

/// Opaque descriptor attached to a persona selecting the upstream model
/// provider and substituting env vars accordingly (§4.3 step 2).
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ModelProfile {
    /// Use the default bearer-token provider; no overrides.
    Default,
    /// Ollama: local inference server, no bearer token.
    Ollama {
        /// Base URL of the Ollama server.
        base_url: String,
    },
    /// LiteLLM proxy: substitute base URL and auth-token env var.
    Litellm {
        /// Base URL of the LiteLLM proxy.
        base_url: String,
        /// Env var name carrying the proxy's auth token.
        auth_env_var: String,
    },
    /// Fully custom provider override.
    Custom {
        /// Base URL env var name.
        base_url_env_var: String,
        /// Base URL value.
        base_url: String,
        /// Auth token env var name.
        auth_env_var: String,
    },
}

/// Documentation contributed to the assembled prompt; referenced by
/// `Persona` via a many-to-many link.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool identifier.
    pub id: ToolId,
    /// Tool name, shown in the "Available Tools" prompt section.
    pub name: String,
    /// Category grouping, shown alongside the name.
    pub category: Option<String>,
    /// Human-readable description.
    pub description: String,
    /// Implementation guide text or a script path.
    pub implementation: ToolImplementation,
    /// JSON schema describing the tool's input.
    pub input_schema: Option<serde_json::Value>,
    /// Name of the credential this tool requires, if any.
    pub credential_requirement: Option<String>,
}

/// How a tool is implemented — either documented inline or backed by a
/// script the worker invokes.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolImplementation {
    /// Free-text guidance for the model on how to use this tool.
    Guide {
        /// The guidance text.
        text: String,
    },
    /// A script path the worker executes for this tool.
    Script {
        /// Path to the script, relative to the worker's tool root.
        path: String,
    },
}

/// Status of a pending event (§3 invariants: monotonic, never reversed).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Newly created, not yet examined by a tick.
    Pending,
    /// Claimed by a tick; the CAS guard against concurrent processing.
    Processing,
    /// All matches submitted successfully.
    Delivered,
    /// Some matches submitted, some failed.
    Partial,
    /// All matches failed, or an error occurred before any could be tried.
    Failed,
    /// No subscriptions matched.
    Skipped,
}

/// A pending piece of work (§3).
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier.
    pub id: EventId,
    /// Tenancy boundary.
    pub project_id: ProjectId,
    /// The event type, matched against subscription `event_type`.
    pub event_type: String,
    /// What kind of thing produced this event (e.g. "trigger", "webhook").
    pub source_type: String,
    /// Identifier of the thing that produced this event, used for
    /// source-filter matching.
    pub source_id: Option<String>,
    /// If set, only subscriptions owned by this persona can match.
    pub target_persona_id: Option<PersonaId>,
    /// Opaque JSON-or-plain-text payload forwarded to matched personas.
    pub payload: Option<String>,
    /// Current lifecycle status.
    pub status: EventStatus,
    /// Correlates this event to a use case for prompt-time filtering.
    pub use_case_id: Option<String>,
    /// Creation timestamp, Unix milliseconds.
    pub created_at_ms: u64,
    /// When this event was last transitioned out of `pending`.
    pub processed_at_ms: Option<u64>,
    /// Set when `status` reaches a terminal value with no successful
    /// match, explaining the failure.
    pub error_message: Option<String>,
}

impl Event {
    /// Create a freshly pending event.
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        id: EventId,
        project_id: ProjectId,
        event_type: String,
        source_type: String,
        source_id: Option<String>,
        target_persona_id: Option<PersonaId>,
        payload: Option<String>,
        use_case_id: Option<String>,
        created_at_ms: u64,
    ) -> Self {
        Self {
            id,
            project_id,
            event_type,
            source_type,
            source_id,
            target_persona_id,
            payload,
            status: EventStatus::Pending,
            use_case_id,
            created_at_ms,
            processed_at_ms: None,
            error_message: None,
        }
    }
}

/// A declarative binding from an event type (optionally filtered by
/// source) to a persona (§3). Pure configuration; the core only reads.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSubscription {
    /// Subscription identifier.
    pub id: SubscriptionId,
    /// Tenancy boundary.
    pub project_id: ProjectId,
    /// Persona that should execute on a match.
    pub persona_id: PersonaId,
    /// Event type this subscription listens for.
    pub event_type: String,
    /// Optional source filter: an exact string, or a string ending in
    /// `*` matched as a prefix.
    pub source_filter: Option<String>,
    /// Whether this subscription currently participates in matching.
    pub enabled: bool,
}

impl EventSubscription {
    /// Construct an `EventSubscription` from its fields.
    pub fn new(
        id: SubscriptionId,
        project_id: ProjectId,
        persona_id: PersonaId,
        event_type: String,
        source_filter: Option<String>,
        enabled: bool,
    ) -> Self {
        Self {
            id,
            project_id,
            persona_id,
            event_type,
            source_filter,
            enabled,
        }
    }
}

/// How a trigger is driven.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Fired only by an explicit external call; never picked up by the tick.
    Manual,
    /// Fired on a time schedule (cron-lite or interval).
    Schedule,
    /// Reserved for a separate polling mechanism; the tick skips these.
    Polling,
    /// Fired by an inbound webhook; not driven by the tick.
    Webhook,
    /// Fired as a follow-up to another trigger/event chain.
    Chain,
}

/// A time- or rule-based event source (§3).
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    /// Trigger identifier.
    pub id: TriggerId,
    /// Tenancy boundary.
    pub project_id: ProjectId,
    /// Persona this trigger targets.
    pub persona_id: PersonaId,
    /// Drives how this trigger is evaluated.
    pub trigger_type: TriggerType,
    /// Opaque JSON configuration (e.g. `{"cron": "every 10s"}`).
    pub config: String,
    /// Whether the scheduler considers this trigger at all.
    pub enabled: bool,
    /// Last time this trigger fired, Unix milliseconds.
    pub last_triggered_at_ms: Option<u64>,
    /// Next time this trigger should fire, Unix milliseconds.
    pub next_trigger_at_ms: Option<u64>,
    /// Correlates fired events to a use case.
    pub use_case_id: Option<String>,
}

/// Status of an execution record (§3).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Submitted, waiting for a worker.
    Queued,
    /// Assigned to a worker and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error, or the worker disconnected mid-run.
    Failed,
    /// Cancelled via `cancel` before the worker reported completion.
    Cancelled,
}

/// A persona's encrypted secret as stored at rest (§4.3 step 2). The
/// ciphertext is opaque to everything except `persona-secret`'s master
/// key.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Credential identifier.
    pub id: CredentialId,
    /// Tenancy boundary.
    pub project_id: ProjectId,
    /// Declared name, used to derive the `CONNECTOR_<NAME>` env var family.
    pub name: String,
    /// Base64-encoded `nonce || ciphertext`.
    pub ciphertext_b64: String,
}

/// Durable record of one execution, mutated on state transitions (§3).
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Execution identifier.
    pub id: ExecutionId,
    /// Tenancy boundary.
    pub project_id: ProjectId,
    /// Persona this execution ran.
    pub persona_id: PersonaId,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// When the worker began executing, Unix milliseconds.
    pub started_at_ms: Option<u64>,
    /// When the execution reached a terminal state, Unix milliseconds.
    pub completed_at_ms: Option<u64>,
    /// Wall-clock duration as reported by the worker's `complete` frame.
    pub duration_ms: Option<DurationMs>,
    /// Opaque session identifier returned by the worker, if any.
    pub session_id: Option<String>,
    /// Cost of this execution as reported by the worker, if any.
    pub cost_usd: Option<Decimal>,
    /// Set on failure; the fixed string `"Worker disconnected"` for
    /// mid-execution disconnects (§7).
    pub error_message: Option<String>,
    /// Accumulated stdout/stderr, appended in arrival order.
    pub output_data: String,
}

impl ExecutionRecord {
    /// Create a freshly queued execution record.
    pub fn queued(
        id: ExecutionId,
        project_id: ProjectId,
        persona_id: PersonaId,
    ) -> Self {
        Self {
            id,
            project_id,
            persona_id,
            status: ExecutionStatus::Queued,
            started_at_ms: None,
            completed_at_ms: None,
            duration_ms: None,
            session_id: None,
            cost_usd: None,
            error_message: None,
            output_data: String::new(),
        }
    }
}
