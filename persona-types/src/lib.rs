//! # persona-types — shared data model for the persona orchestrator
//!
//! Typed identifiers, the core data model (personas, tools, events,
//! subscriptions, triggers, execution records), shared error enums, and
//! the pure event-matching functions. Every other crate in the
//! workspace depends on this one; this one depends on nothing but serde
//! and `rust_decimal`.
//!
//! ## Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`id`] | Typed ID newtypes (`PersonaId`, `ExecutionId`, ...) |
//! | [`model`] | `Persona`, `ToolDefinition`, `Event`, `Trigger`, `ExecutionRecord` |
//! | [`matching`] | Pure subscription matching (`match_event`) |
//! | [`error`] | Shared error enums (`StoreError`, `DispatchError`, `MatchError`) |
//! | [`duration`] | `DurationMs`, `ExecutionRecord`'s millisecond duration |

#![deny(missing_docs)]

pub mod duration;
pub mod error;
pub mod id;
pub mod matching;
pub mod model;

pub use duration::DurationMs;
pub use error::{DispatchError, MatchError, StoreError};
pub use id::{
    CredentialId, EventId, ExecutionId, PersonaId, ProjectId, SubscriptionId, ToolId, TriggerId,
    WorkerId,
};
pub use matching::{match_event, source_filter_matches};
pub use model::{
    CredentialRecord, Event, EventStatus, EventSubscription, ExecutionRecord, ExecutionStatus,
    ModelProfile, Persona, Trigger, TriggerType, ToolDefinition, ToolImplementation,
};
