//! Typed ID wrappers for every entity the core touches.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed ID wrappers prevent mixing up a `WorkerId` with an `ExecutionId`.
/// These are plain strings underneath — no UUID enforcement, no format
/// requirement. Callers that want UUIDs can generate one and wrap it.
macro_rules! typed_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new typed ID from anything that converts to String.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

typed_id!(ProjectId, "Tenancy boundary; defaults to \"default\".");
typed_id!(PersonaId, "Identifies a persona template.");
typed_id!(ExecutionId, "Identifies one execution (run) of a persona.");
typed_id!(WorkerId, "Identifies a connected worker session.");
typed_id!(EventId, "Identifies a pending unit of work.");
typed_id!(SubscriptionId, "Identifies an event subscription.");
typed_id!(TriggerId, "Identifies a time- or rule-based event source.");
typed_id!(CredentialId, "Identifies an encrypted per-persona secret.");
typed_id!(ToolId, "Identifies a tool definition.");

impl ProjectId {
    /// The tenancy boundary used when no project is specified.
    pub fn default_project() -> Self {
        Self("default".to_string())
    }

    /// Whether this is the default (non-tenant-scoped) project.
    pub fn is_default(&self) -> bool {
        self.0 == "default"
    }
}
