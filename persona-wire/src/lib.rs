#![deny(missing_docs)]
//! The wire codec (§4.1): tagged JSON frames exchanged over a single
//! duplex, message-oriented WebSocket channel per worker.
//!
//! Exchange is asymmetric — [`WorkerFrame`] flows worker-to-orchestrator,
//! [`OrchestratorFrame`] flows orchestrator-to-worker — but the codec
//! itself is symmetric: both sides encode with [`encode`] and decode
//! with [`decode`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from frame encoding/decoding.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum WireError {
    /// The text did not parse as JSON, or parsed but didn't match any
    /// known frame shape (unparseable message; §4.1: dropped with a
    /// warning by the caller).
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Execution outcome reported in a worker's `complete` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// Execution finished successfully.
    Completed,
    /// Execution finished with a non-zero exit or internal error.
    Failed,
    /// Execution was cancelled before completion.
    Cancelled,
}

/// The kind of persona-emitted event carried in a worker's `event` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaEventType {
    /// The persona is requesting a human review before continuing.
    ManualReview,
    /// The persona is sending a message intended for a human user.
    UserMessage,
    /// The persona is invoking a named action.
    PersonaAction,
    /// The persona is emitting a new pending event into the system.
    EmitEvent,
}

/// Frames sent by a worker to the orchestrator (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// First frame a worker must send; identifies it and its capabilities.
    Hello {
        /// The worker's self-reported identifier.
        #[serde(rename = "workerId")]
        worker_id: String,
        /// Worker build/version string.
        version: String,
        /// Capability tags the worker advertises.
        capabilities: Vec<String>,
    },
    /// Sent once the worker has processed `ack` and is ready for assignments.
    Ready {},
    /// A chunk of stdout for a running execution.
    Stdout {
        /// The execution this chunk belongs to.
        #[serde(rename = "executionId")]
        execution_id: String,
        /// Raw chunk bytes, as UTF-8 text.
        chunk: String,
        /// Worker-side timestamp, Unix milliseconds.
        timestamp: u64,
    },
    /// A chunk of stderr for a running execution.
    Stderr {
        /// The execution this chunk belongs to.
        #[serde(rename = "executionId")]
        execution_id: String,
        /// Raw chunk bytes, as UTF-8 text.
        chunk: String,
        /// Worker-side timestamp, Unix milliseconds.
        timestamp: u64,
    },
    /// Reports that an execution has reached a terminal state.
    Complete {
        /// The execution that finished.
        #[serde(rename = "executionId")]
        execution_id: String,
        /// Terminal status.
        status: CompletionStatus,
        /// Process exit code, if applicable.
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        /// Wall-clock duration of the execution, in milliseconds.
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        /// Opaque upstream session id, if the provider returned one.
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Upstream-reported cost in USD, if known.
        #[serde(rename = "totalCostUsd", skip_serializing_if = "Option::is_none")]
        total_cost_usd: Option<String>,
    },
    /// A persona-emitted event mid-execution.
    Event {
        /// The execution emitting this event.
        #[serde(rename = "executionId")]
        execution_id: String,
        /// The kind of persona event.
        #[serde(rename = "eventType")]
        event_type: PersonaEventType,
        /// Opaque payload.
        payload: serde_json::Value,
    },
    /// Keep-alive reply to the orchestrator's heartbeat, or worker-initiated.
    Heartbeat {
        /// Worker-side timestamp, Unix milliseconds.
        timestamp: u64,
    },
}

/// Resource limits and behavior attached to an `assign` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignConfig {
    /// Worker-side execution timeout.
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    /// Cap on the in-memory output buffer the worker enforces.
    #[serde(rename = "maxOutputBytes")]
    pub max_output_bytes: u64,
}

/// Frames sent by the orchestrator to a worker (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorFrame {
    /// Reply to a worker's `hello`, admitting it into the pool.
    Ack {
        /// Echoes the worker's self-reported id.
        #[serde(rename = "workerId")]
        worker_id: String,
        /// Opaque session token the worker may use for reconnection.
        #[serde(rename = "sessionToken")]
        session_token: String,
    },
    /// Assigns an execution to an idle worker.
    Assign {
        /// The execution being assigned.
        #[serde(rename = "executionId")]
        execution_id: String,
        /// The persona driving this execution.
        #[serde(rename = "personaId")]
        persona_id: String,
        /// Assembled prompt text.
        prompt: String,
        /// Environment variables to inject into the worker process.
        env: std::collections::BTreeMap<String, String>,
        /// Resource limits for this execution.
        config: AssignConfig,
    },
    /// Advisory cancellation of a running execution.
    Cancel {
        /// The execution to cancel.
        #[serde(rename = "executionId")]
        execution_id: String,
    },
    /// Broadcast to every connected worker before the pool shuts down.
    Shutdown {
        /// Human-readable shutdown reason.
        reason: String,
        /// How long workers have to wind down before a forced close.
        #[serde(rename = "gracePeriodMs")]
        grace_period_ms: u64,
    },
    /// Keep-alive probe to a worker.
    Heartbeat {
        /// Orchestrator-side timestamp, Unix milliseconds.
        timestamp: u64,
    },
}

/// Encode a frame as a single line of UTF-8 JSON text (§4.1: one message
/// per WebSocket text frame).
pub fn encode<T: Serialize>(frame: &T) -> Result<String, WireError> {
    serde_json::to_string(frame).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Decode a single text frame. Unparseable text (bad JSON, or JSON that
/// doesn't match any known `type` discriminant) is reported as
/// [`WireError::Malformed`] — the caller is expected to drop it with a
/// warning rather than close the transport.
pub fn decode<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, WireError> {
    serde_json::from_str(text).map_err(|e| WireError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_frame_roundtrips() {
        let frame = WorkerFrame::Hello {
            worker_id: "w-1".to_string(),
            version: "1.0.0".to_string(),
            capabilities: vec!["shell".to_string()],
        };
        let text = encode(&frame).unwrap();
        assert!(text.contains("\"type\":\"hello\""));
        let decoded: WorkerFrame = decode(&text).unwrap();
        match decoded {
            WorkerFrame::Hello { worker_id, .. } => assert_eq!(worker_id, "w-1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn assign_frame_roundtrips() {
        let mut env = std::collections::BTreeMap::new();
        env.insert("BEARER_TOKEN".to_string(), "tok".to_string());
        let frame = OrchestratorFrame::Assign {
            execution_id: "e-1".to_string(),
            persona_id: "p-1".to_string(),
            prompt: "do the thing".to_string(),
            env,
            config: AssignConfig {
                timeout_ms: 300_000,
                max_output_bytes: 10 * 1024 * 1024,
            },
        };
        let text = encode(&frame).unwrap();
        let decoded: OrchestratorFrame = decode(&text).unwrap();
        match decoded {
            OrchestratorFrame::Assign { execution_id, .. } => assert_eq!(execution_id, "e-1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_discriminant_is_malformed() {
        let result: Result<WorkerFrame, _> = decode(r#"{"type":"not_a_real_frame"}"#);
        assert!(matches!(result, Err(WireError::Malformed(_))));
    }

    #[test]
    fn invalid_json_is_malformed() {
        let result: Result<WorkerFrame, _> = decode("not json at all");
        assert!(matches!(result, Err(WireError::Malformed(_))));
    }

    #[test]
    fn complete_frame_omits_absent_optional_fields() {
        let frame = WorkerFrame::Complete {
            execution_id: "e-1".to_string(),
            status: CompletionStatus::Completed,
            exit_code: Some(0),
            duration_ms: 1200,
            session_id: None,
            total_cost_usd: None,
        };
        let text = encode(&frame).unwrap();
        assert!(!text.contains("sessionId"));
        assert!(!text.contains("totalCostUsd"));
    }
}
