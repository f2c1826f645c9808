//! Stable storage format for `ExecutionRecord::duration_ms`.
//!
//! Worker `complete` frames and `persona-wire`'s frame types carry the
//! wall-clock duration as a plain `u64` millisecond count — there is no
//! wrapper on the wire. [`DurationMs`] exists only at the execution-record
//! boundary, where that `u64` gets stored: wrapping it keeps
//! `ExecutionRecord` from exposing a bare, unit-less integer and pins the
//! JSON representation to a plain integer rather than serde's
//! `{"secs": N, "nanos": N}` `Duration` encoding, in case a future refactor
//! swaps the field's Rust type without meaning to change the HTTP
//! response shape external clients read it from.

use serde::{Deserialize, Serialize};

/// A duration, stored and serialized as milliseconds.
///
/// # Examples
///
/// ```
/// use persona_types::DurationMs;
///
/// let d = DurationMs::from_millis(1500);
/// assert_eq!(d.as_millis(), 1500);
///
/// let json = serde_json::to_string(&d).unwrap();
/// assert_eq!(json, "1500");
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationMs(u64);

impl DurationMs {
    /// Wrap a millisecond count reported by a worker's `complete` frame.
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// Unwrap back to the raw millisecond count.
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}
