//! Pure event-to-subscription matching (§4.8). No I/O, no locks: the
//! Event Processor tick calls these against whatever subscriptions it
//! already has in hand.

use crate::model::{Event, EventSubscription};

/// Whether `source_id` satisfies `filter`.
///
/// `filter` of `None` matches anything. A filter ending in `*` matches
/// any source id sharing its prefix (the `*` itself is stripped before
/// comparison — `"github*"` matches `"github"` and `"github-webhook"`
/// alike). Any other filter must match `source_id` exactly. A `None`
/// `source_id` only satisfies a `None` filter.
pub fn source_filter_matches(filter: Option<&str>, source_id: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(f) => match source_id {
            None => false,
            Some(id) => match f.strip_suffix('*') {
                Some(prefix) => id.starts_with(prefix),
                None => id == f,
            },
        },
    }
}

/// Subscriptions matching `event` out of `candidates`, in the order
/// given. A subscription matches when it is enabled, its `event_type`
/// equals the event's, its source filter is satisfied, and — when the
/// event names a `target_persona_id` — the subscription belongs to that
/// persona.
pub fn match_event<'a>(
    event: &Event,
    candidates: &'a [EventSubscription],
) -> Vec<&'a EventSubscription> {
    candidates
        .iter()
        .filter(|sub| sub.enabled)
        .filter(|sub| sub.event_type == event.event_type)
        .filter(|sub| source_filter_matches(sub.source_filter.as_deref(), event.source_id.as_deref()))
        .filter(|sub| match &event.target_persona_id {
            Some(target) => &sub.persona_id == target,
            None => true,
        })
        .collect()
}
