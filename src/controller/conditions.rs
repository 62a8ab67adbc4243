//! Condition management helpers following Kubernetes API conventions
//!
//! The `Ready` condition's reason doubles as the pipeline state:
//!
//! ```text
//! (none) -> Pending -> Creating -> Initialize -> Ready
//!                         |            |          |
//!                         +------------+----------+--> Error (absorbing)
//!                                                       Failure (recovery exhausted)
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::Utc;

use crate::crd::{Condition, ManagedResource};

/// Condition type routing the top-level pipeline
pub const CONDITION_TYPE_READY: &str = "Ready";
/// Sub-feature: the Trillian tree id is known
pub const CONDITION_TYPE_TREE_RESOLVED: &str = "TreeResolved";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Reasons the Ready condition moves through
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReadyReason {
    Pending,
    Creating,
    Initialize,
    Ready,
    Error,
    Failure,
}

impl ReadyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadyReason::Pending => "Pending",
            ReadyReason::Creating => "Creating",
            ReadyReason::Initialize => "Initialize",
            ReadyReason::Ready => "Ready",
            ReadyReason::Error => "Error",
            ReadyReason::Failure => "Failure",
        }
    }
}

impl fmt::Display for ReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadyReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(ReadyReason::Pending),
            "Creating" => Ok(ReadyReason::Creating),
            "Initialize" => Ok(ReadyReason::Initialize),
            "Ready" => Ok(ReadyReason::Ready),
            "Error" => Ok(ReadyReason::Error),
            "Failure" => Ok(ReadyReason::Failure),
            other => Err(format!("unknown Ready reason {other:?}")),
        }
    }
}

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Check that every listed condition type is present and true
pub fn all_true(conditions: &[Condition], types: &[&str]) -> bool {
    types.iter().all(|t| is_condition_true(conditions, t))
}

/// Current Ready reason, `None` when Ready is missing or carries an unknown reason
pub fn ready_reason<K: ManagedResource>(obj: &K) -> Option<ReadyReason> {
    find_condition(obj.conditions(), CONDITION_TYPE_READY).and_then(|c| c.reason.parse().ok())
}

/// Check the Ready reason against a set of states
pub fn ready_reason_in<K: ManagedResource>(obj: &K, states: &[ReadyReason]) -> bool {
    ready_reason(obj).is_some_and(|r| states.contains(&r))
}

/// Set a condition stamped with the object's current generation
pub fn set_object_condition<K: ManagedResource>(
    obj: &mut K,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let generation = obj.meta().generation;
    set_condition(obj.conditions_mut(), type_, status, reason, message, generation);
}

/// Move the Ready condition to `reason`; status is True only for [`ReadyReason::Ready`]
pub fn set_ready<K: ManagedResource>(obj: &mut K, reason: ReadyReason, message: &str) {
    let status = if reason == ReadyReason::Ready {
        CONDITION_STATUS_TRUE
    } else {
        CONDITION_STATUS_FALSE
    };
    set_object_condition(obj, CONDITION_TYPE_READY, status, reason.as_str(), message);
}
