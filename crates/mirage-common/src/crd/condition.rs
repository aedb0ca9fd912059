//! Kubernetes-style status conditions

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<&str> for ConditionStatus {
    fn from(s: &str) -> Self {
        match s {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., JobCreated, JobComplete)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type exists with status `True`
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Insert or update a condition by type.
///
/// The transition time of an existing condition only moves when its status
/// changes; reason and message are always refreshed.
pub fn upsert_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.status != condition.status => *existing = condition,
        Some(existing) => {
            existing.reason = condition.reason;
            existing.message = condition.message;
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn upsert_appends_new_types() {
        let mut conditions = vec![];
        upsert_condition(
            &mut conditions,
            Condition::new("JobCreated", ConditionStatus::True, "JobCreated", "ok"),
        );
        upsert_condition(
            &mut conditions,
            Condition::new("JobComplete", ConditionStatus::False, "Running", "wait"),
        );
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[1].type_, "JobComplete");
    }

    #[test]
    fn upsert_keeps_transition_time_when_status_unchanged() {
        let mut first = Condition::new("JobComplete", ConditionStatus::False, "A", "a");
        first.last_transition_time = Utc::now() - Duration::hours(2);
        let original_time = first.last_transition_time;
        let mut conditions = vec![first];

        upsert_condition(
            &mut conditions,
            Condition::new("JobComplete", ConditionStatus::False, "B", "b"),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "B");
        assert_eq!(conditions[0].message, "b");
        assert_eq!(conditions[0].last_transition_time, original_time);
    }

    #[test]
    fn upsert_replaces_on_status_change() {
        let mut first = Condition::new("JobComplete", ConditionStatus::False, "A", "a");
        first.last_transition_time = Utc::now() - Duration::hours(2);
        let mut conditions = vec![first];

        upsert_condition(
            &mut conditions,
            Condition::new("JobComplete", ConditionStatus::True, "Done", "done"),
        );

        assert!(is_condition_true(&conditions, "JobComplete"));
        assert!(conditions[0].last_transition_time > Utc::now() - Duration::minutes(1));
    }

    #[test]
    fn status_parses_from_kubernetes_strings() {
        assert_eq!(ConditionStatus::from("True"), ConditionStatus::True);
        assert_eq!(ConditionStatus::from("False"), ConditionStatus::False);
        assert_eq!(ConditionStatus::from("whatever"), ConditionStatus::Unknown);
    }

    #[test]
    fn condition_serializes_with_kubernetes_field_names() {
        let c = Condition::new("JobCreated", ConditionStatus::True, "JobCreated", "ok");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "JobCreated");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }
}
