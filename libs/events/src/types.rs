//! Typed event definitions.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EventError;

/// The action carried out on a database table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl Action {
    /// Returns the canonical (SQL) spelling of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Insert => "INSERT",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Action::Insert),
            "UPDATE" => Ok(Action::Update),
            "DELETE" => Ok(Action::Delete),
            other => Err(EventError::UnknownAction(other.to_string())),
        }
    }
}

/// Event type as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

impl From<Action> for EventType {
    fn from(action: Action) -> Self {
        match action {
            Action::Insert => EventType::Created,
            Action::Update => EventType::Updated,
            Action::Delete => EventType::Deleted,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Created => write!(f, "created"),
            EventType::Updated => write!(f, "updated"),
            EventType::Deleted => write!(f, "deleted"),
        }
    }
}

/// A typed event delivered to in-process subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    pub event_type: EventType,
    pub payload: T,
}

impl<T> Event<T> {
    pub fn new(event_type: EventType, payload: T) -> Self {
        Self {
            event_type,
            payload,
        }
    }

    pub fn created(payload: T) -> Self {
        Self::new(EventType::Created, payload)
    }

    pub fn updated(payload: T) -> Self {
        Self::new(EventType::Updated, payload)
    }

    pub fn deleted(payload: T) -> Self {
        Self::new(EventType::Deleted, payload)
    }

    pub fn is_deleted(&self) -> bool {
        self.event_type == EventType::Deleted
    }

    /// Decodes a raw outbox payload into a typed event.
    pub fn from_outbox(action: Action, payload: serde_json::Value) -> Result<Self, EventError>
    where
        T: serde::de::DeserializeOwned,
    {
        let payload = serde_json::from_value(payload)?;
        Ok(Self::new(action.into(), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("INSERT", Action::Insert, EventType::Created)]
    #[case("UPDATE", Action::Update, EventType::Updated)]
    #[case("DELETE", Action::Delete, EventType::Deleted)]
    fn test_action_maps_to_event_type(
        #[case] raw: &str,
        #[case] action: Action,
        #[case] event_type: EventType,
    ) {
        let parsed: Action = raw.parse().unwrap();
        assert_eq!(parsed, action);
        assert_eq!(parsed.to_string(), raw);
        assert_eq!(EventType::from(parsed), event_type);
    }

    #[test]
    fn test_unknown_action() {
        let err = "TRUNCATE".parse::<Action>().unwrap_err();
        assert!(matches!(err, EventError::UnknownAction(ref a) if a == "TRUNCATE"));
    }

    #[test]
    fn test_action_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Action::Delete).unwrap(), "\"DELETE\"");
    }

    #[derive(Debug, PartialEq, Deserialize)]
    struct Thing {
        name: String,
    }

    #[test]
    fn test_from_outbox_decodes_payload() {
        let event: Event<Thing> =
            Event::from_outbox(Action::Delete, serde_json::json!({"name": "dev"})).unwrap();
        assert!(event.is_deleted());
        assert_eq!(event.payload.name, "dev");
    }

    #[test]
    fn test_from_outbox_rejects_bad_payload() {
        let result: Result<Event<Thing>, _> =
            Event::from_outbox(Action::Insert, serde_json::json!({"nom": 1}));
        assert!(matches!(result, Err(EventError::InvalidPayload(_))));
    }
}
