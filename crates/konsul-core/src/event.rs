//! Change events fanned out by the change bus (spec §3, §4.4).

use serde::Serialize;

/// Self-describing mutation event — transports only need to serialize it.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Set {
        key: String,
        value: String,
        index: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    Delete {
        key: String,
        old_value: Option<String>,
        index: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl ChangeEvent {
    pub fn key(&self) -> &str {
        match self {
            ChangeEvent::Set { key, .. } => key,
            ChangeEvent::Delete { key, .. } => key,
        }
    }

    pub fn index(&self) -> u64 {
        match self {
            ChangeEvent::Set { index, .. } => *index,
            ChangeEvent::Delete { index, .. } => *index,
        }
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>, index: u64) -> Self {
        ChangeEvent::Set {
            key: key.into(),
            value: value.into(),
            index,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn delete(key: impl Into<String>, old_value: Option<String>, index: u64) -> Self {
        ChangeEvent::Delete {
            key: key.into(),
            old_value,
            index,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_event_accessors() {
        let e = ChangeEvent::set("app/a", "1", 5);
        assert_eq!(e.key(), "app/a");
        assert_eq!(e.index(), 5);
    }

    #[test]
    fn serializes_with_tagged_type() {
        let e = ChangeEvent::delete("app/a", Some("1".into()), 6);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["key"], "app/a");
        assert_eq!(json["index"], 6);
    }
}
