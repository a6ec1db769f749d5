//! Realtime event envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::{now, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "record.upserted")]
    RecordUpserted,
    #[serde(rename = "record.deleted")]
    RecordDeleted,
    /// Sent to a subscriber that fell behind; it should pull the change feed.
    #[serde(rename = "resync")]
    Resync,
}

/// Tenant-scoped event delivered to connected clients.
///
/// The tenant is routing information only and is never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(skip)]
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    fn for_record(event_type: EventType, record: &Record) -> Self {
        Self {
            tenant_id: record.tenant_id.clone(),
            event_type,
            kind: Some(record.kind.clone()),
            payload: serde_json::to_value(record).unwrap_or_default(),
            timestamp: now(),
        }
    }

    pub fn upserted(record: &Record) -> Self {
        Self::for_record(EventType::RecordUpserted, record)
    }

    pub fn deleted(record: &Record) -> Self {
        Self::for_record(EventType::RecordDeleted, record)
    }

    pub fn resync(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            event_type: EventType::Resync,
            kind: None,
            payload: Value::Null,
            timestamp: now(),
        }
    }

    /// Decodes the record carried by an upsert/delete event.
    pub fn record(&self) -> Option<Record> {
        match self.event_type {
            EventType::Resync => None,
            _ => serde_json::from_value(self.payload.clone()).ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Record {
        Record {
            id: "b1".to_string(),
            tenant_id: "acme".to_string(),
            kind: "budget".to_string(),
            version: 2,
            updated_at: now(),
            deleted_at: None,
            payload: json!({"amount": 100}),
        }
    }

    #[test]
    fn test_envelope_shape() {
        let event = ChangeEvent::upserted(&record());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "record.upserted");
        assert_eq!(json["kind"], "budget");
        assert_eq!(json["payload"]["id"], "b1");
        assert!(json.get("tenant_id").is_none());
        assert!(json.get("tenantId").is_none());
    }

    #[test]
    fn test_record_decodes_back() {
        let original = record();
        let event = ChangeEvent::deleted(&original);
        let text = serde_json::to_string(&event).unwrap();

        let parsed: ChangeEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.event_type, EventType::RecordDeleted);
        assert_eq!(parsed.record().unwrap(), original);
    }

    #[test]
    fn test_resync_has_no_record() {
        let event = ChangeEvent::resync("acme");
        assert_eq!(event.tenant_id, "acme");
        assert!(event.record().is_none());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "resync");
        assert!(json.get("kind").is_none());
    }
}
