use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event on a per-thread stream. The cursor is assigned by the bus and is
/// strictly increasing per key; `ts` is milliseconds since epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub cursor: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub ts: i64,
}

impl BusEvent {
    pub fn new(cursor: u64, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            cursor,
            event_type: event_type.into(),
            data,
            ts: Utc::now().timestamp_millis(),
        }
    }

    /// Payload as delivered over SSE: the data object with `ts` appended.
    pub fn sse_payload(&self) -> Value {
        match &self.data {
            Value::Object(map) => {
                let mut out = map.clone();
                out.insert("ts".to_string(), Value::from(self.ts));
                Value::Object(out)
            }
            other => serde_json::json!({ "value": other, "ts": self.ts }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sse_payload_appends_ts_to_objects() {
        let ev = BusEvent::new(3, "run.started", json!({"run_id": "r1"}));
        let payload = ev.sse_payload();
        assert_eq!(payload["run_id"], "r1");
        assert_eq!(payload["ts"], json!(ev.ts));
    }

    #[test]
    fn sse_payload_wraps_non_objects() {
        let ev = BusEvent::new(1, "ping", json!(""));
        let payload = ev.sse_payload();
        assert_eq!(payload["value"], "");
    }
}
