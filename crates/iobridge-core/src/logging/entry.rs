//! One line of a JSONL log file.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 with milliseconds, UTC
    pub ts: String,
    pub level: String,
    pub pid: u32,
    /// Module path the event came from
    pub target: String,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Enclosing spans, outermost first, joined by " > "
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogEntry {
    pub fn new(
        level: impl Into<String>,
        pid: u32,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            pid,
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_omits_empty_optionals() {
        let entry = LogEntry::new("info", 7, "iobridge_core::host", "Data plane listening");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["pid"], 7);
        assert_eq!(value["msg"], "Data plane listening");
        assert!(value.get("fields").is_none());
        assert!(value.get("span").is_none());
    }

    #[test]
    fn test_entry_with_fields() {
        let entry = LogEntry::new("debug", 7, "iobridge_core::relay", "TCP read failed")
            .with_fields(serde_json::json!({"socket_id": 3}))
            .with_span("relay");
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"socket_id\":3"));
        assert!(line.contains("\"span\":\"relay\""));
    }
}
