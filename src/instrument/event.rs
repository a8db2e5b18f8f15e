//! The outbound log record.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::AppError;

/// Severity of a [`LogEvent`]; one sink method per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Critical,
    Error,
    Warning,
    Info,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetails {
    pub message: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl From<&AppError> for ErrorDetails {
    fn from(err: &AppError) -> Self {
        Self {
            message: err.message().to_owned(),
            name: err.name().to_owned(),
            code: err.code().map(str::to_owned),
            stack: err.stack().map(str::to_owned),
        }
    }
}

/// Request-scoped part of an event: the redacted context plus outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    #[serde(flatten)]
    pub context: Map<String, Value>,
    pub body: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    pub response_time_ms: u64,
    pub status_code: u16,
    pub is_slow: bool,
}

/// One structured record handed to the sink.
///
/// Request events carry a [`RequestRecord`]; process-level events (panics,
/// failed background tasks) carry only the title, message and error.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub title: String,
    pub message: String,
    pub level: Level,
    #[serde(flatten)]
    pub request: Option<RequestRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

impl LogEvent {
    /// The event as a JSON map, the shape transports serialise.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// A context field such as `user` or `requestId`.
    pub fn context(&self, key: &str) -> Option<&Value> {
        self.request.as_ref().and_then(|r| r.context.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_event_serialises_flat_and_camel_case() {
        let mut context = Map::new();
        context.insert("method".into(), json!("GET"));
        context.insert("requestId".into(), json!("req-1"));

        let event = LogEvent {
            title: "GET /orders".into(),
            message: "Request completed successfully".into(),
            level: Level::Info,
            request: Some(RequestRecord {
                context,
                body: Value::Null,
                response: None,
                response_time_ms: 12,
                status_code: 200,
                is_slow: false,
            }),
            error: None,
        };

        assert_eq!(
            event.to_value(),
            json!({
                "title": "GET /orders",
                "message": "Request completed successfully",
                "level": "info",
                "method": "GET",
                "requestId": "req-1",
                "body": null,
                "responseTimeMs": 12,
                "statusCode": 200,
                "isSlow": false,
            })
        );
    }

    #[test]
    fn process_event_has_no_request_section() {
        let event = LogEvent {
            title: "Uncaught Exception".into(),
            message: "boom".into(),
            level: Level::Critical,
            request: None,
            error: Some(ErrorDetails {
                message: "boom".into(),
                name: "panic".into(),
                code: None,
                stack: Some("at main".into()),
            }),
        };
        assert_eq!(
            event.to_value(),
            json!({
                "title": "Uncaught Exception",
                "message": "boom",
                "level": "critical",
                "error": {"message": "boom", "name": "panic", "stack": "at main"},
            })
        );
    }
}
