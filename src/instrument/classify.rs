//! Severity classification.
//!
//! First match wins:
//!
//! | condition | level | message |
//! |---|---|---|
//! | status ≥ 500 | critical | error message, else `Server error occurred` |
//! | status ≥ 400 | error | `Route not found` for 404, else error message, else `Client error` |
//! | elapsed > threshold | warning | `Slow request detected (<elapsed>ms)` |
//! | otherwise | info | `Request completed successfully` |

use super::event::{ErrorDetails, Level};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub level: Level,
    pub message: String,
}

pub fn classify(
    status: u16,
    elapsed_ms: u64,
    threshold_ms: u64,
    error: Option<&ErrorDetails>,
) -> Classification {
    let error_message = error
        .map(|e| e.message.as_str())
        .filter(|m| !m.is_empty());

    let (level, message) = if status >= 500 {
        (Level::Critical, error_message.unwrap_or("Server error occurred").to_owned())
    } else if status >= 400 {
        let message = if status == 404 {
            "Route not found"
        } else {
            error_message.unwrap_or("Client error")
        };
        (Level::Error, message.to_owned())
    } else if is_slow(elapsed_ms, threshold_ms) {
        (Level::Warning, format!("Slow request detected ({elapsed_ms}ms)"))
    } else {
        (Level::Info, "Request completed successfully".to_owned())
    };

    Classification { level, message }
}

/// Computed on its own for every event, whatever branch fired above.
pub fn is_slow(elapsed_ms: u64, threshold_ms: u64) -> bool {
    elapsed_ms > threshold_ms
}
