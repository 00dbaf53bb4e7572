//! Turns raw portal payloads into [`DomainRecord`](crate::domain::records::DomainRecord)s.
//!
//! Two payload shapes exist: the timetable is server-rendered HTML and is
//! scraped positionally, everything else is JSON with a named top-level
//! array. Extraction is deliberately tolerant at the record level: a
//! malformed number defaults to zero and an unconfirmed row is skipped,
//! but a payload whose overall shape is wrong fails loudly.

mod courses;
mod json;
pub mod norm;

pub use courses::course_entries;
pub use json::{confirmation, credit_records, history_records, reservation_records, seat_timeslots};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("payload has no `{name}` array")]
    MissingArray { name: &'static str },
    #[error("page markup does not match `{selector}`")]
    MarkupMismatch { selector: &'static str },
}

/// Numeric leaf tolerant of the portal's habit of quoting numbers.
/// Anything unparseable counts as zero.
pub(crate) fn num_or_zero(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub(crate) fn uint_or_zero(value: Option<&Value>) -> u32 {
    match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

pub(crate) fn text_or_empty(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn quoted_and_bare_numbers_both_parse() {
        let value = json!({"a": 4.5, "b": "4.5", "c": " 7 ", "d": "x", "e": null});
        assert_eq!(num_or_zero(value.get("a")), 4.5);
        assert_eq!(num_or_zero(value.get("b")), 4.5);
        assert_eq!(uint_or_zero(value.get("c")), 7);
        assert_eq!(num_or_zero(value.get("d")), 0.0);
        assert_eq!(num_or_zero(value.get("e")), 0.0);
        assert_eq!(num_or_zero(value.get("missing")), 0.0);
    }

    #[test]
    fn text_leaves_are_trimmed() {
        let value = json!({"s": "  hall A ", "n": 12});
        assert_eq!(text_or_empty(value.get("s")), "hall A");
        assert_eq!(text_or_empty(value.get("n")), "12");
        assert_eq!(text_or_empty(value.get("missing")), "");
    }
}
