//! JSON payload walkers.
//!
//! Every JSON endpoint wraps its rows in one named top-level array; a
//! response without that array is malformed and fails the extraction.
//! Within a row, missing or malformed leaves degrade to zero or the
//! empty string so one bad record never sinks the batch.

use serde_json::Value;

use crate::domain::records::{
    Confirmation, CreditRecord, DomainRecord, HistoryRecord, ReservationRecord, SeatTimeslot,
};
use crate::domain::types::Term;
use crate::portal::extract::{ExtractError, num_or_zero, text_or_empty, uint_or_zero};

/// `data`: bookable seat slots.
pub fn seat_timeslots(body: &str) -> Result<Vec<DomainRecord>, ExtractError> {
    let rows = named_array(body, "data")?;
    Ok(rows
        .iter()
        .map(|row| {
            DomainRecord::Seat(SeatTimeslot {
                area: text_or_empty(row.get("area")),
                floor: uint_or_zero(row.get("floor")),
                seat_no: uint_or_zero(row.get("seat")),
                date: text_or_empty(row.get("date")),
                start: text_or_empty(row.get("start")),
                end: text_or_empty(row.get("end")),
            })
        })
        .collect())
}

/// `records`: reservations the subject currently holds.
pub fn reservation_records(body: &str) -> Result<Vec<DomainRecord>, ExtractError> {
    let rows = named_array(body, "records")?;
    Ok(rows
        .iter()
        .map(|row| {
            DomainRecord::Reservation(ReservationRecord {
                target: text_or_empty(row.get("target")),
                date: text_or_empty(row.get("date")),
                start: text_or_empty(row.get("start")),
                end: text_or_empty(row.get("end")),
                status: text_or_empty(row.get("status")),
            })
        })
        .collect())
}

/// `items`: per-course credit results. Year and term come from the
/// request context, matching the timetable extractor.
pub fn credit_records(
    body: &str,
    year: u16,
    term: Term,
) -> Result<Vec<DomainRecord>, ExtractError> {
    let rows = named_array(body, "items")?;
    Ok(rows
        .iter()
        .map(|row| {
            DomainRecord::Credit(CreditRecord {
                course: text_or_empty(row.get("course")),
                year,
                term,
                credit: num_or_zero(row.get("credit")),
                grade: text_or_empty(row.get("grade")),
            })
        })
        .collect())
}

/// `entries`: the subject's activity log.
pub fn history_records(body: &str) -> Result<Vec<DomainRecord>, ExtractError> {
    let rows = named_array(body, "entries")?;
    Ok(rows
        .iter()
        .map(|row| {
            DomainRecord::History(HistoryRecord {
                action: text_or_empty(row.get("action")),
                target: text_or_empty(row.get("target")),
                occurred_at: text_or_empty(row.get("time")),
            })
        })
        .collect())
}

/// Reservation verdict. A missing `success` leaf reads as rejected, so a
/// half-broken response never books silently.
pub fn confirmation(body: &str) -> Result<Confirmation, ExtractError> {
    let value: Value = serde_json::from_str(body)?;
    Ok(Confirmation {
        accepted: value.get("success").and_then(Value::as_bool).unwrap_or(false),
        reference: text_or_empty(value.get("reference")),
        message: text_or_empty(value.get("message")),
    })
}

fn named_array(body: &str, name: &'static str) -> Result<Vec<Value>, ExtractError> {
    let value: Value = serde_json::from_str(body)?;
    value
        .get(name)
        .and_then(Value::as_array)
        .cloned()
        .ok_or(ExtractError::MissingArray { name })
}
