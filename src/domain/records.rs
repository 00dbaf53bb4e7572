//! Record families mirrored from portal payloads.
//!
//! Every record computes a natural key from its own content, so a re-scrape
//! of the same upstream row lands on the same persisted fact no matter when
//! or how often it is extracted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::types::{RecordKind, Term};

/// One confirmed course block on a timetable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseEntry {
    pub name: String,
    pub year: u16,
    pub term: Term,
    /// ISO weekday, 1 = Monday through 7 = Sunday. 0 when the source row
    /// carried no parsable weekday.
    pub weekday: u8,
    /// Normalized period range, e.g. `3-4`.
    pub periods: String,
    pub teacher: String,
    pub location: String,
    /// Bit `n` set means the course meets in week `n`.
    pub week_bits: u64,
    pub credit: f64,
}

/// A bookable seat slot in a library area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatTimeslot {
    pub area: String,
    pub floor: u32,
    pub seat_no: u32,
    pub date: String,
    pub start: String,
    pub end: String,
}

/// A reservation the subject holds upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub target: String,
    pub date: String,
    pub start: String,
    pub end: String,
    pub status: String,
}

/// Earned credit for one course in one term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditRecord {
    pub course: String,
    pub year: u16,
    pub term: Term,
    pub credit: f64,
    pub grade: String,
}

/// An entry from the subject's activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub action: String,
    pub target: String,
    pub occurred_at: String,
}

/// Any extracted portal record. The serialized form carries the family in a
/// `kind` tag and is stored verbatim as the fact body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainRecord {
    Course(CourseEntry),
    Seat(SeatTimeslot),
    Reservation(ReservationRecord),
    Credit(CreditRecord),
    History(HistoryRecord),
}

impl DomainRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Course(_) => RecordKind::Course,
            Self::Seat(_) => RecordKind::Seat,
            Self::Reservation(_) => RecordKind::Reservation,
            Self::Credit(_) => RecordKind::Credit,
            Self::History(_) => RecordKind::History,
        }
    }

    /// Content hash identifying this record across scrapes.
    ///
    /// Identifying fields only: values the portal can revise in place without
    /// the row changing identity (credits, grades, reservation status) stay
    /// out of the key, so a revision maps onto the existing fact instead of
    /// minting a new one.
    pub fn natural_key(&self) -> String {
        match self {
            Self::Course(c) => hash_key(
                RecordKind::Course,
                &[
                    &c.name,
                    &c.year.to_string(),
                    &c.term.ordinal().to_string(),
                    &c.weekday.to_string(),
                    &c.periods,
                    &c.teacher,
                    &c.location,
                    &format!("{:016x}", c.week_bits),
                ],
            ),
            Self::Seat(s) => hash_key(
                RecordKind::Seat,
                &[&s.area, &s.floor.to_string(), &s.seat_no.to_string(), &s.date, &s.start, &s.end],
            ),
            Self::Reservation(r) => hash_key(
                RecordKind::Reservation,
                &[&r.target, &r.date, &r.start, &r.end],
            ),
            Self::Credit(c) => hash_key(
                RecordKind::Credit,
                &[&c.course, &c.year.to_string(), &c.term.ordinal().to_string()],
            ),
            Self::History(h) => hash_key(
                RecordKind::History,
                &[&h.action, &h.target, &h.occurred_at],
            ),
        }
    }
}

/// SHA-256 of the kind tag and the whitespace-trimmed identifying fields,
/// joined with `|`, rendered as lowercase hex.
fn hash_key(kind: RecordKind, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    for part in parts {
        hasher.update([b'|']);
        hasher.update(part.trim().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Outcome the portal reports for a reservation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub accepted: bool,
    pub reference: String,
    pub message: String,
}

/// Desired slot for a reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationWindow {
    pub date: String,
    pub start: String,
    pub end: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course() -> CourseEntry {
        CourseEntry {
            name: "Algorithms".to_string(),
            year: 2025,
            term: Term::First,
            weekday: 1,
            periods: "3-4".to_string(),
            teacher: "Dr. Rossi".to_string(),
            location: "A-301".to_string(),
            week_bits: 0b0101_0101_0101_0100,
            credit: 4.0,
        }
    }

    #[test]
    fn same_content_hashes_to_same_key() {
        let a = DomainRecord::Course(course());
        let b = DomainRecord::Course(course());
        assert_eq!(a.natural_key(), b.natural_key());
    }

    #[test]
    fn identifying_field_change_forks_the_key() {
        let a = DomainRecord::Course(course());
        let mut other = course();
        other.location = "B-112".to_string();
        let b = DomainRecord::Course(other);
        assert_ne!(a.natural_key(), b.natural_key());
    }

    #[test]
    fn credit_revision_keeps_the_key() {
        let a = DomainRecord::Course(course());
        let mut revised = course();
        revised.credit = 6.0;
        let b = DomainRecord::Course(revised);
        assert_eq!(a.natural_key(), b.natural_key());
    }

    #[test]
    fn surrounding_whitespace_does_not_fork_the_key() {
        let a = DomainRecord::Course(course());
        let mut padded = course();
        padded.name = "  Algorithms ".to_string();
        let b = DomainRecord::Course(padded);
        assert_eq!(a.natural_key(), b.natural_key());
    }

    #[test]
    fn kind_participates_in_the_key() {
        let history = DomainRecord::History(HistoryRecord {
            action: "x".to_string(),
            target: "y".to_string(),
            occurred_at: "z".to_string(),
        });
        let reservation = DomainRecord::Reservation(ReservationRecord {
            target: "x".to_string(),
            date: "y".to_string(),
            start: "z".to_string(),
            end: String::new(),
            status: String::new(),
        });
        assert_ne!(history.natural_key(), reservation.natural_key());
    }

    #[test]
    fn serialized_body_carries_the_kind_tag() {
        let record = DomainRecord::Seat(SeatTimeslot {
            area: "East Wing".to_string(),
            floor: 3,
            seat_no: 41,
            date: "2025-03-02".to_string(),
            start: "09:00".to_string(),
            end: "11:00".to_string(),
        });
        let body = serde_json::to_value(&record).unwrap();
        assert_eq!(body["kind"], "seat");
        let back: DomainRecord = serde_json::from_value(body).unwrap();
        assert_eq!(back, record);
    }
}
