//! Shared domain enums and the portal code tables.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::domain::error::DomainError;
use crate::domain::identity::SubjectId;

/// Academic term within a year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    First,
    Second,
    Third,
}

/// Portal term codes as they appear in upstream query strings and payloads.
static PORTAL_TERM_CODES: Lazy<HashMap<&'static str, Term>> = Lazy::new(|| {
    HashMap::from([
        ("3", Term::First),
        ("12", Term::Second),
        ("16", Term::Third),
    ])
});

impl Term {
    pub fn ordinal(self) -> u8 {
        match self {
            Self::First => 1,
            Self::Second => 2,
            Self::Third => 3,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Result<Self, DomainError> {
        match ordinal {
            1 => Ok(Self::First),
            2 => Ok(Self::Second),
            3 => Ok(Self::Third),
            other => Err(DomainError::validation(format!(
                "term ordinal must be 1, 2 or 3, got {other}"
            ))),
        }
    }

    /// Looks up a term by the raw code the portal uses.
    pub fn from_portal_code(code: &str) -> Option<Self> {
        PORTAL_TERM_CODES.get(code.trim()).copied()
    }

    /// The raw code the portal expects in query strings.
    pub fn portal_code(self) -> &'static str {
        match self {
            Self::First => "3",
            Self::Second => "12",
            Self::Third => "16",
        }
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ordinal())
    }
}

/// The five record families the portal exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Course,
    Seat,
    Reservation,
    Credit,
    History,
}

impl RecordKind {
    /// Returns the slug used for serialization and DB storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Course => "course",
            Self::Seat => "seat",
            Self::Reservation => "reservation",
            Self::Credit => "credit",
            Self::History => "history",
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "course" | "courses" => Ok(Self::Course),
            "seat" | "seats" => Ok(Self::Seat),
            "reservation" | "reservations" => Ok(Self::Reservation),
            "credit" | "credits" => Ok(Self::Credit),
            "history" => Ok(Self::History),
            _ => Err(()),
        }
    }
}

/// A fully qualified record query: the family plus whatever period it is
/// scoped to. Term-scoped families carry the year and term; the rest are
/// keyed by subject alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Courses { year: u16, term: Term },
    Seats,
    Reservations,
    Credits { year: u16, term: Term },
    History,
}

impl Scope {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Courses { .. } => RecordKind::Course,
            Self::Seats => RecordKind::Seat,
            Self::Reservations => RecordKind::Reservation,
            Self::Credits { .. } => RecordKind::Credit,
            Self::History => RecordKind::History,
        }
    }

    /// Canonical segment used in cache keys and relation rows. Stable across
    /// releases: persisted rows are looked up by this value.
    pub fn segment(&self) -> String {
        match self {
            Self::Courses { year, term } => format!("courses.{year}.{term}"),
            Self::Seats => "seats".to_string(),
            Self::Reservations => "reservations".to_string(),
            Self::Credits { year, term } => format!("credits.{year}.{term}"),
            Self::History => "history".to_string(),
        }
    }

    /// Builds a scope from its record family and an optional year/term pair,
    /// rejecting term-scoped families without one.
    pub fn for_kind(kind: RecordKind, period: Option<(u16, Term)>) -> Result<Self, DomainError> {
        match (kind, period) {
            (RecordKind::Course, Some((year, term))) => Ok(Self::Courses { year, term }),
            (RecordKind::Credit, Some((year, term))) => Ok(Self::Credits { year, term }),
            (RecordKind::Course | RecordKind::Credit, None) => Err(DomainError::validation(
                format!("scope `{kind}` requires a year and a term"),
            )),
            (RecordKind::Seat, _) => Ok(Self::Seats),
            (RecordKind::Reservation, _) => Ok(Self::Reservations),
            (RecordKind::History, _) => Ok(Self::History),
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.segment())
    }
}

/// Portal population a subject belongs to. Resolved once at the service
/// boundary; everything downstream branches on the enum instead of
/// re-inspecting the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    Student,
    Staff,
}

impl AccountKind {
    /// Classifies a subject identifier. Staff accounts are issued from the
    /// `9` number range; every other digit-led identifier is a student.
    pub fn resolve(subject: &SubjectId) -> Result<Self, DomainError> {
        match subject.as_str().chars().next() {
            Some('9') => Ok(Self::Staff),
            Some(c) if c.is_ascii_digit() => Ok(Self::Student),
            Some(_) => Err(DomainError::validation(format!(
                "subject identifier `{subject}` does not start with a digit"
            ))),
            None => Err(DomainError::validation("subject identifier is empty")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Staff => "staff",
        }
    }
}

impl Display for AccountKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
