//! Timetable scraping.
//!
//! The timetable is the one record family the portal serves as
//! server-rendered HTML. Rows are read positionally:
//!
//! | cell | content              |
//! |------|----------------------|
//! | 0    | course name          |
//! | 1    | weekday label        |
//! | 2    | period range         |
//! | 3    | week coverage text   |
//! | 4    | teacher              |
//! | 5    | location             |
//! | 6    | credit               |
//!
//! A row whose `data-selected` attribute is `"0"` is a course the subject
//! shortlisted but never confirmed; those are dropped without comment.

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::domain::records::{CourseEntry, DomainRecord};
use crate::domain::types::Term;
use crate::portal::extract::{ExtractError, norm};

const TABLE_SELECTOR: &str = "table#course-table";

static TABLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(TABLE_SELECTOR).expect("invalid selector"));
static ROWS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("tr.course-row").expect("invalid selector"));
static CELLS: Lazy<Selector> = Lazy::new(|| Selector::parse("td").expect("invalid selector"));

/// Scrapes confirmed course blocks out of a timetable page. The year and
/// term come from the request context; the page itself does not repeat
/// them per row.
pub fn course_entries(
    body: &str,
    year: u16,
    term: Term,
) -> Result<Vec<DomainRecord>, ExtractError> {
    let document = Html::parse_document(body);
    let table = document
        .select(&TABLE)
        .next()
        .ok_or(ExtractError::MarkupMismatch {
            selector: TABLE_SELECTOR,
        })?;

    let mut records = Vec::new();
    for row in table.select(&ROWS) {
        if row.value().attr("data-selected") == Some("0") {
            continue;
        }
        let cells: Vec<String> = row.select(&CELLS).map(cell_text).collect();
        if cells.len() < 7 {
            debug!(cells = cells.len(), "skipping underpopulated timetable row");
            continue;
        }
        records.push(DomainRecord::Course(CourseEntry {
            name: cells[0].clone(),
            year,
            term,
            weekday: norm::weekday_number(&cells[1]).unwrap_or(0),
            periods: norm::normalize_periods(&cells[2]),
            teacher: cells[4].clone(),
            location: cells[5].clone(),
            week_bits: norm::week_bits(&cells[3]),
            credit: cells[6].parse().unwrap_or(0.0),
        }));
    }
    Ok(records)
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <table id="course-table">
          <tr><th>Name</th><th>Day</th><th>Periods</th><th>Weeks</th><th>Teacher</th><th>Room</th><th>Credit</th></tr>
          <tr class="course-row" data-selected="1">
            <td>Algorithms</td><td>Monday</td><td>period 3~4</td><td>1-16</td>
            <td>Dr. Rossi</td><td>A-301</td><td>4</td>
          </tr>
          <tr class="course-row" data-selected="0">
            <td>Shortlisted Elective</td><td>Tuesday</td><td>period 1~2</td><td>1-8</td>
            <td>Dr. Bianchi</td><td>B-112</td><td>2</td>
          </tr>
          <tr class="course-row">
            <td>Compilers</td><td>Friday</td><td>period 5~6</td><td>2-16(even)</td>
            <td>Dr. Verdi</td><td>C-007</td><td>3.5</td>
          </tr>
        </table>
        </body></html>
    "#;

    #[test]
    fn unconfirmed_rows_are_dropped_silently() {
        let records = course_entries(PAGE, 2025, Term::First).unwrap();
        assert_eq!(records.len(), 2);

        let DomainRecord::Course(first) = &records[0] else {
            panic!("expected a course record");
        };
        assert_eq!(first.name, "Algorithms");
        assert_eq!(first.weekday, 1);
        assert_eq!(first.periods, "3-4");
        assert_eq!(first.week_bits, 0xFFFF);
        assert_eq!(first.credit, 4.0);
        assert_eq!(first.year, 2025);
        assert_eq!(first.term, Term::First);

        let DomainRecord::Course(second) = &records[1] else {
            panic!("expected a course record");
        };
        assert_eq!(second.name, "Compilers");
        assert_eq!(second.weekday, 5);
        assert_eq!(second.periods, "5-6");
        assert_eq!(second.week_bits, 0b1010_1010_1010_1010);
        assert_eq!(second.credit, 3.5);
    }

    #[test]
    fn rescrape_yields_identical_keys() {
        let first: Vec<String> = course_entries(PAGE, 2025, Term::First)
            .unwrap()
            .iter()
            .map(DomainRecord::natural_key)
            .collect();
        let second: Vec<String> = course_entries(PAGE, 2025, Term::First)
            .unwrap()
            .iter()
            .map(DomainRecord::natural_key)
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_table_is_a_markup_mismatch() {
        let error = course_entries("<p>maintenance</p>", 2025, Term::First).unwrap_err();
        assert!(matches!(
            error,
            ExtractError::MarkupMismatch { selector } if selector == "table#course-table"
        ));
    }

    #[test]
    fn header_and_ragged_rows_are_skipped() {
        let page = r#"
            <table id="course-table">
              <tr class="course-row"><td>Only Name</td></tr>
            </table>
        "#;
        let records = course_entries(page, 2025, Term::Second).unwrap();
        assert!(records.is_empty());
    }
}
