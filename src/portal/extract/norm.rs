//! Normalization of the portal's schedule field encodings.

/// Maps a weekday label to its ISO ordinal, 1 = Monday through 7 = Sunday.
/// Prefix matching accepts both the full name and the three-letter form.
pub fn weekday_number(label: &str) -> Option<u8> {
    const PREFIXES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];
    let lower = label.trim().to_ascii_lowercase();
    PREFIXES
        .iter()
        .position(|prefix| lower.starts_with(prefix))
        .map(|index| index as u8 + 1)
}

/// Encodes week coverage text as a bitmask with bit `n-1` set for week `n`.
///
/// The portal writes spans (`1-16`), lists (`2,4,8`), mixtures of both, and
/// an optional `(odd)` / `(even)` suffix restricting a span to alternating
/// weeks. Weeks outside 1..=64 and unparseable fragments are ignored, so a
/// partially garbled cell degrades instead of failing the batch.
pub fn week_bits(text: &str) -> u64 {
    let trimmed = text.trim();
    let (spans, parity) = split_parity(trimmed);

    let mut bits = 0u64;
    for span in spans.split(',') {
        let span = span.trim();
        if span.is_empty() {
            continue;
        }
        let (lo, hi) = match span.split_once('-') {
            Some((lo, hi)) => (parse_week(lo), parse_week(hi)),
            None => {
                let week = parse_week(span);
                (week, week)
            }
        };
        let (Some(lo), Some(hi)) = (lo, hi) else {
            continue;
        };
        for week in lo..=hi {
            let keep = match parity {
                Parity::Any => true,
                Parity::Odd => week % 2 == 1,
                Parity::Even => week % 2 == 0,
            };
            if keep {
                bits |= 1u64 << (week - 1);
            }
        }
    }
    bits
}

/// Rewrites the portal's period cell (`period 3~4`, `3～4`) as a plain
/// `N-M` range. A single period stays as a single number.
pub fn normalize_periods(text: &str) -> String {
    let stripped = text
        .trim()
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .trim();
    stripped.replace(['~', '～'], "-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parity {
    Any,
    Odd,
    Even,
}

fn split_parity(text: &str) -> (&str, Parity) {
    for (suffix, parity) in [("(odd)", Parity::Odd), ("(even)", Parity::Even)] {
        if let Some(spans) = text.strip_suffix(suffix) {
            return (spans.trim_end(), parity);
        }
    }
    (text, Parity::Any)
}

fn parse_week(fragment: &str) -> Option<u32> {
    let week: u32 = fragment.trim().parse().ok()?;
    (1..=64).contains(&week).then_some(week)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekday_prefixes_map_to_iso_ordinals() {
        assert_eq!(weekday_number("Monday"), Some(1));
        assert_eq!(weekday_number("tue"), Some(2));
        assert_eq!(weekday_number(" Sunday "), Some(7));
        assert_eq!(weekday_number("Funday"), None);
        assert_eq!(weekday_number(""), None);
    }

    #[test]
    fn week_spans_and_lists_fill_the_mask() {
        assert_eq!(week_bits("1-4"), 0b1111);
        assert_eq!(week_bits("1,3"), 0b0101);
        assert_eq!(week_bits("1-2,4"), 0b1011);
        assert_eq!(week_bits("2"), 0b10);
    }

    #[test]
    fn parity_suffix_filters_the_span() {
        assert_eq!(week_bits("1-6(odd)"), 0b010101);
        assert_eq!(week_bits("1-6(even)"), 0b101010);
        assert_eq!(week_bits("1-6 (odd)"), 0b010101);
    }

    #[test]
    fn garbled_fragments_are_ignored() {
        assert_eq!(week_bits("x-4"), 0);
        assert_eq!(week_bits("1-4,junk"), 0b1111);
        assert_eq!(week_bits("0-2"), 0);
        assert_eq!(week_bits("63-70"), 0);
        assert_eq!(week_bits(""), 0);
    }

    #[test]
    fn reversed_spans_yield_nothing() {
        assert_eq!(week_bits("9-3"), 0);
    }

    #[test]
    fn periods_lose_the_prefix_and_tilde() {
        assert_eq!(normalize_periods("period 3~4"), "3-4");
        assert_eq!(normalize_periods("3～4"), "3-4");
        assert_eq!(normalize_periods(" 5 "), "5");
        assert_eq!(normalize_periods("periods 1~2"), "1-2");
    }
}
