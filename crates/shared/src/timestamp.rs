//! Calendar-aware ordering of message timestamps.
//!
//! Senders do not agree on a single timestamp rendering (field widths and
//! fractional precision vary), so ordering compares parsed calendar fields
//! rather than raw strings.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime};

pub fn parse_created_at(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.naive_utc());
    }
    parse_fields(raw)
}

/// Splits on every non-digit run and reads year, month, day, hour, minute,
/// second and fraction in that order. Missing time fields default to zero.
fn parse_fields(raw: &str) -> Option<NaiveDateTime> {
    let fields: Vec<&str> = raw
        .split(|c: char| !c.is_ascii_digit())
        .filter(|field| !field.is_empty())
        .collect();
    if fields.len() < 3 {
        return None;
    }

    let number = |index: usize| -> Option<u32> {
        fields.get(index).map_or(Some(0), |field| field.parse().ok())
    };
    let year: i32 = fields[0].parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, number(1)?, number(2)?)?;
    let nanos = fields.get(6).map_or(Some(0), |fraction| fraction_nanos(fraction))?;
    date.and_hms_nano_opt(number(3)?, number(4)?, number(5)?, nanos)
}

fn fraction_nanos(fraction: &str) -> Option<u32> {
    let mut digits: String = fraction.chars().take(9).collect();
    while digits.len() < 9 {
        digits.push('0');
    }
    digits.parse().ok()
}

/// Newest first. Unparseable timestamps sort after every parseable one.
pub fn newest_first(a: &str, b: &str) -> Ordering {
    match (parse_created_at(a), parse_created_at(b)) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
