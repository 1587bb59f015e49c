//! Date normalization and incremental lower bounds

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Day-first layouts tried after ISO-8601 parsing fails
///
/// chrono's `%Y` also accepts two-digit years, so the layout family is chosen
/// from the width of the year before parsing.
const DAY_FIRST_DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%d %b %Y", "%d %B %Y"];

const DAY_FIRST_SHORT_YEAR_DATE_FORMATS: &[&str] =
    &["%d/%m/%y", "%d-%m-%y", "%d.%m.%y", "%d %b %y", "%d %B %y"];

const DAY_FIRST_DATETIME_FORMATS: &[&str] = &[
    "%d/%m/%Y %H:%M:%S%.f",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S%.f",
    "%d.%m.%Y %H:%M:%S%.f",
];

const DAY_FIRST_SHORT_YEAR_DATETIME_FORMATS: &[&str] = &[
    "%d/%m/%y %H:%M:%S%.f",
    "%d/%m/%y %H:%M",
    "%d-%m-%y %H:%M:%S%.f",
    "%d.%m.%y %H:%M:%S%.f",
];

const ISO_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Layout of the lower bound sent to sources, e.g. `2024-03-05T00:00:00`
pub const LOWER_BOUND_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

fn default_token_offset() -> usize {
    6
}

fn default_token_digits() -> usize {
    13
}

/// How a source encodes the values of its date fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum DateFormat {
    /// ISO-8601, falling back to day-first layouts
    #[default]
    Iso,
    /// Millisecond epoch embedded in a token such as `/Date(1709596800000+0000)/`
    EpochToken {
        #[serde(default = "default_token_offset")]
        offset: usize,
        #[serde(default = "default_token_digits")]
        digits: usize,
    },
}

impl DateFormat {
    /// Normalize a raw value to a calendar date; `None` when it cannot be read
    pub fn normalize(&self, raw: &str) -> Option<NaiveDate> {
        match *self {
            DateFormat::Iso => parse_iso(raw).or_else(|| parse_day_first(raw)),
            DateFormat::EpochToken { offset, digits } => decode_epoch_token(raw, offset, digits),
        }
    }
}

/// Parse an ISO-8601 date or date-time, keeping only the date
pub fn parse_iso(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    // Every ISO layout opens with a four-digit year; `05-03-24` is day-first
    if !raw.get(..4).is_some_and(|year| year.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y%m%d") {
            return Some(date);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }

    ISO_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.date())
}

/// Parse common day-first layouts (`05/03/2024` and `05/03/24` are 5 March 2024)
pub fn parse_day_first(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let (dates, datetimes) = if has_short_year(raw) {
        (DAY_FIRST_SHORT_YEAR_DATE_FORMATS, DAY_FIRST_SHORT_YEAR_DATETIME_FORMATS)
    } else {
        (DAY_FIRST_DATE_FORMATS, DAY_FIRST_DATETIME_FORMATS)
    };

    dates
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            datetimes
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
}

/// Whether the year of a day-first value is written with two digits
fn has_short_year(raw: &str) -> bool {
    let mut words = raw.split_whitespace();
    let Some(first) = words.next() else {
        return false;
    };
    let year = if first.contains(['/', '-', '.']) {
        first.rsplit(['/', '-', '.']).next()
    } else {
        // `5 Mar 24`
        words.nth(1)
    };
    year.is_some_and(|y| y.len() == 2 && y.bytes().all(|b| b.is_ascii_digit()))
}

/// Decode `digits` characters at `offset` as epoch milliseconds (UTC)
pub fn decode_epoch_token(raw: &str, offset: usize, digits: usize) -> Option<NaiveDate> {
    let millis: i64 = raw.get(offset..offset.checked_add(digits)?)?.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single().map(|dt| dt.date_naive())
}

/// Lower date bound for an incremental run
///
/// Midnight UTC `days` days before `now`, or midnight on the first day of the
/// previous month when `first_of_month` is set.
pub fn lower_bound(now: DateTime<Utc>, days: u32, first_of_month: bool) -> NaiveDateTime {
    let today = now.date_naive();
    let date = if first_of_month {
        today
            .with_day(1)
            .and_then(|first| first.checked_sub_months(Months::new(1)))
            .unwrap_or(today)
    } else {
        today - Duration::days(i64::from(days))
    };

    date.and_time(chrono::NaiveTime::MIN)
}
