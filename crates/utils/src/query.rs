//! Read-only filtering over the stored listing.
//!
//! A [`MessageFilter`] combines an optional half-open time window
//! `[since, until)` over the message date with exact-match recipient and
//! sender predicates. All present predicates must hold.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use thiserror::Error;

use crate::Message;

/// Errors produced while reading a filter from a query string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// A `since`/`until` value is neither RFC 3339 nor `YYYY-MM-DD`.
    #[error("Invalid time for '{field}': {value}")]
    InvalidTime { field: &'static str, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// Inclusive lower bound on the message date.
    pub since: Option<DateTime<Utc>>,

    /// Exclusive upper bound on the message date.
    pub until: Option<DateTime<Utc>>,

    /// Matches when any `To` address equals this value.
    pub to: Option<String>,

    /// Matches when any `From` address equals this value.
    pub from: Option<String>,
}

impl MessageFilter {
    /// Builds a filter from an URL query string such as
    /// `since=2025-01-01&to=bob%40example.com`.
    ///
    /// Unknown keys and empty values are ignored.
    pub fn from_query(query: &str) -> Result<Self, FilterError> {
        let mut filter = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "since" => filter.since = Some(parse_time("since", &value)?),
                "until" => filter.until = Some(parse_time("until", &value)?),
                "to" => filter.to = Some(value.into_owned()),
                "from" => filter.from = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(filter)
    }

    pub fn matches(&self, message: &Message) -> bool {
        if self.since.is_some_and(|since| message.date < since) {
            return false;
        }
        if self.until.is_some_and(|until| message.date >= until) {
            return false;
        }
        if let Some(to) = &self.to {
            if !message.to.contains(to) {
                return false;
            }
        }
        if let Some(from) = &self.from {
            if !message.from.contains(from) {
                return false;
            }
        }
        true
    }
}

/// Parses an RFC 3339 timestamp, or a plain date taken as UTC midnight.
fn parse_time(field: &'static str, value: &str) -> Result<DateTime<Utc>, FilterError> {
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Ok(datetime.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| FilterError::InvalidTime {
            field,
            value: value.to_string(),
        })
}
