//! Date formatting for `Date` columns
//!
//! Dates are stored as text in one canonical pattern. Input text is accepted
//! in that pattern, as a bare date, or as RFC 3339.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use crate::{Error, Result};

/// Pattern used when none is configured (`2009-06-01T12:30:00Z`)
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Converts between `DateTime<Utc>` and the canonical stored text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFormatter {
    pattern: String,
}

impl DateFormatter {
    /// Create a formatter for a strftime pattern.
    ///
    /// The pattern is validated up front so that formatting can never fail later.
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        if pattern.is_empty() || StrftimeItems::new(&pattern).any(|item| matches!(item, Item::Error)) {
            return Err(Error::binding(format!("Invalid date format: {:?}", pattern)));
        }
        Ok(Self { pattern })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Format a date into its stored form
    pub fn format(&self, date: &DateTime<Utc>) -> String {
        date.format(&self.pattern).to_string()
    }

    /// Parse stored or imported text into a date
    pub fn parse(&self, text: &str) -> Result<DateTime<Utc>> {
        let text = text.trim();
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, &self.pattern) {
            return Ok(naive.and_utc());
        }
        if let Ok(day) = NaiveDate::parse_from_str(text, &self.pattern) {
            if let Some(naive) = day.and_hms_opt(0, 0, 0) {
                return Ok(naive.and_utc());
            }
        }
        DateTime::parse_from_rfc3339(text)
            .map(|date| date.with_timezone(&Utc))
            .map_err(|e| Error::binding(format!("Invalid date {:?}: {}", text, e)))
    }

    /// Re-format imported text into the canonical stored form
    pub fn normalize(&self, text: &str) -> Result<String> {
        self.parse(text).map(|date| self.format(&date))
    }
}

impl Default for DateFormatter {
    fn default() -> Self {
        Self { pattern: DEFAULT_DATE_FORMAT.to_string() }
    }
}
