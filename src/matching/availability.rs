use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowParseError {
    #[error("expected \"YYYY-MM-DD HH:MM-HH:MM\", got {0:?}")]
    Shape(String),
    #[error("invalid date {0:?}")]
    Date(String),
    #[error("invalid time {0:?}")]
    Time(String),
    #[error("window ends before it starts: {0:?}")]
    Inverted(String),
}

/// One declared availability slot: a calendar date and an inclusive time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityWindow {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl AvailabilityWindow {
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        at.date() == self.date && self.start <= at.time() && at.time() <= self.end
    }
}

impl FromStr for AvailabilityWindow {
    type Err = WindowParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let (date_part, range_part) = trimmed
            .split_once(char::is_whitespace)
            .ok_or_else(|| WindowParseError::Shape(raw.to_string()))?;
        let (start_part, end_part) = range_part
            .trim()
            .split_once('-')
            .ok_or_else(|| WindowParseError::Shape(raw.to_string()))?;

        let date = parse_date(date_part)?;
        let start = parse_time(start_part)?;
        let end = parse_time(end_part)?;
        if end < start {
            return Err(WindowParseError::Inverted(raw.to_string()));
        }

        Ok(Self { date, start, end })
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, WindowParseError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| WindowParseError::Date(raw.to_string()))
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_time(raw: &str) -> Result<NaiveTime, WindowParseError> {
    let trimmed = raw.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|_| WindowParseError::Time(raw.to_string()))
}

/// The requested appointment instant, built from separate date and time fields.
pub fn parse_slot(date: &str, time: &str) -> Result<NaiveDateTime, WindowParseError> {
    Ok(parse_date(date)?.and_time(parse_time(time)?))
}

/// True when `at` falls inside any window. Unparsable windows never match.
pub fn is_available(windows: &[String], at: NaiveDateTime) -> bool {
    windows.iter().any(|raw| match raw.parse::<AvailabilityWindow>() {
        Ok(window) => window.contains(at),
        Err(err) => {
            tracing::debug!(window = %raw, error = %err, "skipping unparsable availability window");
            false
        }
    })
}
