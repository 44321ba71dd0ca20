//! Date values as day offsets from the Unix epoch, and date generalization.

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc,
};
use clinshield_core::{AnonError, DateGrouping, Result};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePrecision {
    /// `YYYY-MM-DD`
    Date,
    /// Full timestamp with an offset.
    DateTime,
}

/// A parsed date or date-time together with the offset it was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateValue {
    instant: DateTime<FixedOffset>,
    precision: DatePrecision,
}

impl DateValue {
    /// Accepts RFC 3339 timestamps, offset-less timestamps (read as UTC) and
    /// plain dates (read as UTC midnight).
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.contains('T') {
            if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
                return Ok(Self::date_time(instant));
            }
            return NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| Self::date_time(naive.and_utc().fixed_offset()))
                .map_err(|e| AnonError::Parse(format!("invalid date-time '{}': {}", text, e)));
        }
        let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map_err(|e| AnonError::Parse(format!("invalid date '{}': {}", text, e)))?;
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| AnonError::Parse(format!("invalid date '{}'", text)))?;
        Ok(Self {
            instant: midnight.and_utc().fixed_offset(),
            precision: DatePrecision::Date,
        })
    }

    pub fn date_time(instant: DateTime<FixedOffset>) -> Self {
        Self {
            instant,
            precision: DatePrecision::DateTime,
        }
    }

    pub fn instant(&self) -> DateTime<FixedOffset> {
        self.instant
    }

    pub fn offset(&self) -> FixedOffset {
        *self.instant.offset()
    }

    pub fn precision(&self) -> DatePrecision {
        self.precision
    }

    /// Fractional days since 1970-01-01T00:00:00Z.
    pub fn to_day_offset(&self) -> f64 {
        self.instant.timestamp_millis() as f64 / MILLIS_PER_DAY
    }

    /// Inverse of [`to_day_offset`](Self::to_day_offset), keeping the offset
    /// and precision of `template`.
    pub fn from_day_offset(days: f64, template: &DateValue) -> Result<Self> {
        let millis = (days * MILLIS_PER_DAY).round();
        if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
            return Err(AnonError::Domain(format!("day offset {} out of range", days)));
        }
        let instant = Utc
            .timestamp_millis_opt(millis as i64)
            .single()
            .ok_or_else(|| AnonError::Domain(format!("day offset {} out of range", days)))?
            .with_timezone(&template.offset());
        Ok(Self {
            instant,
            precision: template.precision,
        })
    }

    /// Signed difference `self - other` in days.
    pub fn days_since(&self, other: &DateValue) -> f64 {
        (self.instant - other.instant).num_milliseconds() as f64 / MILLIS_PER_DAY
    }

    /// Serializes in the precision the value was read with.
    pub fn format(&self) -> String {
        match self.precision {
            DatePrecision::Date => self.instant.format("%Y-%m-%d").to_string(),
            DatePrecision::DateTime => self.instant.to_rfc3339_opts(SecondsFormat::Secs, false),
        }
    }

    /// Truncates to the first day of the decade or quarter. Date-times are
    /// set to noon in their own offset.
    pub fn generalize(&self, grouping: DateGrouping) -> Self {
        let local = self.instant.date_naive();
        let (year, month) = match grouping {
            DateGrouping::Decade => (local.year() - local.year().rem_euclid(10), 1),
            DateGrouping::Quarter => (local.year(), (local.month0() / 3) * 3 + 1),
        };
        let hour = match self.precision {
            DatePrecision::Date => 0,
            DatePrecision::DateTime => 12,
        };
        NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|date| date.and_hms_opt(hour, 0, 0))
            .and_then(|naive| self.offset().from_local_datetime(&naive).single())
            .map(|instant| Self {
                instant,
                precision: self.precision,
            })
            .unwrap_or(*self)
    }

    pub fn shifted_by_days(&self, days: f64) -> Result<Self> {
        Self::from_day_offset(self.to_day_offset() + days, self)
    }
}

/// Convenience for callers that work on raw text.
pub fn generalize_text(text: &str, grouping: DateGrouping) -> Option<String> {
    DateValue::parse(text)
        .ok()
        .map(|value| value.generalize(grouping).format())
}
