//! Search date-bound parsing and timezone resolution
//!
//! Search filters accept three date shapes: Unix epoch seconds, RFC 3339
//! with an explicit offset, and bare `YYYY-MM-DD` dates. Bare dates carry
//! no offset of their own and are resolved against one precedence order:
//! explicit process timezone (`MAIL_GW_TZ`) > app-level default
//! (`MAIL_GW_DEFAULT_TZ`) > host-local offset > UTC.
//!
//! Timezones are fixed offsets (`+02:00`, `-0800`, `UTC`); day-granular
//! search bounds do not need an IANA zone database.

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Offset, TimeZone, Utc};

use crate::config::GatewayConfig;
use crate::errors::{AppError, AppResult};

/// Resolved timezone precedence for bare-date interpretation
#[derive(Debug, Clone, Copy)]
pub struct TimezonePolicy {
    process: Option<FixedOffset>,
    app_default: Option<FixedOffset>,
}

impl TimezonePolicy {
    /// Build the policy from gateway configuration
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a configured timezone string is not a
    /// recognized offset form.
    pub fn from_config(config: &GatewayConfig) -> AppResult<Self> {
        let parse = |key: &str, value: &Option<String>| -> AppResult<Option<FixedOffset>> {
            match value {
                Some(raw) => parse_offset(raw)
                    .map(Some)
                    .ok_or_else(|| {
                        AppError::invalid(format!(
                            "{key} must be an offset like '+02:00', '-0800', or 'UTC', got '{raw}'"
                        ))
                    }),
                None => Ok(None),
            }
        };
        Ok(Self {
            process: parse("MAIL_GW_TZ", &config.process_timezone)?,
            app_default: parse("MAIL_GW_DEFAULT_TZ", &config.default_timezone)?,
        })
    }

    /// Fixed policy for tests and provisioning helpers
    pub fn fixed(offset: FixedOffset) -> Self {
        Self {
            process: Some(offset),
            app_default: None,
        }
    }

    /// The offset bare dates are interpreted in
    ///
    /// Precedence: process override, then app default, then the host's
    /// current local offset, then UTC.
    pub fn effective_offset(&self) -> FixedOffset {
        self.process
            .or(self.app_default)
            .unwrap_or_else(|| Local::now().offset().fix())
    }
}

/// Parse one search date bound into a UTC instant
///
/// Accepted shapes, tried in order:
/// 1. all-digit string → Unix epoch seconds
/// 2. RFC 3339 with explicit offset (`2025-01-02T03:04:05+02:00`)
/// 3. bare date (`2025-01-02`) → midnight in the policy's effective offset
///
/// # Errors
///
/// Returns `Validation` when the value matches none of the shapes or the
/// epoch value is out of range.
pub fn parse_date_bound(raw: &str, tz: &TimezonePolicy) -> AppResult<DateTime<Utc>> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(AppError::invalid("date bound must not be empty"));
    }

    if value.chars().all(|c| c.is_ascii_digit()) {
        let secs = value
            .parse::<i64>()
            .map_err(|_| AppError::invalid(format!("epoch seconds out of range: '{value}'")))?;
        return Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| AppError::invalid(format!("epoch seconds out of range: '{value}'")));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let offset = tz.effective_offset();
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| AppError::Internal("invalid midnight construction".to_owned()))?;
        return offset
            .from_local_datetime(&midnight)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| AppError::invalid(format!("ambiguous local date '{value}'")));
    }

    Err(AppError::invalid(format!(
        "unrecognized date '{value}'; use epoch seconds, RFC 3339 with offset, or YYYY-MM-DD"
    )))
}

/// Parse a fixed-offset timezone string
///
/// Accepts `UTC`, `Z`, and `±HH:MM` / `±HHMM` / `±HH` forms.
pub fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let value = raw.trim();
    if value.eq_ignore_ascii_case("utc") || value == "Z" {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match value.split_at_checked(1)? {
        ("+", rest) => (1i32, rest),
        ("-", rest) => (-1i32, rest),
        _ => return None,
    };
    if !rest.chars().all(|c| c.is_ascii_digit() || c == ':') {
        return None;
    }

    let (hours, minutes): (i32, i32) = match rest.len() {
        2 => (rest.parse().ok()?, 0),
        4 => (rest[..2].parse().ok()?, rest[2..].parse().ok()?),
        5 if rest.as_bytes()[2] == b':' => (rest[..2].parse().ok()?, rest[3..].parse().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, FixedOffset, Utc};

    use super::{TimezonePolicy, parse_date_bound, parse_offset};

    fn policy(offset_secs: i32) -> TimezonePolicy {
        TimezonePolicy::fixed(FixedOffset::east_opt(offset_secs).expect("offset"))
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("rfc3339")
            .with_timezone(&Utc)
    }

    #[test]
    fn parses_epoch_seconds() {
        let dt = parse_date_bound("1735689600", &policy(0)).expect("epoch");
        assert_eq!(dt, utc("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn parses_rfc3339_with_explicit_offset() {
        let dt = parse_date_bound("2025-06-01T08:30:00+02:00", &policy(0)).expect("rfc3339");
        assert_eq!(dt, utc("2025-06-01T06:30:00Z"));
    }

    #[test]
    fn bare_date_uses_policy_offset() {
        // +05:30: local midnight is 18:30 UTC the previous day.
        let dt = parse_date_bound("2025-03-10", &policy(5 * 3600 + 1800)).expect("bare date");
        assert_eq!(dt, utc("2025-03-09T18:30:00Z"));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["yesterday", "2025-13-40", "12:00", ""] {
            assert!(parse_date_bound(bad, &policy(0)).is_err(), "{bad}");
        }
    }

    #[test]
    fn offset_forms() {
        assert_eq!(parse_offset("UTC"), FixedOffset::east_opt(0));
        assert_eq!(parse_offset("+02:00"), FixedOffset::east_opt(7200));
        assert_eq!(parse_offset("-0800"), FixedOffset::east_opt(-8 * 3600));
        assert_eq!(parse_offset("+05"), FixedOffset::east_opt(5 * 3600));
        assert_eq!(parse_offset("nope"), None);
        assert_eq!(parse_offset("+25:00"), None);
    }
}
