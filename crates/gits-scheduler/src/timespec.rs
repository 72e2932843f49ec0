//! Fire-time parsing and the one-shot trigger expression derived from it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only accepted input shape, with an optional trailing `Z`.
pub const INPUT_PROFILE: &str = "YYYY-MM-DDTHH:MM";

const PROFILE_LEN: usize = 16;
const PARSE_FORMAT: &str = "%Y-%m-%dT%H:%M";
const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%MZ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("Time must be in UTC format: YYYY-MM-DDTHH:MM (e.g. 2025-07-17T15:00)")]
    InvalidFormat { input: String },

    #[error("Schedule time must be in the future.")]
    NotInFuture { at: String },
}

/// A validated, strictly-future fire time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTime {
    pub at: DateTime<Utc>,
    /// Stored form, e.g. `2025-07-17T15:00Z`.
    pub canonical: String,
    pub expression: TriggerExpression,
}

/// One-shot trigger expression at minute granularity: `cron(M H D Mo ? Y)`.
///
/// Every field is copied from the UTC value, never recomputed, so a single
/// timezone conversion happens at the boundary and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerExpression {
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
    pub month: u32,
    pub year: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid trigger expression: {0}")]
pub struct ExpressionError(pub String);

impl TriggerExpression {
    pub fn from_utc(at: &DateTime<Utc>) -> Self {
        Self {
            minute: at.minute(),
            hour: at.hour(),
            day: at.day(),
            month: at.month(),
            year: at.year(),
        }
    }

    /// The UTC instant this expression fires at, or `None` for impossible dates.
    pub fn fire_at(&self) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(self.year, self.month, self.day, self.hour, self.minute, 0)
            .single()
    }
}

impl fmt::Display for TriggerExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cron({} {} {} {} ? {})",
            self.minute, self.hour, self.day, self.month, self.year
        )
    }
}

impl FromStr for TriggerExpression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .trim()
            .strip_prefix("cron(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| ExpressionError(s.to_string()))?;

        let fields: Vec<&str> = body.split_whitespace().collect();
        let [minute, hour, day, month, weekday, year] = fields[..] else {
            return Err(ExpressionError(s.to_string()));
        };
        if weekday != "?" {
            return Err(ExpressionError(s.to_string()));
        }

        let num = |v: &str| v.parse::<u32>().map_err(|_| ExpressionError(s.to_string()));
        let expr = Self {
            minute: num(minute)?,
            hour: num(hour)?,
            day: num(day)?,
            month: num(month)?,
            year: year
                .parse::<i32>()
                .map_err(|_| ExpressionError(s.to_string()))?,
        };

        // Reject field values that do not name a real minute (e.g. Feb 30).
        expr.fire_at()
            .map(|_| expr)
            .ok_or_else(|| ExpressionError(s.to_string()))
    }
}

/// Validate `raw` against the input profile and require it to be strictly
/// after `now`.
pub fn normalize(raw: &str, now: DateTime<Utc>) -> Result<NormalizedTime, TimeError> {
    let at = parse_profile(raw)?;
    if at <= now {
        return Err(TimeError::NotInFuture {
            at: at.format(CANONICAL_FORMAT).to_string(),
        });
    }

    Ok(NormalizedTime {
        at,
        canonical: at.format(CANONICAL_FORMAT).to_string(),
        expression: TriggerExpression::from_utc(&at),
    })
}

/// Shape check first, then calendar check. chrono alone accepts single-digit
/// fields and signed years, which the profile does not allow.
fn parse_profile(raw: &str) -> Result<DateTime<Utc>, TimeError> {
    let invalid = || TimeError::InvalidFormat {
        input: raw.to_string(),
    };

    let body = raw.strip_suffix('Z').unwrap_or(raw);
    let bytes = body.as_bytes();
    if bytes.len() != PROFILE_LEN {
        return Err(invalid());
    }

    let shape_ok = bytes.iter().enumerate().all(|(i, b)| match i {
        4 | 7 => *b == b'-',
        10 => *b == b'T',
        13 => *b == b':',
        _ => b.is_ascii_digit(),
    });
    if !shape_ok {
        return Err(invalid());
    }

    NaiveDateTime::parse_from_str(body, PARSE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| invalid())
}
