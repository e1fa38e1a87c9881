//! Schedule specification parsing and trigger semantics.
//!
//! A schedule specification is a short human-authored string in one of four
//! grammars, dispatched on prefix:
//!
//! - `cron:<minute> <hour> <dom> <month> <dow>` — crontab expression
//! - `every <N><unit>` — fixed interval, unit one of `s`/`m`/`h`/`d`
//! - `at:<ISO-8601 instant>` — one-shot at an absolute time
//! - `in <N><unit>` — one-shot relative to now
//!
//! Parsing yields a [`Trigger`], the closed sum of the three trigger shapes.
//! Only the raw string is ever persisted; specs are re-parsed on load.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Timelike, Utc};
use regex::Regex;
use serde_json::json;
use tracing::warn;

use super::types::ScheduleKind;

static SPAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)([smhd])$").expect("SPAN_RE is a compile-time constant"));

/// Error raised for a malformed schedule specification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The spec matched none of the four grammars
    #[error("unrecognized schedule format: {0}")]
    UnrecognizedFormat(String),
    /// Bad crontab expression
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    /// Bad interval specification
    #[error("invalid interval specification: {0}")]
    InvalidInterval(String),
    /// Bad relative-time specification
    #[error("invalid relative specification: {0}")]
    InvalidRelative(String),
    /// Bad one-shot date
    #[error("invalid date specification: {0}")]
    InvalidDate(String),
}

/// Concrete temporal rule governing when a scheduled task fires.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Crontab-style recurring schedule
    Cron(CronSchedule),
    /// Fixed repeating interval
    Interval(IntervalSchedule),
    /// One-shot at an absolute instant
    Date(DateSchedule),
}

impl Trigger {
    /// Parse a schedule specification.
    ///
    /// `start_time` anchors interval schedules; when absent the interval is
    /// anchored at parse time. A one-shot `at:` instant already in the past
    /// parses successfully (a warning is logged); whether it ever fires is
    /// decided at registration time.
    pub fn parse(spec: &str, start_time: Option<DateTime<Utc>>) -> Result<Trigger, ParseError> {
        Self::parse_with_now(spec, start_time, Utc::now())
    }

    fn parse_with_now(
        spec: &str,
        start_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Trigger, ParseError> {
        if let Some(expr) = spec.strip_prefix("cron:") {
            return CronSchedule::parse(expr.trim()).map(Trigger::Cron);
        }

        if let Some(raw) = spec.strip_prefix("every ") {
            let raw = raw.trim();
            let (count, unit) = parse_span(raw)
                .ok_or_else(|| ParseError::InvalidInterval(raw.to_string()))?;
            return Ok(Trigger::Interval(IntervalSchedule {
                count,
                unit,
                anchor: start_time.unwrap_or(now),
            }));
        }

        if let Some(raw) = spec.strip_prefix("at:") {
            let raw = raw.trim();
            let at =
                parse_instant(raw).ok_or_else(|| ParseError::InvalidDate(raw.to_string()))?;
            if at <= now {
                warn!(instant = %at, "schedule instant is in the past");
            }
            return Ok(Trigger::Date(DateSchedule { at }));
        }

        if let Some(raw) = spec.strip_prefix("in ") {
            let raw = raw.trim();
            let (count, unit) = parse_span(raw)
                .ok_or_else(|| ParseError::InvalidRelative(raw.to_string()))?;
            let offset = Duration::try_seconds(i64::from(count) * unit.seconds() as i64)
                .ok_or_else(|| ParseError::InvalidRelative(raw.to_string()))?;
            let at = now
                .checked_add_signed(offset)
                .ok_or_else(|| ParseError::InvalidRelative(raw.to_string()))?;
            return Ok(Trigger::Date(DateSchedule { at }));
        }

        Err(ParseError::UnrecognizedFormat(spec.to_string()))
    }

    /// The schedule kind this trigger persists as.
    pub fn kind(&self) -> ScheduleKind {
        match self {
            Trigger::Cron(_) => ScheduleKind::Cron,
            Trigger::Interval(_) => ScheduleKind::Interval,
            Trigger::Date(_) => ScheduleKind::Date,
        }
    }

    /// Smallest fire instant strictly after `after`, or `None` if the
    /// trigger never fires again.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(cron) => cron.next_after(after),
            Trigger::Interval(interval) => interval.next_after(after),
            Trigger::Date(date) => (date.at > after).then_some(date.at),
        }
    }

    /// Trigger introspection for API responses: per-field literals for cron,
    /// total seconds for intervals, the ISO instant for one-shots.
    pub fn info(&self) -> serde_json::Value {
        match self {
            Trigger::Cron(cron) => json!({
                "type": "cron",
                "minute": cron.minute.expr(),
                "hour": cron.hour.expr(),
                "day_of_month": cron.day_of_month.expr(),
                "month": cron.month.expr(),
                "day_of_week": cron.day_of_week.expr(),
            }),
            Trigger::Interval(interval) => json!({
                "type": "interval",
                "seconds": interval.period_seconds(),
            }),
            Trigger::Date(date) => json!({
                "type": "date",
                "run_date": date.at.to_rfc3339(),
            }),
        }
    }
}

/// Crontab-style recurring schedule: five fields, all of which must match.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    /// Minute field (0-59)
    pub minute: CronField,
    /// Hour field (0-23)
    pub hour: CronField,
    /// Day-of-month field (1-31)
    pub day_of_month: CronField,
    /// Month field (1-12)
    pub month: CronField,
    /// Day-of-week field (0-6, 0 = Sunday)
    pub day_of_week: CronField,
}

impl CronSchedule {
    /// Parse a five-field crontab expression.
    pub fn parse(expr: &str) -> Result<Self, ParseError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ParseError::InvalidCron(format!(
                "expected 5 fields, got {}: {}",
                parts.len(),
                expr
            )));
        }
        Ok(Self {
            minute: CronField::parse(parts[0], 0, 59)?,
            hour: CronField::parse(parts[1], 0, 23)?,
            day_of_month: CronField::parse(parts[2], 1, 31)?,
            month: CronField::parse(parts[3], 1, 12)?,
            day_of_week: CronField::parse(parts[4], 0, 6)?,
        })
    }

    /// Smallest instant strictly after `after` (at whole-minute resolution)
    /// satisfying all five fields.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        // Bounded scan keeps unsatisfiable day combinations (e.g. Feb 30) finite.
        let limit = after + Duration::days(4 * 366);
        while t <= limit {
            if !self.matches_day(&t) {
                let midnight = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?;
                t = midnight.and_utc();
                continue;
            }
            if self.hour.matches(t.hour()) && self.minute.matches(t.minute()) {
                return Some(t);
            }
            t += Duration::minutes(1);
        }
        None
    }

    fn matches_day(&self, t: &DateTime<Utc>) -> bool {
        self.month.matches(t.month())
            && self.day_of_month.matches(t.day())
            && self.day_of_week.matches(t.weekday().num_days_from_sunday())
    }
}

/// One parsed crontab field: `*`, a value, a range `a-b`, a comma list of
/// values/ranges, or a step `*/n`.
#[derive(Debug, Clone)]
pub struct CronField {
    expr: String,
    mask: u64,
}

impl CronField {
    fn parse(expr: &str, min: u32, max: u32) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidCron(expr.to_string());
        let mut mask: u64 = 0;

        if expr == "*" {
            for v in min..=max {
                mask |= 1 << v;
            }
        } else if let Some(step) = expr.strip_prefix("*/") {
            let step: u32 = step.parse().map_err(|_| invalid())?;
            if step == 0 {
                return Err(invalid());
            }
            let mut v = min;
            while v <= max {
                mask |= 1 << v;
                match v.checked_add(step) {
                    Some(next) => v = next,
                    None => break,
                }
            }
        } else {
            for item in expr.split(',') {
                let (lo, hi) = match item.split_once('-') {
                    Some((a, b)) => (
                        a.parse::<u32>().map_err(|_| invalid())?,
                        b.parse::<u32>().map_err(|_| invalid())?,
                    ),
                    None => {
                        let v = item.parse::<u32>().map_err(|_| invalid())?;
                        (v, v)
                    }
                };
                if lo < min || hi > max || lo > hi {
                    return Err(invalid());
                }
                for v in lo..=hi {
                    mask |= 1 << v;
                }
            }
        }

        Ok(Self {
            expr: expr.to_string(),
            mask,
        })
    }

    /// The literal field text as written.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    fn matches(&self, value: u32) -> bool {
        value < 64 && (self.mask >> value) & 1 == 1
    }
}

/// Unit of an interval or relative-time span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    /// Seconds
    Seconds,
    /// Minutes
    Minutes,
    /// Hours
    Hours,
    /// Days
    Days,
}

impl IntervalUnit {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "s" => Some(IntervalUnit::Seconds),
            "m" => Some(IntervalUnit::Minutes),
            "h" => Some(IntervalUnit::Hours),
            "d" => Some(IntervalUnit::Days),
            _ => None,
        }
    }

    /// Length of one unit in seconds.
    pub fn seconds(&self) -> u64 {
        match self {
            IntervalUnit::Seconds => 1,
            IntervalUnit::Minutes => 60,
            IntervalUnit::Hours => 3_600,
            IntervalUnit::Days => 86_400,
        }
    }

    /// English unit word, pluralized for counts other than one.
    pub fn word(&self, count: u32) -> &'static str {
        match (self, count) {
            (IntervalUnit::Seconds, 1) => "second",
            (IntervalUnit::Seconds, _) => "seconds",
            (IntervalUnit::Minutes, 1) => "minute",
            (IntervalUnit::Minutes, _) => "minutes",
            (IntervalUnit::Hours, 1) => "hour",
            (IntervalUnit::Hours, _) => "hours",
            (IntervalUnit::Days, 1) => "day",
            (IntervalUnit::Days, _) => "days",
        }
    }
}

/// Fixed repeating interval anchored at a start instant.
#[derive(Debug, Clone)]
pub struct IntervalSchedule {
    /// Number of units per period (positive)
    pub count: u32,
    /// Period unit
    pub unit: IntervalUnit,
    /// Start instant; firings land at `anchor + k * period` for `k >= 1`
    pub anchor: DateTime<Utc>,
}

impl IntervalSchedule {
    /// Total period length in seconds.
    pub fn period_seconds(&self) -> u64 {
        u64::from(self.count) * self.unit.seconds()
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let period = i64::try_from(self.period_seconds()).ok()?;
        let k = if after < self.anchor {
            1
        } else {
            (after - self.anchor).num_seconds() / period + 1
        };
        self.anchor
            .checked_add_signed(Duration::try_seconds(k.checked_mul(period)?)?)
    }
}

/// One-shot schedule at an absolute instant.
#[derive(Debug, Clone)]
pub struct DateSchedule {
    /// The firing instant
    pub at: DateTime<Utc>,
}

/// Best-effort human-readable description of a schedule specification.
///
/// Independent of parsing: malformed or unrecognized specs are echoed back
/// verbatim rather than failing.
pub fn human_readable(spec: &str) -> String {
    if let Some(expr) = spec.strip_prefix("cron:") {
        return format!("Cron schedule: {}", expr.trim());
    }

    if let Some(raw) = spec.strip_prefix("every ") {
        return match parse_span(raw.trim()) {
            Some((count, unit)) => format!("Every {} {}", count, unit.word(count)),
            None => spec.to_string(),
        };
    }

    if let Some(raw) = spec.strip_prefix("at:") {
        let raw = raw.trim();
        return match parse_instant(raw) {
            Some(at) => format!("At {}", at.format("%Y-%m-%d %H:%M:%S")),
            None => format!("At {}", raw),
        };
    }

    if let Some(raw) = spec.strip_prefix("in ") {
        return match parse_span(raw.trim()) {
            Some((count, unit)) => format!("In {} {}", count, unit.word(count)),
            None => spec.to_string(),
        };
    }

    spec.to_string()
}

/// Extract the instant embedded in an `at:` spec, if there is one.
///
/// Used at reload time to prune one-shot schedules that are already in the
/// past; relative (`in ...`) specs have no embedded instant and return `None`.
pub(crate) fn embedded_instant(spec: &str) -> Option<DateTime<Utc>> {
    parse_instant(spec.strip_prefix("at:")?.trim())
}

fn parse_span(raw: &str) -> Option<(u32, IntervalUnit)> {
    let caps = SPAN_RE.captures(raw)?;
    let count: u32 = caps[1].parse().ok()?;
    if count == 0 {
        return None;
    }
    let unit = IntervalUnit::from_suffix(&caps[2])?;
    Some((count, unit))
}

pub(crate) fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>().ok().map(|naive| naive.and_utc())
}
