//! Schedule specifications for DAG triggering.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// When a DAG fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Triggered only through the API or a trigger token
    Manual,
    /// Cron expression, optionally in a named timezone
    Cron {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Fixed interval in seconds
    Interval { seconds: u64 },
    /// Fire once at a specific time
    Once { at: DateTime<Utc> },
}

impl Schedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Cron { .. } => "cron",
            Self::Interval { .. } => "interval",
            Self::Once { .. } => "once",
        }
    }

    /// Whether the scheduler installs a timer for this variant.
    pub fn installs_timer(&self) -> bool {
        matches!(self, Self::Cron { .. } | Self::Interval { .. })
    }
}

/// A DAG's schedule plus its activation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagSchedule {
    #[serde(flatten)]
    pub schedule: Schedule,

    /// Inclusive window start; triggers before it are skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,

    /// Inclusive window end; triggers after it are skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for DagSchedule {
    fn default() -> Self {
        Self {
            schedule: Schedule::Manual,
            start_date: None,
            end_date: None,
            enabled: true,
        }
    }
}

impl DagSchedule {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn interval(seconds: u64) -> Self {
        Self {
            schedule: Schedule::Interval { seconds },
            ..Self::default()
        }
    }

    pub fn cron(expression: impl Into<String>, timezone: Option<String>) -> Self {
        Self {
            schedule: Schedule::Cron {
                expression: expression.into(),
                timezone,
            },
            ..Self::default()
        }
    }

    /// Whether the window permits triggering at `now`.
    pub fn window_permits(&self, now: DateTime<Utc>) -> bool {
        if let Some(start) = self.start_date {
            if now < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if now > end {
                return false;
            }
        }
        true
    }
}

/// A parsed, timezone-aware cron expression.
///
/// Five-field expressions are accepted by normalizing to the six-field
/// form the `cron` crate parses (a leading seconds column of `0`).
#[derive(Debug, Clone)]
pub struct CronExpression {
    schedule: cron::Schedule,
    tz: Tz,
}

impl CronExpression {
    pub fn parse(expression: &str, timezone: Option<&str>) -> Result<Self, String> {
        let normalized = if expression.split_whitespace().count() == 5 {
            format!("0 {}", expression)
        } else {
            expression.to_string()
        };

        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| format!("invalid cron expression {:?}: {}", expression, e))?;

        let tz = match timezone {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| format!("unknown timezone {:?}", name))?,
            None => Tz::UTC,
        };

        Ok(Self { schedule, tz })
    }

    /// The next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.tz))
            .next()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_cron_accepted() {
        let expr = CronExpression::parse("*/5 * * * *", None).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let next = expr.next_after(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        assert!(CronExpression::parse("not a cron", None).is_err());
        assert!(CronExpression::parse("* * * * *", Some("Mars/Olympus")).is_err());
    }

    #[test]
    fn test_timezone_offset() {
        let expr = CronExpression::parse("0 9 * * *", Some("America/New_York")).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        // 09:00 EDT == 13:00 UTC during DST
        let next = expr.next_after(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_window_permits() {
        let mut sched = DagSchedule::interval(60);
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert!(sched.window_permits(now));

        sched.start_date = Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert!(!sched.window_permits(now));

        sched.start_date = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        sched.end_date = Some(Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());
        assert!(!sched.window_permits(now));
    }

    #[test]
    fn test_manual_installs_no_timer() {
        assert!(!Schedule::Manual.installs_timer());
        assert!(!Schedule::Once { at: Utc::now() }.installs_timer());
        assert!(Schedule::Interval { seconds: 10 }.installs_timer());
    }
}
