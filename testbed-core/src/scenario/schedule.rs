use crate::scenario::recurrence::RecurrenceRule;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("invalid duration `{0}` (expected `PT[n]H[n]M[n]S` or a number of seconds)")]
    InvalidDuration(String),
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("invalid recurrence rule `{rule}`: {reason}")]
    InvalidRecurrence { rule: String, reason: String },
    #[error("transient scenario `{0}` has no schedule")]
    MissingSchedule(Arc<str>),
    #[error("schedule `{0}` has no future occurrences")]
    Exhausted(String),
}

/// Parses `PT[n]H[n]M[n]S` (any subset of the components, in that order) or a bare number of
/// seconds
pub fn parse_duration(input: &str) -> Result<Duration, SchedulingError> {
    let invalid = || SchedulingError::InvalidDuration(input.to_string());
    let trimmed = input.trim().to_ascii_uppercase();

    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return trimmed
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| invalid());
    }

    let components = trimmed.strip_prefix("PT").ok_or_else(invalid)?;
    if components.is_empty() {
        return Err(invalid());
    }

    let units = [('H', 3_600), ('M', 60), ('S', 1)];
    let mut next_unit = 0;
    let mut total: u64 = 0;
    let mut digits = String::new();

    for c in components.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        // Each unit may appear once, after the ones that precede it
        let position = units[next_unit..]
            .iter()
            .position(|&(unit, _)| unit == c)
            .ok_or_else(invalid)?;
        let (_, multiplier) = units[next_unit + position];
        next_unit += position + 1;

        let value: u64 = digits.parse().map_err(|_| invalid())?;
        total = value
            .checked_mul(multiplier)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
        digits.clear();
    }

    // Trailing digits without a unit
    if !digits.is_empty() {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total))
}

/// When a transient scenario starts
#[derive(Clone, Debug)]
pub enum Schedule {
    Cron(Box<cron::Schedule>),
    Recurrence(RecurrenceRule),
}

impl FromStr for Schedule {
    type Err = SchedulingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();

        if ["RRULE:", "FREQ=", "DTSTART"]
            .iter()
            .any(|prefix| upper.starts_with(prefix))
        {
            return trimmed
                .parse()
                .map(Schedule::Recurrence)
                .map_err(|e| SchedulingError::InvalidRecurrence {
                    rule: s.to_string(),
                    reason: e.to_string(),
                });
        }

        let invalid_cron = |reason: String| SchedulingError::InvalidCron {
            expression: s.to_string(),
            reason,
        };

        // Crontab expressions have no seconds field
        let expression = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            fields => return Err(invalid_cron(format!("expected 5 to 7 fields, found {fields}"))),
        };

        cron::Schedule::from_str(&expression)
            .map(|schedule| Schedule::Cron(Box::new(schedule)))
            .map_err(|e| invalid_cron(e.to_string()))
    }
}

impl Schedule {
    /// The first occurrence strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(schedule) => schedule.after(&after).next(),
            Schedule::Recurrence(rule) => rule.next_after(after),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_duration() {
        let cases = [
            ("PT1H30M", 5_400),
            ("90", 90),
            ("PT15M", 900),
            ("pt45s", 45),
            ("PT1H", 3_600),
            ("PT2H0M10S", 7_210),
            ("0", 0),
        ];

        for (input, secs) in cases {
            assert_eq!(
                parse_duration(input).unwrap(),
                Duration::from_secs(secs),
                "{input}"
            );
        }

        for input in ["", "PT", "1H", "PT10", "PT1M1H", "PT1H1H", "PTXS", "-5", "P1D"] {
            assert_eq!(
                parse_duration(input),
                Err(SchedulingError::InvalidDuration(input.to_string())),
                "{input}"
            );
        }
    }

    #[test]
    fn test_cron_schedule() {
        let schedule: Schedule = "*/5 * * * *".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 6, 10, 7, 30).unwrap();
        assert_eq!(
            schedule.next_after(now),
            Some(Utc.with_ymd_and_hms(2025, 1, 6, 10, 10, 0).unwrap())
        );

        assert!(matches!(
            "every tuesday".parse::<Schedule>(),
            Err(SchedulingError::InvalidCron { .. })
        ));
        assert!(matches!(
            "61 * * * *".parse::<Schedule>(),
            Err(SchedulingError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_recurrence_schedule() {
        let schedule: Schedule = "RRULE:FREQ=HOURLY;BYMINUTE=30".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 6, 10, 45, 0).unwrap();
        assert_eq!(
            schedule.next_after(now),
            Some(Utc.with_ymd_and_hms(2025, 1, 6, 11, 30, 0).unwrap())
        );

        assert!(matches!(
            "FREQ=FORTNIGHTLY".parse::<Schedule>(),
            Err(SchedulingError::InvalidRecurrence { .. })
        ));
    }
}
