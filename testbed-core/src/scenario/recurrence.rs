//! Recurrence rules in the iCalendar `RRULE` dialect
//!
//! Only fixed-length frequencies are supported (`SECONDLY` up to `WEEKLY`), which keeps period
//! arithmetic exact in UTC: the period containing any instant can be computed directly instead
//! of walking every occurrence since the anchor. The candidates of a period only depend on where
//! it falls within the week, so they repeat after a fixed cycle of periods. A search never looks
//! further than one cycle ahead, and `COUNT` rules count past occurrences a cycle at a time.
//!
//! Supported parts: `FREQ`, `INTERVAL`, `COUNT`, `UNTIL`, `BYDAY`, `BYHOUR`, `BYMINUTE` and
//! `BYSECOND`. The anchor is taken from a `DTSTART` line (or part) and defaults to the Unix
//! epoch. Weeks start on Monday.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc, Weekday};
use std::str::FromStr;
use thiserror::Error;

const SECS_PER_DAY: i64 = 86_400;
const SECS_PER_WEEK: i64 = 7 * SECS_PER_DAY;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct RecurrenceError(String);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Frequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
}

impl Frequency {
    fn unit_secs(self) -> i64 {
        match self {
            Frequency::Secondly => 1,
            Frequency::Minutely => 60,
            Frequency::Hourly => 3_600,
            Frequency::Daily => SECS_PER_DAY,
            Frequency::Weekly => 7 * SECS_PER_DAY,
        }
    }
}

impl FromStr for Frequency {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SECONDLY" => Ok(Frequency::Secondly),
            "MINUTELY" => Ok(Frequency::Minutely),
            "HOURLY" => Ok(Frequency::Hourly),
            "DAILY" => Ok(Frequency::Daily),
            "WEEKLY" => Ok(Frequency::Weekly),
            "MONTHLY" | "YEARLY" => Err(RecurrenceError(format!(
                "unsupported frequency `{s}`"
            ))),
            _ => Err(RecurrenceError(format!("unknown frequency `{s}`"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub count: Option<u32>,
    pub until: Option<DateTime<Utc>>,
    pub by_day: Vec<Weekday>,
    pub by_hour: Vec<u32>,
    pub by_minute: Vec<u32>,
    pub by_second: Vec<u32>,
    pub dtstart: DateTime<Utc>,
    /// Running totals of candidates over one cycle of periods, only computed for `COUNT` rules
    cycle_totals: Vec<u32>,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RecurrenceError> {
    let value = value.trim().trim_end_matches('Z');
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S") {
        return Ok(naive.and_utc());
    }

    NaiveDate::parse_from_str(value, "%Y%m%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| RecurrenceError(format!("invalid timestamp `{value}`")))
}

fn parse_list(key: &str, value: &str, max: u32) -> Result<Vec<u32>, RecurrenceError> {
    let mut values = value
        .split(',')
        .map(|v| match v.trim().parse::<u32>() {
            Ok(n) if n <= max => Ok(n),
            _ => Err(RecurrenceError(format!("invalid {key} value `{v}`"))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn parse_weekday(value: &str) -> Result<Weekday, RecurrenceError> {
    match value.trim() {
        "MO" => Ok(Weekday::Mon),
        "TU" => Ok(Weekday::Tue),
        "WE" => Ok(Weekday::Wed),
        "TH" => Ok(Weekday::Thu),
        "FR" => Ok(Weekday::Fri),
        "SA" => Ok(Weekday::Sat),
        "SU" => Ok(Weekday::Sun),
        other => Err(RecurrenceError(format!("invalid BYDAY value `{other}`"))),
    }
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Day of the week of a Unix timestamp, counted from Monday (1970-01-01 was a Thursday)
fn weekday_index(timestamp: i64) -> i64 {
    (timestamp.div_euclid(SECS_PER_DAY) + 3).rem_euclid(7)
}

impl FromStr for RecurrenceRule {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut frequency = None;
        let mut rule = RecurrenceRule {
            frequency: Frequency::Daily,
            interval: 1,
            count: None,
            until: None,
            by_day: Vec::new(),
            by_hour: Vec::new(),
            by_minute: Vec::new(),
            by_second: Vec::new(),
            dtstart: DateTime::<Utc>::UNIX_EPOCH,
            cycle_totals: Vec::new(),
        };

        for line in s.to_ascii_uppercase().lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(dtstart) = line.strip_prefix("DTSTART:") {
                rule.dtstart = parse_timestamp(dtstart)?;
                continue;
            }

            let parts = line.strip_prefix("RRULE:").unwrap_or(line);
            for part in parts.split(';').filter(|p| !p.trim().is_empty()) {
                let (key, value) = part
                    .split_once('=')
                    .ok_or_else(|| RecurrenceError(format!("malformed rule part `{part}`")))?;
                let value = value.trim();

                match key.trim() {
                    "FREQ" => frequency = Some(value.parse()?),
                    "INTERVAL" => {
                        rule.interval = value
                            .parse()
                            .ok()
                            .filter(|&i| i > 0)
                            .ok_or_else(|| RecurrenceError(format!("invalid INTERVAL `{value}`")))?;
                    }
                    "COUNT" => {
                        rule.count = Some(
                            value
                                .parse()
                                .map_err(|_| RecurrenceError(format!("invalid COUNT `{value}`")))?,
                        );
                    }
                    "UNTIL" => rule.until = Some(parse_timestamp(value)?),
                    "DTSTART" => rule.dtstart = parse_timestamp(value)?,
                    "BYDAY" => {
                        rule.by_day = value
                            .split(',')
                            .map(parse_weekday)
                            .collect::<Result<_, _>>()?;
                    }
                    "BYHOUR" => rule.by_hour = parse_list("BYHOUR", value, 23)?,
                    "BYMINUTE" => rule.by_minute = parse_list("BYMINUTE", value, 59)?,
                    "BYSECOND" => rule.by_second = parse_list("BYSECOND", value, 59)?,
                    // Only meaningful for weekly rules with a week start other than Monday
                    "WKST" if value == "MO" => {}
                    other => {
                        return Err(RecurrenceError(format!("unsupported rule part `{other}`")));
                    }
                }
            }
        }

        rule.frequency = frequency.ok_or_else(|| RecurrenceError("missing FREQ".to_string()))?;
        if rule.count.is_some() && rule.until.is_some() {
            return Err(RecurrenceError(
                "COUNT and UNTIL cannot be combined".to_string(),
            ));
        }

        if rule.count.is_some() {
            rule.cycle_totals = rule.count_cycle();
        }

        Ok(rule)
    }
}

impl RecurrenceRule {
    fn step_secs(&self) -> i64 {
        self.frequency.unit_secs() * i64::from(self.interval)
    }

    /// Number of periods after which the candidates repeat
    fn cycle_len(&self) -> i64 {
        SECS_PER_WEEK / gcd(self.step_secs(), SECS_PER_WEEK)
    }

    fn count_cycle(&self) -> Vec<u32> {
        let anchor = self.anchor();
        let step = self.step_secs();
        let mut totals = Vec::with_capacity(self.cycle_len() as usize + 1);
        let mut total = 0;
        totals.push(total);
        for index in 0..self.cycle_len() {
            total += self.candidates(anchor + index * step).len() as u32;
            totals.push(total);
        }

        totals
    }

    /// Occurrences (at or after `dtstart`) in the periods before `period_index`
    fn occurrences_before(&self, period_index: i64) -> u64 {
        if period_index <= 0 {
            return 0;
        }

        let total_at = |index: i64| {
            self.cycle_totals
                .get(index as usize)
                .copied()
                .map(u64::from)
                .unwrap_or(0)
        };
        let cycle = self.cycle_len();
        let candidates = (period_index / cycle) as u64 * total_at(cycle) + total_at(period_index % cycle);

        // Only the first period can hold candidates that precede `dtstart`
        let start = self.dtstart.timestamp();
        let skipped = self
            .candidates(self.anchor())
            .into_iter()
            .filter(|&c| c < start)
            .count() as u64;

        candidates.saturating_sub(skipped)
    }

    /// Start of the first period: `dtstart` truncated to the frequency's unit
    fn anchor(&self) -> i64 {
        let start = self.dtstart.timestamp();
        match self.frequency {
            Frequency::Weekly => {
                let day_start = start - start.rem_euclid(SECS_PER_DAY);
                day_start - weekday_index(start) * SECS_PER_DAY
            }
            frequency => start - start.rem_euclid(frequency.unit_secs()),
        }
    }

    fn day_matches(&self, timestamp: i64) -> bool {
        self.by_day.is_empty()
            || self
                .by_day
                .iter()
                .any(|d| i64::from(d.num_days_from_monday()) == weekday_index(timestamp))
    }

    /// Values of a time-of-day field within one period
    ///
    /// Fields at least as fine as the frequency are expanded from their `BY` list (or copied from
    /// `dtstart`); coarser ones are fixed by the period and only filtered.
    fn field_values(&self, fixed_by_period: bool, own: u32, by: &[u32], default: u32) -> Vec<u32> {
        if fixed_by_period {
            if by.is_empty() || by.contains(&own) {
                vec![own]
            } else {
                Vec::new()
            }
        } else if by.is_empty() {
            vec![default]
        } else {
            by.to_vec()
        }
    }

    /// Occurrence candidates within the period starting at `period`, in ascending order
    fn candidates(&self, period: i64) -> Vec<i64> {
        let day_starts: Vec<i64> = match self.frequency {
            Frequency::Weekly => {
                let dtstart_day = weekday_index(self.dtstart.timestamp());
                (0..7)
                    .map(|offset| period + offset * SECS_PER_DAY)
                    .filter(|&day| {
                        if self.by_day.is_empty() {
                            weekday_index(day) == dtstart_day
                        } else {
                            self.day_matches(day)
                        }
                    })
                    .collect()
            }
            _ => {
                let day = period - period.rem_euclid(SECS_PER_DAY);
                if self.day_matches(day) {
                    vec![day]
                } else {
                    Vec::new()
                }
            }
        };

        let in_day = period.rem_euclid(SECS_PER_DAY);
        let hours = self.field_values(
            self.frequency <= Frequency::Hourly,
            (in_day / 3_600) as u32,
            &self.by_hour,
            self.dtstart.hour(),
        );
        let minutes = self.field_values(
            self.frequency <= Frequency::Minutely,
            (in_day % 3_600 / 60) as u32,
            &self.by_minute,
            self.dtstart.minute(),
        );
        let seconds = self.field_values(
            self.frequency == Frequency::Secondly,
            (in_day % 60) as u32,
            &self.by_second,
            self.dtstart.second(),
        );

        let mut candidates = Vec::new();
        for day in day_starts {
            for &h in &hours {
                for &m in &minutes {
                    for &s in &seconds {
                        candidates.push(day + i64::from(h * 3_600 + m * 60 + s));
                    }
                }
            }
        }

        candidates
    }

    /// The first occurrence strictly after `after`, if the rule has one
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after = after.timestamp();
        let start = self.dtstart.timestamp();
        let until = self.until.map(|u| u.timestamp());
        let step = self.step_secs();
        let anchor = self.anchor();

        let first = (after.max(start) - anchor).div_euclid(step).max(0);
        let mut seen = match self.count {
            Some(_) => self.occurrences_before(first),
            None => 0,
        };

        // A whole cycle without a match means the rule never matches again
        for period_index in first..=first + self.cycle_len() {
            let period = anchor + period_index * step;
            if until.is_some_and(|u| period > u) {
                return None;
            }

            for candidate in self.candidates(period) {
                if candidate < start || until.is_some_and(|u| candidate > u) {
                    continue;
                }

                if let Some(count) = self.count {
                    if seen >= u64::from(count) {
                        return None;
                    }
                    seen += 1;
                }

                if candidate > after {
                    return DateTime::from_timestamp(candidate, 0);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn next(rule: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        rule.parse::<RecurrenceRule>().unwrap().next_after(after)
    }

    #[test]
    fn test_hourly() {
        assert_eq!(
            next("RRULE:FREQ=HOURLY", at(2025, 1, 6, 10, 15, 0)),
            Some(at(2025, 1, 6, 11, 0, 0))
        );

        // An occurrence exactly at `after` is not returned
        assert_eq!(
            next("FREQ=HOURLY", at(2025, 1, 6, 11, 0, 0)),
            Some(at(2025, 1, 6, 12, 0, 0))
        );
    }

    #[test]
    fn test_interval() {
        assert_eq!(
            next("FREQ=MINUTELY;INTERVAL=15", at(2025, 1, 6, 10, 7, 0)),
            Some(at(2025, 1, 6, 10, 15, 0))
        );
        assert_eq!(
            next(
                "DTSTART:20250106T000000Z\nRRULE:FREQ=DAILY;INTERVAL=2",
                at(2025, 1, 6, 12, 0, 0)
            ),
            Some(at(2025, 1, 8, 0, 0, 0))
        );
    }

    #[test]
    fn test_daily_by_hour() {
        let rule = "FREQ=DAILY;BYHOUR=9,17";
        assert_eq!(
            next(rule, at(2025, 1, 6, 10, 0, 0)),
            Some(at(2025, 1, 6, 17, 0, 0))
        );
        assert_eq!(
            next(rule, at(2025, 1, 6, 18, 0, 0)),
            Some(at(2025, 1, 7, 9, 0, 0))
        );
    }

    #[test]
    fn test_weekly_by_day() {
        // 2025-01-06 is a Monday
        let rule = "FREQ=WEEKLY;BYDAY=MO,WE;BYHOUR=8";
        assert_eq!(
            next(rule, at(2025, 1, 7, 12, 0, 0)),
            Some(at(2025, 1, 8, 8, 0, 0))
        );
        assert_eq!(
            next(rule, at(2025, 1, 8, 9, 0, 0)),
            Some(at(2025, 1, 13, 8, 0, 0))
        );
    }

    #[test]
    fn test_count_and_until() {
        let counted = "DTSTART:20250101T000000Z\nRRULE:FREQ=DAILY;COUNT=3";
        assert_eq!(
            next(counted, at(2025, 1, 2, 12, 0, 0)),
            Some(at(2025, 1, 3, 0, 0, 0))
        );
        assert_eq!(next(counted, at(2025, 1, 3, 0, 0, 0)), None);

        let bounded = "FREQ=HOURLY;UNTIL=20250106T120000Z";
        assert_eq!(
            next(bounded, at(2025, 1, 6, 11, 30, 0)),
            Some(at(2025, 1, 6, 12, 0, 0))
        );
        assert_eq!(next(bounded, at(2025, 1, 6, 12, 0, 0)), None);
    }

    #[test]
    fn test_restrictive_fine_grained_rule() {
        assert_eq!(
            next("FREQ=SECONDLY;BYHOUR=9", at(2025, 1, 6, 10, 0, 0)),
            Some(at(2025, 1, 7, 9, 0, 0))
        );
        assert_eq!(
            next("FREQ=MINUTELY;BYDAY=SU;BYHOUR=3", at(2025, 1, 6, 10, 0, 0)),
            Some(at(2025, 1, 12, 3, 0, 0))
        );

        // Weekly periods anchored at the epoch all start on a Thursday
        assert_eq!(
            next("FREQ=HOURLY;BYDAY=SA;INTERVAL=168", at(2025, 1, 6, 10, 0, 0)),
            None
        );
    }

    #[test]
    fn test_count_from_a_distant_start() {
        // Counted from the epoch: 20 million seconds run out in 1970, 2 billion last until 2033
        assert_eq!(
            next("FREQ=SECONDLY;COUNT=20000000", at(2025, 1, 6, 0, 0, 0)),
            None
        );
        assert_eq!(
            next("FREQ=SECONDLY;COUNT=2000000000", at(2025, 1, 6, 0, 0, 0)),
            Some(at(2025, 1, 6, 0, 0, 1))
        );

        // Occurrences fall at half past every minute, the 1000th one at 16:39:30
        let counted = "DTSTART:20250106T000030Z\nRRULE:FREQ=MINUTELY;COUNT=1000";
        assert_eq!(
            next(counted, at(2025, 1, 6, 16, 38, 30)),
            Some(at(2025, 1, 6, 16, 39, 30))
        );
        assert_eq!(next(counted, at(2025, 1, 6, 16, 39, 30)), None);
    }

    #[test]
    fn test_invalid_rules() {
        for rule in [
            "FREQ=MONTHLY",
            "INTERVAL=2",
            "FREQ=DAILY;BYHOUR=24",
            "FREQ=DAILY;BYDAY=1MO",
            "FREQ=DAILY;INTERVAL=0",
            "FREQ=DAILY;BYSETPOS=1",
            "FREQ=DAILY;COUNT=2;UNTIL=20250101",
        ] {
            assert!(rule.parse::<RecurrenceRule>().is_err(), "{rule}");
        }
    }
}
