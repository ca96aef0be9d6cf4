// Recurring schedule entries: a pure function from "last fired at" to
// "next firing instant", per spec §9's "schedule as a function, not a
// class hierarchy" design note.

use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// A schedule is a tagged variant rather than a trait object hierarchy:
/// there is exactly one concrete kind today (`Regular`). A `Custom`
/// variant driven by a callback would require a scripting boundary this
/// crate doesn't have, so it's deliberately not implemented (see
/// DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Schedule {
    Regular(RegularSchedule),
}

impl Schedule {
    /// Next instant strictly after `after`, interpreted in `tz`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>, tz: FixedOffset) -> DateTime<Utc> {
        match self {
            Schedule::Regular(regular) => regular.next_after(after, tz),
        }
    }
}

/// `{seconds, minutes, hours, weekdays}`: missing/empty sets mean "any".
/// Produces instants whose local-time components all match the
/// configured sets, at one-second resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RegularSchedule {
    #[serde(default)]
    pub seconds: HashSet<u32>,
    #[serde(default)]
    pub minutes: HashSet<u32>,
    #[serde(default)]
    pub hours: HashSet<u32>,
    #[serde(default)]
    pub weekdays: HashSet<Weekday>,
}

/// Upper bound on how far forward `next_after` will search before giving
/// up. Any non-empty field combination fires at least once within this
/// window; an empty intersection of constraints (e.g. conflicting
/// fields) would search forever otherwise.
const MAX_SEARCH_SECONDS: i64 = 366 * 24 * 3600;

impl RegularSchedule {
    #[must_use]
    pub fn every_seconds(seconds: impl IntoIterator<Item = u32>) -> Self {
        Self { seconds: seconds.into_iter().collect(), ..Self::default() }
    }

    fn matches(&self, local: DateTime<FixedOffset>) -> bool {
        field_matches(&self.seconds, local.second())
            && field_matches(&self.minutes, local.minute())
            && field_matches(&self.hours, local.hour())
            && field_matches(&self.weekdays, local.weekday())
    }

    /// Next instant strictly after `after`, interpreted in `tz`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>, tz: FixedOffset) -> DateTime<Utc> {
        let mut candidate = after.with_timezone(&tz) + chrono::Duration::seconds(1);
        let deadline = candidate + chrono::Duration::seconds(MAX_SEARCH_SECONDS);

        while candidate <= deadline {
            if self.matches(candidate) {
                return candidate.with_timezone(&Utc);
            }
            candidate += chrono::Duration::seconds(1);
        }

        panic!("RegularSchedule has no occurrence within {MAX_SEARCH_SECONDS}s of {after}");
    }
}

fn field_matches<T: Eq + std::hash::Hash>(set: &HashSet<T>, value: T) -> bool {
    set.is_empty() || set.contains(&value)
}

/// A recurring task template, declared at scheduler startup and
/// reconciled against backend state (spec §3's "Schedule entry").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleEntry {
    /// Unique within its scheduler name.
    pub key: String,
    pub group: String,
    pub name: String,
    pub data: Vec<u8>,
    pub schedule: Schedule,
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    #[must_use]
    pub fn new(key: impl Into<String>, group: impl Into<String>, name: impl Into<String>, data: Vec<u8>, schedule: Schedule) -> Self {
        Self { key: key.into(), group: group.into(), name: name.into(), data, schedule, last_fired_at: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc_tz() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn every_fifteen_seconds_fires_on_the_quarter_minute() {
        let schedule = RegularSchedule::every_seconds([0, 15, 30, 45]);
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 3).unwrap();
        let next = schedule.next_after(after, utc_tz());
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 15).unwrap());
    }

    #[test]
    fn four_occurrences_per_minute() {
        let schedule = RegularSchedule::every_seconds([0, 15, 30, 45]);
        let mut t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut fires = Vec::new();
        for _ in 0..4 {
            t = schedule.next_after(t, utc_tz());
            fires.push(t);
        }
        assert_eq!(fires[0].timestamp(), Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 15).unwrap().timestamp());
        assert_eq!(fires[3].timestamp(), Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 0).unwrap().timestamp());
    }

    #[test]
    fn hour_and_weekday_constraints_combine() {
        let schedule = RegularSchedule {
            seconds: [0].into_iter().collect(),
            minutes: [0].into_iter().collect(),
            hours: [9].into_iter().collect(),
            weekdays: [Weekday::Mon].into_iter().collect(),
        };
        // 2026-01-01 is a Thursday.
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.next_after(after, utc_tz());
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn empty_fields_mean_any() {
        let schedule = RegularSchedule::default();
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.next_after(after, utc_tz());
        assert_eq!(next, after + chrono::Duration::seconds(1));
    }

    #[test]
    fn nonzero_offset_shifts_local_hour_match() {
        let schedule = RegularSchedule {
            seconds: [0].into_iter().collect(),
            minutes: [0].into_iter().collect(),
            hours: [9].into_iter().collect(),
            weekdays: HashSet::new(),
        };
        let offset = FixedOffset::east_opt(9 * 3600).unwrap(); // UTC+9
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.next_after(after, offset);
        // 09:00 JST == 00:00 UTC, already passed `after`, so next day.
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap());
    }
}
