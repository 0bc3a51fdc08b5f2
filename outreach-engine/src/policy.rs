//! Sending policy: calendar and time-of-day rules for releasing mail.
//!
//! The policy is pure. Every function takes the instant it reasons about as an
//! argument and all local-time arithmetic happens in the policy time zone.
//!
//! ```text
//! 08:00 08:20 08:40 ... 16:20 16:40 | 17:00 (window end, exclusive) ... 18:00 (grace end)
//! ```

use std::collections::BTreeSet;

use chrono::{
    DateTime, Datelike, LocalResult, NaiveDate, NaiveTime, TimeDelta, TimeZone, Timelike, Utc,
    Weekday,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Upper bound on generated slots (one-minute slots over a full day).
const MAX_DAILY_SLOTS: u32 = 24 * 60;

/// Upper bound on one-minute steps taken to escape a DST gap.
const MAX_GAP_STEPS: u32 = 3 * 60;

/// Raw policy settings as they appear in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySettings {
    pub timezone: String,
    pub days: Vec<String>,
    pub window_from: String,
    pub window_to: String,
    pub grace_to: String,
    pub slot_every_minutes: u32,
    pub daily_cap_per_domain: u32,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            timezone: "Europe/Amsterdam".to_string(),
            days: ["Mon", "Tue", "Wed", "Thu", "Fri"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
            window_from: "08:00".to_string(),
            window_to: "17:00".to_string(),
            grace_to: "18:00".to_string(),
            slot_every_minutes: 20,
            daily_cap_per_domain: 27,
        }
    }
}

/// Immutable, validated sending policy.
#[derive(Debug, Clone)]
pub struct SendingPolicy {
    tz: Tz,
    days: BTreeSet<u32>,
    window_start: NaiveTime,
    window_end: NaiveTime,
    grace_end: NaiveTime,
    slot_minutes: u32,
    daily_cap: u32,
}

impl SendingPolicy {
    /// Validate settings and build a policy.
    pub fn from_settings(settings: &PolicySettings) -> Result<Self> {
        let tz: Tz = settings.timezone.parse().map_err(|e| {
            EngineError::InvalidPolicy(format!("unknown time zone {}: {e}", settings.timezone))
        })?;

        let mut days = BTreeSet::new();
        for name in &settings.days {
            let day: Weekday = name
                .trim()
                .parse()
                .map_err(|_| EngineError::InvalidPolicy(format!("unknown weekday {name}")))?;
            days.insert(day.num_days_from_monday());
        }
        if days.is_empty() {
            return Err(EngineError::InvalidPolicy("no valid sending days".to_string()));
        }

        let window_start = parse_time_of_day(&settings.window_from)?;
        let window_end = parse_time_of_day(&settings.window_to)?;
        let grace_end = parse_time_of_day(&settings.grace_to)?;

        if window_end <= window_start {
            return Err(EngineError::InvalidPolicy(format!(
                "window end {window_end} must be after window start {window_start}"
            )));
        }
        if grace_end < window_end {
            return Err(EngineError::InvalidPolicy(format!(
                "grace end {grace_end} must not be before window end {window_end}"
            )));
        }
        if settings.slot_every_minutes == 0 {
            return Err(EngineError::InvalidPolicy("slot interval must be positive".to_string()));
        }
        let window_minutes = (window_end - window_start).num_minutes();
        if i64::from(settings.slot_every_minutes) > window_minutes {
            return Err(EngineError::InvalidPolicy(format!(
                "slot interval of {} minutes does not fit the {window_minutes} minute window",
                settings.slot_every_minutes
            )));
        }
        if settings.daily_cap_per_domain == 0 {
            return Err(EngineError::InvalidPolicy("daily cap must be positive".to_string()));
        }

        Ok(Self {
            tz,
            days,
            window_start,
            window_end,
            grace_end,
            slot_minutes: settings.slot_every_minutes,
            daily_cap: settings.daily_cap_per_domain,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn window_start(&self) -> NaiveTime {
        self.window_start
    }

    pub fn window_end(&self) -> NaiveTime {
        self.window_end
    }

    pub fn grace_end(&self) -> NaiveTime {
        self.grace_end
    }

    pub fn slot_interval(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.slot_minutes))
    }

    pub fn daily_cap(&self) -> u32 {
        self.daily_cap
    }

    /// Every slot of a sending day, from window start (inclusive) to window
    /// end (exclusive).
    pub fn daily_slots(&self) -> Vec<NaiveTime> {
        let start = i64::from(self.window_start.num_seconds_from_midnight());
        let end = i64::from(self.window_end.num_seconds_from_midnight());
        let step = i64::from(self.slot_minutes) * 60;

        (0..i64::from(MAX_DAILY_SLOTS))
            .map(|i| start + i * step)
            .take_while(|secs| *secs < end)
            .filter_map(|secs| u32::try_from(secs).ok())
            .filter_map(|secs| NaiveTime::from_num_seconds_from_midnight_opt(secs, 0))
            .collect()
    }

    pub fn slots_per_day(&self) -> usize {
        self.daily_slots().len()
    }

    /// Releases a single domain can actually make in one day.
    pub fn effective_daily_cap(&self) -> u32 {
        self.daily_cap.min(self.slots_per_day() as u32)
    }

    pub fn is_valid_day(&self, date: NaiveDate) -> bool {
        self.days.contains(&date.weekday().num_days_from_monday())
    }

    /// True while the local time of day has not passed the grace end.
    pub fn is_within_grace(&self, instant: DateTime<Utc>) -> bool {
        instant.with_timezone(&self.tz).time() <= self.grace_end
    }

    /// True on a valid day at or after window start.
    pub fn is_sending_hours(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.tz);
        self.is_valid_day(local.date_naive()) && local.time() >= self.window_start
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    /// Window start on the given local date.
    pub fn window_open(&self, date: NaiveDate) -> DateTime<Utc> {
        self.resolve_local(date, self.window_start)
    }

    /// First slot of the next valid day after the instant's local date.
    pub fn next_day_opening(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let date = self.next_valid_day_after(self.local_date(instant));
        self.window_open(date)
    }

    /// Earliest slot at or after `instant`.
    ///
    /// Invalid days move forward to the next valid day at window start, times
    /// before the window snap to window start, times at or past window end move
    /// to the next valid day, and everything else rounds up to the slot grid.
    /// Applying it to its own output returns the same instant.
    pub fn next_valid_slot(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let local = instant.with_timezone(&self.tz);
        let mut date = local.date_naive();
        let time = local.time();

        let slot = if !self.is_valid_day(date) {
            date = self.next_valid_day_after(date);
            self.window_start
        } else if time < self.window_start {
            self.window_start
        } else if time >= self.window_end {
            date = self.next_valid_day_after(date);
            self.window_start
        } else {
            match self.round_up_to_slot(time) {
                Some(slot) => slot,
                None => {
                    date = self.next_valid_day_after(date);
                    self.window_start
                }
            }
        };

        self.resolve_local(date, slot)
    }

    /// Next valid day strictly after `date`.
    pub fn next_valid_day_after(&self, date: NaiveDate) -> NaiveDate {
        let mut day = date;
        for _ in 0..7 {
            day = day.succ_opt().unwrap_or(NaiveDate::MAX);
            if self.is_valid_day(day) {
                break;
            }
        }
        day
    }

    /// Round a time inside the window up to the slot grid, or `None` when the
    /// next grid point falls on or past window end.
    fn round_up_to_slot(&self, time: NaiveTime) -> Option<NaiveTime> {
        let start = i64::from(self.window_start.num_seconds_from_midnight());
        let end = i64::from(self.window_end.num_seconds_from_midnight());
        let step = i64::from(self.slot_minutes) * 60;

        let mut elapsed = i64::from(time.num_seconds_from_midnight()) - start;
        if time.nanosecond() > 0 {
            elapsed += 1;
        }

        let slots = (elapsed + step - 1) / step;
        let secs = start + slots * step;
        if secs >= end {
            return None;
        }
        NaiveTime::from_num_seconds_from_midnight_opt(secs as u32, 0)
    }

    /// Map a local wall-clock time to an instant. Ambiguous times take the
    /// earliest instant; times inside a DST gap move forward past the gap.
    fn resolve_local(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let mut naive = date.and_time(time);
        for _ in 0..MAX_GAP_STEPS {
            match self.tz.from_local_datetime(&naive) {
                LocalResult::Single(dt) => return dt.with_timezone(&Utc),
                LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
                LocalResult::None => naive += TimeDelta::minutes(1),
            }
        }
        Utc.from_utc_datetime(&naive)
    }
}

impl Default for SendingPolicy {
    fn default() -> Self {
        Self {
            tz: chrono_tz::Europe::Amsterdam,
            days: (0..5).collect(),
            window_start: NaiveTime::MIN + TimeDelta::hours(8),
            window_end: NaiveTime::MIN + TimeDelta::hours(17),
            grace_end: NaiveTime::MIN + TimeDelta::hours(18),
            slot_minutes: 20,
            daily_cap: 27,
        }
    }
}

fn parse_time_of_day(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| EngineError::InvalidPolicy(format!("bad time of day {raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Amsterdam;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Amsterdam
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn local(instant: DateTime<Utc>) -> chrono::NaiveDateTime {
        instant.with_timezone(&Amsterdam).naive_local()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_default_settings_build_default_policy() {
        let built = SendingPolicy::from_settings(&PolicySettings::default()).unwrap();
        let default = SendingPolicy::default();
        assert_eq!(built.timezone(), default.timezone());
        assert_eq!(built.days, default.days);
        assert_eq!(built.window_start(), hm(8, 0));
        assert_eq!(built.window_end(), hm(17, 0));
        assert_eq!(built.grace_end(), hm(18, 0));
        assert_eq!(built.slot_interval(), TimeDelta::minutes(20));
        assert_eq!(built.daily_cap(), 27);
    }

    #[test]
    fn test_daily_slots_generation() {
        let slots = SendingPolicy::default().daily_slots();
        assert_eq!(slots.len(), 27);
        assert_eq!(slots[0], hm(8, 0));
        assert_eq!(slots[26], hm(16, 40));
        for pair in slots.windows(2) {
            assert_eq!(pair[1] - pair[0], TimeDelta::minutes(20));
        }
    }

    #[test]
    fn test_partial_final_slot_is_dropped() {
        let settings = PolicySettings {
            window_to: "17:10".to_string(),
            ..PolicySettings::default()
        };
        let policy = SendingPolicy::from_settings(&settings).unwrap();
        let slots = policy.daily_slots();
        assert_eq!(slots.len(), 28);
        assert_eq!(*slots.last().unwrap(), hm(17, 0));
        assert!(slots.iter().all(|s| *s < hm(17, 10)));
    }

    #[test]
    fn test_valid_sending_days() {
        let policy = SendingPolicy::default();
        assert!(policy.is_valid_day(NaiveDate::from_ymd_opt(2025, 9, 29).unwrap()));
        assert!(policy.is_valid_day(NaiveDate::from_ymd_opt(2025, 10, 3).unwrap()));
        assert!(!policy.is_valid_day(NaiveDate::from_ymd_opt(2025, 10, 4).unwrap()));
        assert!(!policy.is_valid_day(NaiveDate::from_ymd_opt(2025, 10, 5).unwrap()));
    }

    #[test]
    fn test_grace_period_check() {
        let policy = SendingPolicy::default();
        assert!(policy.is_within_grace(at(2025, 9, 26, 17, 30)));
        assert!(policy.is_within_grace(at(2025, 9, 26, 18, 0)));
        assert!(!policy.is_within_grace(at(2025, 9, 26, 18, 1)));
    }

    #[test]
    fn test_grace_uses_policy_time_zone() {
        let policy = SendingPolicy::default();
        // 16:30 UTC is 18:30 in Amsterdam during summer time.
        let instant = Utc.with_ymd_and_hms(2025, 9, 26, 16, 30, 0).unwrap();
        assert!(!policy.is_within_grace(instant));
    }

    #[test]
    fn test_next_valid_slot_weekend_skip() {
        let policy = SendingPolicy::default();
        let slot = policy.next_valid_slot(at(2025, 10, 4, 10, 0));
        assert_eq!(local(slot), at_local(2025, 10, 6, 8, 0));
    }

    #[test]
    fn test_next_valid_slot_alignment() {
        let policy = SendingPolicy::default();
        assert_eq!(local(policy.next_valid_slot(at(2025, 9, 29, 10, 15))), at_local(2025, 9, 29, 10, 20));
        assert_eq!(local(policy.next_valid_slot(at(2025, 9, 29, 10, 45))), at_local(2025, 9, 29, 11, 0));
        assert_eq!(local(policy.next_valid_slot(at(2025, 9, 29, 10, 40))), at_local(2025, 9, 29, 10, 40));
    }

    #[test]
    fn test_next_valid_slot_never_rounds_down() {
        let policy = SendingPolicy::default();
        let instant = at(2025, 9, 29, 10, 40) + TimeDelta::seconds(1);
        assert_eq!(local(policy.next_valid_slot(instant)), at_local(2025, 9, 29, 11, 0));
    }

    #[test]
    fn test_next_valid_slot_before_window() {
        let policy = SendingPolicy::default();
        assert_eq!(local(policy.next_valid_slot(at(2025, 9, 30, 6, 5))), at_local(2025, 9, 30, 8, 0));
    }

    #[test]
    fn test_next_valid_slot_after_window() {
        let policy = SendingPolicy::default();
        assert_eq!(local(policy.next_valid_slot(at(2025, 9, 29, 17, 30))), at_local(2025, 9, 30, 8, 0));
        assert_eq!(local(policy.next_valid_slot(at(2025, 10, 3, 17, 0))), at_local(2025, 10, 6, 8, 0));
    }

    #[test]
    fn test_friday_after_last_slot_rolls_to_monday() {
        let policy = SendingPolicy::default();
        assert_eq!(local(policy.next_valid_slot(at(2025, 10, 3, 16, 50))), at_local(2025, 10, 6, 8, 0));
    }

    #[test]
    fn test_next_valid_slot_is_idempotent() {
        let policy = SendingPolicy::default();
        let mut instant = at(2025, 9, 27, 0, 0);
        // Walk a week in 7-minute steps, crossing nights and a weekend.
        for _ in 0..(7 * 24 * 60 / 7) {
            let once = policy.next_valid_slot(instant);
            assert_eq!(policy.next_valid_slot(once), once);
            assert!(once >= instant);

            let local = once.with_timezone(&Amsterdam);
            assert!(policy.is_valid_day(local.date_naive()));
            assert!(local.time() >= policy.window_start());
            assert!(local.time() < policy.window_end());
            assert!(policy.daily_slots().contains(&local.time()));

            instant += TimeDelta::minutes(7);
        }
    }

    #[test]
    fn test_next_day_opening_skips_weekend() {
        let policy = SendingPolicy::default();
        let opening = policy.next_day_opening(at(2025, 10, 3, 18, 30));
        assert_eq!(local(opening), at_local(2025, 10, 6, 8, 0));
    }

    #[test]
    fn test_sending_hours() {
        let policy = SendingPolicy::default();
        assert!(policy.is_sending_hours(at(2025, 9, 29, 8, 0)));
        assert!(policy.is_sending_hours(at(2025, 9, 29, 17, 30)));
        assert!(!policy.is_sending_hours(at(2025, 9, 29, 7, 59)));
        assert!(!policy.is_sending_hours(at(2025, 10, 4, 9, 0)));
    }

    #[test]
    fn test_effective_daily_cap() {
        let settings = PolicySettings {
            daily_cap_per_domain: 100,
            ..PolicySettings::default()
        };
        let policy = SendingPolicy::from_settings(&settings).unwrap();
        assert_eq!(policy.effective_daily_cap(), 27);
        assert_eq!(SendingPolicy::default().effective_daily_cap(), 27);
    }

    #[test]
    fn test_rejects_inverted_window() {
        let settings = PolicySettings {
            window_from: "17:00".to_string(),
            window_to: "08:00".to_string(),
            ..PolicySettings::default()
        };
        assert!(matches!(
            SendingPolicy::from_settings(&settings),
            Err(EngineError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_zone_and_day() {
        let zone = PolicySettings {
            timezone: "Mars/Olympus".to_string(),
            ..PolicySettings::default()
        };
        assert!(SendingPolicy::from_settings(&zone).is_err());

        let day = PolicySettings {
            days: vec!["Mon".to_string(), "Funday".to_string()],
            ..PolicySettings::default()
        };
        assert!(SendingPolicy::from_settings(&day).is_err());
    }

    #[test]
    fn test_rejects_zero_slot_interval() {
        let settings = PolicySettings {
            slot_every_minutes: 0,
            ..PolicySettings::default()
        };
        assert!(SendingPolicy::from_settings(&settings).is_err());
    }

    #[test]
    fn test_rejects_slot_interval_longer_than_window() {
        let settings = PolicySettings {
            slot_every_minutes: 80_000_000,
            ..PolicySettings::default()
        };
        assert!(matches!(
            SendingPolicy::from_settings(&settings),
            Err(EngineError::InvalidPolicy(_))
        ));

        let whole_window = PolicySettings {
            slot_every_minutes: 9 * 60,
            ..PolicySettings::default()
        };
        let policy = SendingPolicy::from_settings(&whole_window).unwrap();
        assert_eq!(policy.daily_slots(), [hm(8, 0)]);
        assert_eq!(policy.effective_daily_cap(), 1);
    }

    fn every_day(window_from: &str, window_to: &str) -> SendingPolicy {
        let settings = PolicySettings {
            days: ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
            window_from: window_from.to_string(),
            window_to: window_to.to_string(),
            grace_to: "05:00".to_string(),
            ..PolicySettings::default()
        };
        SendingPolicy::from_settings(&settings).unwrap()
    }

    #[test]
    fn test_spring_forward_gap_moves_to_first_valid_instant() {
        // 02:00-03:00 does not exist in Amsterdam on 2026-03-29.
        let policy = every_day("02:00", "04:00");
        let before = Utc.with_ymd_and_hms(2026, 3, 29, 0, 30, 0).unwrap();
        let slot = policy.next_valid_slot(before);
        assert_eq!(slot, Utc.with_ymd_and_hms(2026, 3, 29, 1, 0, 0).unwrap());
        assert_eq!(local(slot), at_local(2026, 3, 29, 3, 0));

        let mut instant = Utc.with_ymd_and_hms(2026, 3, 28, 23, 0, 0).unwrap();
        while instant < Utc.with_ymd_and_hms(2026, 3, 29, 3, 0, 0).unwrap() {
            let once = policy.next_valid_slot(instant);
            assert_eq!(policy.next_valid_slot(once), once);
            assert!(once >= instant);
            instant += TimeDelta::minutes(7);
        }
    }

    #[test]
    fn test_fall_back_ambiguity_takes_earliest() {
        // 02:00-03:00 happens twice in Amsterdam on 2025-10-26.
        let policy = every_day("02:00", "04:00");
        let before = Utc.with_ymd_and_hms(2025, 10, 25, 23, 0, 0).unwrap();
        let slot = policy.next_valid_slot(before);
        // 02:00 CEST, not 02:00 CET.
        assert_eq!(slot, Utc.with_ymd_and_hms(2025, 10, 26, 0, 0, 0).unwrap());
        assert_eq!(policy.next_valid_slot(slot), slot);
        assert_eq!(
            policy.window_open(NaiveDate::from_ymd_opt(2025, 10, 26).unwrap()),
            slot
        );
    }

    fn at_local(y: i32, m: u32, d: u32, h: u32, min: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }
}
