use chrono::{DateTime, Datelike, Days, LocalResult, NaiveDateTime, TimeZone};
use serde::Serialize;

use crate::alarm::model::Alarm;

/// Today if the time is still ahead (and today is a repeat day), otherwise
/// tomorrow or the next repeat day within a week.
pub fn next_fire_time(alarm: &Alarm, now: NaiveDateTime) -> NaiveDateTime {
    let today = now.date();
    let candidate = today.and_time(alarm.time);

    if alarm.is_one_shot() {
        return if now < candidate {
            candidate
        } else {
            candidate + chrono::Duration::days(1)
        };
    }

    if alarm.repeat_days.contains(today.weekday()) && now < candidate {
        return candidate;
    }

    for day_offset in 1_u64..=7 {
        let Some(date) = today.checked_add_days(Days::new(day_offset)) else {
            break;
        };
        if alarm.repeat_days.contains(date.weekday()) {
            return date.and_time(alarm.time);
        }
    }

    // Unreachable with a non-empty repeat set; a week after today is always
    // a member.
    candidate + chrono::Duration::days(7)
}

/// Resolves a local wall time to an absolute instant. Ambiguous times (the
/// repeated hour when clocks fall back) take the first instant; times inside
/// a spring-forward gap move forward by the gap so the alarm still rings.
pub fn resolve_trigger_instant<Tz>(timezone: &Tz, naive: NaiveDateTime) -> DateTime<Tz>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    for shift_hours in 0_i64..=2 {
        let shifted = naive + chrono::Duration::hours(shift_hours);
        match timezone.from_local_datetime(&shifted) {
            LocalResult::Single(dt) => return dt,
            LocalResult::Ambiguous(first, _second) => return first,
            LocalResult::None => continue,
        }
    }
    timezone.from_utc_datetime(&naive)
}

pub fn next_trigger_ms<Tz>(alarm: &Alarm, now: &DateTime<Tz>) -> i64
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let naive = next_fire_time(alarm, now.naive_local());
    resolve_trigger_instant(&now.timezone(), naive).timestamp_millis()
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct Upcoming {
    pub next_fire: Option<NaiveDateTime>,
    pub active_count: usize,
}

impl Upcoming {
    /// `1d 2h`, `3h 15m`, `45m`, `soon`, or `None` once the alarm is past.
    pub fn time_until_text(&self, now: NaiveDateTime) -> Option<String> {
        let target = self.next_fire?;
        if target < now {
            return None;
        }
        let remaining = target - now;
        let days = remaining.num_days();
        let hours = remaining.num_hours() % 24;
        let minutes = remaining.num_minutes() % 60;
        let text = match (days, hours, minutes) {
            (d, h, _) if d > 0 && h > 0 => format!("{d}d {h}h"),
            (d, _, _) if d > 0 => format!("{d}d"),
            (_, h, m) if h > 0 && m > 0 => format!("{h}h {m}m"),
            (_, h, _) if h > 0 => format!("{h}h"),
            (_, _, m) if m > 0 => format!("{m}m"),
            _ => "soon".to_string(),
        };
        Some(text)
    }
}

pub fn upcoming(alarms: &[Alarm], now: NaiveDateTime) -> Upcoming {
    let enabled = alarms.iter().filter(|alarm| alarm.enabled);
    let mut summary = Upcoming::default();
    for alarm in enabled {
        summary.active_count += 1;
        let next = next_fire_time(alarm, now);
        summary.next_fire = Some(match summary.next_fire {
            Some(current) => current.min(next),
            None => next,
        });
    }
    summary
}
