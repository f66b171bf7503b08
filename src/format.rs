use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum TimeDisplayMode {
    #[default]
    #[serde(rename = "24h")]
    Hour24,
    #[serde(rename = "12h")]
    Hour12,
}

pub fn format_time_of_day(time: NaiveTime, mode: TimeDisplayMode) -> String {
    match mode {
        TimeDisplayMode::Hour24 => format!("{:02}:{:02}", time.hour(), time.minute()),
        TimeDisplayMode::Hour12 => {
            let (is_pm, hour12) = time.hour12();
            let meridiem = if is_pm { "PM" } else { "AM" };
            format!("{hour12}:{:02} {meridiem}", time.minute())
        }
    }
}

pub fn format_next_fire(next: Option<NaiveDateTime>, mode: TimeDisplayMode) -> String {
    match next {
        Some(dt) => format!(
            "{:04}-{:02}-{:02} {} ({})",
            dt.year(),
            dt.month(),
            dt.day(),
            format_time_of_day(dt.time(), mode),
            dt.weekday()
        ),
        None => "-".to_string(),
    }
}

/// `MM:SS`, or `HH:MM:SS` once the value reaches an hour. Partial seconds
/// round up so a countdown shows `00:01` until it actually finishes.
pub fn format_countdown(ms: u64) -> String {
    let total_secs = ms.div_ceil(1_000);
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

pub fn format_stopwatch(ms: u64) -> String {
    let centis = (ms % 1_000) / 10;
    let total_secs = ms / 1_000;
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}.{centis:02}")
    } else {
        format!("{minutes:02}:{seconds:02}.{centis:02}")
    }
}

pub fn format_duration_words(secs: u64) -> String {
    let hours = secs / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    let parts: Vec<String> = [(hours, "h"), (minutes, "m"), (seconds, "s")]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();
    if parts.is_empty() {
        "0s".to_string()
    } else {
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    #[test]
    fn time_of_day_in_both_modes() {
        let time = NaiveTime::from_hms_opt(7, 5, 0).expect("time");
        assert_eq!(format_time_of_day(time, TimeDisplayMode::Hour24), "07:05");
        assert_eq!(format_time_of_day(time, TimeDisplayMode::Hour12), "7:05 AM");

        let evening = NaiveTime::from_hms_opt(19, 30, 0).expect("time");
        assert_eq!(format_time_of_day(evening, TimeDisplayMode::Hour12), "7:30 PM");
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).expect("time");
        assert_eq!(format_time_of_day(midnight, TimeDisplayMode::Hour12), "12:00 AM");
    }

    #[test]
    fn next_fire_includes_date_and_weekday() {
        let dt = NaiveDate::from_ymd_opt(2026, 1, 14)
            .expect("date")
            .and_hms_opt(9, 0, 0)
            .expect("time");
        assert_eq!(
            format_next_fire(Some(dt), TimeDisplayMode::Hour24),
            "2026-01-14 09:00 (Wed)"
        );
        assert_eq!(format_next_fire(None, TimeDisplayMode::Hour12), "-");
    }

    #[test]
    fn countdown_switches_to_hours() {
        assert_eq!(format_countdown(0), "00:00");
        assert_eq!(format_countdown(210_000), "03:30");
        assert_eq!(format_countdown(999), "00:01");
        assert_eq!(format_countdown(3_723_000), "01:02:03");
    }

    #[test]
    fn stopwatch_keeps_centiseconds() {
        assert_eq!(format_stopwatch(0), "00:00.00");
        assert_eq!(format_stopwatch(61_237), "01:01.23");
        assert_eq!(format_stopwatch(3_600_010), "01:00:00.01");
    }

    #[test]
    fn duration_words_skip_zero_units() {
        assert_eq!(format_duration_words(5_400), "1h 30m");
        assert_eq!(format_duration_words(45), "45s");
        assert_eq!(format_duration_words(0), "0s");
        assert_eq!(format_duration_words(3_601), "1h 1s");
    }
}
