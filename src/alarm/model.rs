use std::fmt;

use anyhow::{Context, Result};
use chrono::{NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};

use crate::format::{TimeDisplayMode, format_time_of_day};

pub const DEFAULT_SNOOZE_MINUTES: u32 = 5;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SoundType {
    #[default]
    Default,
    Silent,
    Bell,
    Digital,
    Gentle,
    Custom,
}

impl SoundType {
    pub const ALL: [SoundType; 6] = [
        SoundType::Default,
        SoundType::Silent,
        SoundType::Bell,
        SoundType::Digital,
        SoundType::Gentle,
        SoundType::Custom,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SoundType::Default => "DEFAULT",
            SoundType::Silent => "SILENT",
            SoundType::Bell => "BELL",
            SoundType::Digital => "DIGITAL",
            SoundType::Gentle => "GENTLE",
            SoundType::Custom => "CUSTOM",
        }
    }

    /// Unknown names resolve to `Default` so rows written by newer builds
    /// still load.
    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|sound| sound.name() == name)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VibrationPattern {
    None,
    #[default]
    Default,
    Strong,
    Heartbeat,
    Sos,
    Crescendo,
}

impl VibrationPattern {
    pub const ALL: [VibrationPattern; 6] = [
        VibrationPattern::None,
        VibrationPattern::Default,
        VibrationPattern::Strong,
        VibrationPattern::Heartbeat,
        VibrationPattern::Sos,
        VibrationPattern::Crescendo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            VibrationPattern::None => "NONE",
            VibrationPattern::Default => "DEFAULT",
            VibrationPattern::Strong => "STRONG",
            VibrationPattern::Heartbeat => "HEARTBEAT",
            VibrationPattern::Sos => "SOS",
            VibrationPattern::Crescendo => "CRESCENDO",
        }
    }

    pub fn from_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|pattern| pattern.name() == name)
            .unwrap_or_default()
    }

    pub fn waveform_ms(self) -> &'static [u64] {
        match self {
            VibrationPattern::None => &[],
            VibrationPattern::Default => &[0, 500, 200, 500],
            VibrationPattern::Strong => &[0, 800, 200, 800],
            VibrationPattern::Heartbeat => &[0, 200, 100, 200, 400, 200, 100, 200],
            VibrationPattern::Sos => &[
                0, 100, 100, 100, 100, 100, 300, 300, 100, 300, 100, 300, 300, 100, 100, 100, 100,
                100,
            ],
            VibrationPattern::Crescendo => &[0, 100, 200, 200, 200, 400, 200, 600],
        }
    }
}

/// Set of weekdays an alarm repeats on, stored as the legacy bitmask
/// (Sun=1, Mon=2, Tue=4, Wed=8, Thu=16, Fri=32, Sat=64).
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<WeekdayToken>", into = "Vec<WeekdayToken>")]
pub struct RepeatDays(u8);

const WEEK_MONDAY_FIRST: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

impl RepeatDays {
    pub const NONE: RepeatDays = RepeatDays(0);
    pub const EVERY_DAY: RepeatDays = RepeatDays(0x7f);
    pub const WEEKDAYS: RepeatDays = RepeatDays(0b0011_1110);
    pub const WEEKENDS: RepeatDays = RepeatDays(0b0100_0001);

    pub fn from_bits(mask: u8) -> Self {
        RepeatDays(mask & 0x7f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn of(days: &[Weekday]) -> Self {
        days.iter().fold(RepeatDays::NONE, |set, day| set.with(*day))
    }

    pub fn with(self, day: Weekday) -> Self {
        RepeatDays(self.0 | bit(day))
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & bit(day) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn days(self) -> Vec<Weekday> {
        WEEK_MONDAY_FIRST
            .into_iter()
            .filter(|day| self.contains(*day))
            .collect()
    }

    pub fn summary(self) -> String {
        match self {
            RepeatDays::NONE => "Once".to_string(),
            RepeatDays::EVERY_DAY => "Every day".to_string(),
            RepeatDays::WEEKDAYS => "Weekdays".to_string(),
            RepeatDays::WEEKENDS => "Weekends".to_string(),
            _ => self
                .days()
                .into_iter()
                .map(weekday_to_token)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

fn bit(day: Weekday) -> u8 {
    1 << day.num_days_from_sunday()
}

impl From<Vec<WeekdayToken>> for RepeatDays {
    fn from(tokens: Vec<WeekdayToken>) -> Self {
        tokens
            .into_iter()
            .fold(RepeatDays::NONE, |set, token| set.with(token.to_chrono()))
    }
}

impl From<RepeatDays> for Vec<WeekdayToken> {
    fn from(days: RepeatDays) -> Self {
        days.days().into_iter().map(WeekdayToken::from_chrono).collect()
    }
}

impl fmt::Display for RepeatDays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum WeekdayToken {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl WeekdayToken {
    fn to_chrono(self) -> Weekday {
        match self {
            WeekdayToken::Mon => Weekday::Mon,
            WeekdayToken::Tue => Weekday::Tue,
            WeekdayToken::Wed => Weekday::Wed,
            WeekdayToken::Thu => Weekday::Thu,
            WeekdayToken::Fri => Weekday::Fri,
            WeekdayToken::Sat => Weekday::Sat,
            WeekdayToken::Sun => Weekday::Sun,
        }
    }

    fn from_chrono(day: Weekday) -> Self {
        match day {
            Weekday::Mon => WeekdayToken::Mon,
            Weekday::Tue => WeekdayToken::Tue,
            Weekday::Wed => WeekdayToken::Wed,
            Weekday::Thu => WeekdayToken::Thu,
            Weekday::Fri => WeekdayToken::Fri,
            Weekday::Sat => WeekdayToken::Sat,
            Weekday::Sun => WeekdayToken::Sun,
        }
    }
}

fn weekday_to_token(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    #[serde(default)]
    pub id: i64,
    #[serde(with = "time_of_day")]
    pub time: NaiveTime,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub repeat_days: RepeatDays,
    #[serde(default)]
    pub sound: SoundType,
    #[serde(default)]
    pub vibration: VibrationPattern,
    #[serde(default)]
    pub ringtone_uri: Option<String>,
    #[serde(default = "default_snooze_minutes")]
    pub snooze_minutes: u32,
    #[serde(default = "default_enabled")]
    pub snooze_enabled: bool,
    #[serde(default)]
    pub created_at_ms: i64,
}

impl Alarm {
    pub fn new(time: NaiveTime) -> Self {
        Self {
            id: 0,
            time: truncate_to_minute(time),
            enabled: true,
            label: String::new(),
            repeat_days: RepeatDays::NONE,
            sound: SoundType::Default,
            vibration: VibrationPattern::Default,
            ringtone_uri: None,
            snooze_minutes: DEFAULT_SNOOZE_MINUTES,
            snooze_enabled: true,
            created_at_ms: 0,
        }
    }

    pub fn at(hour: u32, minute: u32) -> Result<Self> {
        let time = NaiveTime::from_hms_opt(hour, minute, 0)
            .with_context(|| format!("invalid time of day {hour}:{minute:02}"))?;
        Ok(Self::new(time))
    }

    pub fn repeating_on(mut self, days: RepeatDays) -> Self {
        self.repeat_days = days;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn is_one_shot(&self) -> bool {
        self.repeat_days.is_empty()
    }

    pub fn is_repeating(&self) -> bool {
        !self.is_one_shot()
    }

    pub fn hour(&self) -> u32 {
        self.time.hour()
    }

    pub fn minute(&self) -> u32 {
        self.time.minute()
    }

    pub fn time_text(&self, mode: TimeDisplayMode) -> String {
        format_time_of_day(self.time, mode)
    }

    /// Unsaved enabled copy shifted by the snooze duration, wrapping at midnight.
    pub fn snoozed(&self) -> Alarm {
        let minutes = i64::from(self.snooze_minutes.max(1));
        let (shifted, _) = self
            .time
            .overflowing_add_signed(chrono::Duration::minutes(minutes));
        Alarm {
            time: shifted,
            enabled: true,
            ..self.clone()
        }
    }
}

fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time)
}

fn default_enabled() -> bool {
    true
}

fn default_snooze_minutes() -> u32 {
    DEFAULT_SNOOZE_MINUTES
}

pub fn parse_time_of_day(input: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(input, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(input, "%H:%M:%S"))
        .map(truncate_to_minute)
        .with_context(|| format!("invalid time '{input}', expected HH:MM"))
}

mod time_of_day {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_time_of_day(&raw).map_err(|err| serde::de::Error::custom(format!("{err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_for_sunday_and_saturday_is_65() {
        let days = RepeatDays::of(&[Weekday::Sun, Weekday::Sat]);
        assert_eq!(days.bits(), 1 + 64);

        let decoded = RepeatDays::from_bits(65);
        assert_eq!(decoded.days(), vec![Weekday::Sat, Weekday::Sun]);
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn every_bitmask_survives_decode_then_encode() {
        for mask in 0_u8..128 {
            let decoded = RepeatDays::from_bits(mask);
            let encoded = RepeatDays::of(&decoded.days());
            assert_eq!(encoded.bits(), mask, "mask {mask}");
        }
    }

    #[test]
    fn high_bit_is_ignored() {
        assert_eq!(RepeatDays::from_bits(0x80 | 2).bits(), 2);
    }

    #[test]
    fn repeat_summary_names_common_sets() {
        assert_eq!(RepeatDays::NONE.summary(), "Once");
        assert_eq!(RepeatDays::EVERY_DAY.summary(), "Every day");
        assert_eq!(
            RepeatDays::of(&[
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri
            ])
            .summary(),
            "Weekdays"
        );
        assert_eq!(
            RepeatDays::of(&[Weekday::Sat, Weekday::Sun]).summary(),
            "Weekends"
        );
        assert_eq!(
            RepeatDays::of(&[Weekday::Fri, Weekday::Mon, Weekday::Wed]).summary(),
            "Mon, Wed, Fri"
        );
    }

    #[test]
    fn unknown_sound_and_vibration_names_fall_back_to_default() {
        assert_eq!(SoundType::from_name("BELL"), SoundType::Bell);
        assert_eq!(SoundType::from_name("KAZOO"), SoundType::Default);
        assert_eq!(VibrationPattern::from_name("SOS"), VibrationPattern::Sos);
        assert_eq!(VibrationPattern::from_name(""), VibrationPattern::Default);
        assert!(VibrationPattern::None.waveform_ms().is_empty());
    }

    #[test]
    fn snooze_shifts_time_and_wraps_midnight() {
        let mut alarm = Alarm::at(23, 58).expect("valid");
        alarm.enabled = false;
        let snoozed = alarm.snoozed();
        assert_eq!((snoozed.hour(), snoozed.minute()), (0, 3));
        assert!(snoozed.enabled);
        assert_eq!(alarm.hour(), 23);
    }

    #[test]
    fn alarm_json_uses_short_time_and_weekday_tokens() {
        let alarm = Alarm::at(7, 5)
            .expect("valid")
            .repeating_on(RepeatDays::of(&[Weekday::Mon, Weekday::Fri]))
            .with_label("gym");
        let json = serde_json::to_value(&alarm).expect("serialize");
        assert_eq!(json["time"], "07:05");
        assert_eq!(json["repeat_days"], serde_json::json!(["Mon", "Fri"]));
        assert_eq!(json["vibration"], "DEFAULT");

        let parsed: Alarm =
            serde_json::from_str(r#"{"time":"06:30","repeat_days":["Sun"]}"#).expect("parse");
        assert_eq!(parsed.time, NaiveTime::from_hms_opt(6, 30, 0).expect("time"));
        assert!(parsed.enabled);
        assert_eq!(parsed.snooze_minutes, DEFAULT_SNOOZE_MINUTES);
        assert!(parsed.repeat_days.contains(Weekday::Sun));
    }

    #[test]
    fn rejects_invalid_time_of_day() {
        let err = serde_json::from_str::<Alarm>(r#"{"time":"25:00"}"#).expect_err("bad time");
        assert!(err.to_string().contains("invalid time"));
        assert!(Alarm::at(24, 0).is_err());
    }
}
