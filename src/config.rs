use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::alarm::scheduling::RetryPolicy;
use crate::format::TimeDisplayMode;
use crate::timer::service::TickConfig;

pub const SETTINGS_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    #[default]
    System,
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorTheme {
    #[default]
    Default,
    Ocean,
    Forest,
    Sunset,
    Cherry,
    Lavender,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    System,
    Ko,
    En,
    Ja,
    Zh,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct AppSettings {
    pub theme_mode: ThemeMode,
    pub color_theme: ColorTheme,
    pub language: Language,
    pub time_format: TimeDisplayMode,
    pub timer_tick_ms: u64,
    pub stopwatch_tick_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            theme_mode: ThemeMode::default(),
            color_theme: ColorTheme::default(),
            language: Language::default(),
            time_format: TimeDisplayMode::default(),
            timer_tick_ms: default_timer_tick_ms(),
            stopwatch_tick_ms: default_stopwatch_tick_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl AppSettings {
    pub fn tick_config(&self) -> TickConfig {
        TickConfig {
            timer_tick: Duration::from_millis(self.timer_tick_ms),
            stopwatch_tick: Duration::from_millis(self.stopwatch_tick_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

pub fn load_settings(path: &Path) -> Result<AppSettings> {
    if !path.exists() {
        return Ok(AppSettings::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read settings file {}", path.display()))?;
    parse_settings_text(&content)
}

pub fn parse_settings_text(content: &str) -> Result<AppSettings> {
    let raw = serde_json::from_str::<SettingsFile>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow::anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;

    if raw.version != SETTINGS_VERSION {
        bail!(
            "unsupported settings version {}; expected version {SETTINGS_VERSION}",
            raw.version
        );
    }
    if raw.timer_tick_ms == 0 {
        bail!("timer_tick_ms must be greater than zero");
    }
    if raw.stopwatch_tick_ms == 0 {
        bail!("stopwatch_tick_ms must be greater than zero");
    }
    if raw.retry_attempts == 0 {
        bail!("retry_attempts must be at least 1");
    }

    Ok(AppSettings {
        theme_mode: raw.theme_mode,
        color_theme: raw.color_theme,
        language: raw.language,
        time_format: raw.time_format,
        timer_tick_ms: raw.timer_tick_ms,
        stopwatch_tick_ms: raw.stopwatch_tick_ms,
        retry_attempts: raw.retry_attempts,
        retry_delay_ms: raw.retry_delay_ms,
    })
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<()> {
    let payload = SettingsFileRef {
        version: SETTINGS_VERSION,
        settings,
    };
    let text = serde_json::to_string_pretty(&payload)?;
    fs::write(path, format!("{text}\n"))
        .with_context(|| format!("unable to write settings file {}", path.display()))?;
    Ok(())
}

#[derive(Serialize)]
struct SettingsFileRef<'a> {
    version: u32,
    #[serde(flatten)]
    settings: &'a AppSettings,
}

#[derive(Debug, Deserialize)]
struct SettingsFile {
    version: u32,
    #[serde(default)]
    theme_mode: ThemeMode,
    #[serde(default)]
    color_theme: ColorTheme,
    #[serde(default)]
    language: Language,
    #[serde(default)]
    time_format: TimeDisplayMode,
    #[serde(default = "default_timer_tick_ms")]
    timer_tick_ms: u64,
    #[serde(default = "default_stopwatch_tick_ms")]
    stopwatch_tick_ms: u64,
    #[serde(default = "default_retry_attempts")]
    retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    retry_delay_ms: u64,
}

fn default_timer_tick_ms() -> u64 {
    1_000
}

fn default_stopwatch_tick_ms() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}
