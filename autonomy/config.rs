use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    approval::HdmLevel,
    state::{CycleKind, EngineError},
};

/// When a cycle kind fires, in wall-clock terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ScheduleSpec {
    /// Hour of day, 0..=23.
    pub hour: u32,
    /// Minute of hour, 0..=59.
    pub minute: u32,
    /// Day of week for weekly cycles, 0 = Sunday .. 6 = Saturday.
    #[serde(default)]
    pub day_of_week: Option<u32>,
    /// Day of month for monthly cycles, 1..=31; clamped to the last valid
    /// day of shorter months.
    #[serde(default)]
    pub day_of_month: Option<u32>,
}

impl ScheduleSpec {
    /// Daily default: 02:00.
    #[must_use]
    pub const fn daily_default() -> Self {
        Self {
            hour: 2,
            minute: 0,
            day_of_week: None,
            day_of_month: None,
        }
    }

    /// Weekly default: Sunday 03:00.
    #[must_use]
    pub const fn weekly_default() -> Self {
        Self {
            hour: 3,
            minute: 0,
            day_of_week: Some(0),
            day_of_month: None,
        }
    }

    /// Monthly default: day 1 at 04:00.
    #[must_use]
    pub const fn monthly_default() -> Self {
        Self {
            hour: 4,
            minute: 0,
            day_of_week: None,
            day_of_month: Some(1),
        }
    }

    /// Rejects out-of-range fields for the given kind.
    pub fn validate(&self, kind: CycleKind) -> Result<(), EngineError> {
        if self.hour > 23 || self.minute > 59 {
            return Err(EngineError::Configuration(format!(
                "{kind} schedule time {:02}:{:02} out of range",
                self.hour, self.minute
            )));
        }
        if let Some(dow) = self.day_of_week {
            if dow > 6 {
                return Err(EngineError::Configuration(format!(
                    "{kind} day_of_week {dow} out of range 0..=6"
                )));
            }
        }
        if let Some(dom) = self.day_of_month {
            if !(1..=31).contains(&dom) {
                return Err(EngineError::Configuration(format!(
                    "{kind} day_of_month {dom} out of range 1..=31"
                )));
            }
        }
        Ok(())
    }
}

/// Per-kind schedule overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Schedules {
    /// Daily battery schedule.
    #[serde(default = "ScheduleSpec::daily_default")]
    pub daily: ScheduleSpec,
    /// Weekly battery schedule.
    #[serde(default = "ScheduleSpec::weekly_default")]
    pub weekly: ScheduleSpec,
    /// Monthly battery schedule.
    #[serde(default = "ScheduleSpec::monthly_default")]
    pub monthly: ScheduleSpec,
}

impl Default for Schedules {
    fn default() -> Self {
        Self {
            daily: ScheduleSpec::daily_default(),
            weekly: ScheduleSpec::weekly_default(),
            monthly: ScheduleSpec::monthly_default(),
        }
    }
}

impl Schedules {
    /// Schedule for a scheduled kind; Manual has none and maps to daily.
    #[must_use]
    pub const fn get(&self, kind: CycleKind) -> ScheduleSpec {
        match kind {
            CycleKind::Daily | CycleKind::Manual => self.daily,
            CycleKind::Weekly => self.weekly,
            CycleKind::Monthly => self.monthly,
        }
    }

    /// Validates every schedule.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.daily.validate(CycleKind::Daily)?;
        self.weekly.validate(CycleKind::Weekly)?;
        self.monthly.validate(CycleKind::Monthly)?;
        Ok(())
    }
}

fn default_hdm_level() -> u8 {
    HdmLevel::default().index()
}

fn default_max_history() -> usize {
    100
}

fn default_max_event_history() -> usize {
    100
}

fn default_task_timeout_secs() -> u64 {
    60
}

fn default_task_retry_attempts() -> u32 {
    2
}

fn default_task_retry_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
struct EngineOptionsSerde {
    root_dir: PathBuf,
    #[serde(default = "default_hdm_level")]
    hdm_level: u8,
    #[serde(default)]
    schedules: Schedules,
    #[serde(default = "default_max_history")]
    max_history: usize,
    #[serde(default = "default_max_event_history")]
    max_event_history: usize,
    #[serde(default = "default_task_timeout_secs")]
    task_timeout_secs: u64,
    #[serde(default = "default_task_retry_attempts")]
    task_retry_attempts: u32,
    #[serde(default = "default_task_retry_delay_ms")]
    task_retry_delay_ms: u64,
}

/// Engine construction options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Base directory for persistence (`<root>/.eaos/autonomy`) and plugins
    /// (`<root>/plugins`).
    pub root_dir: PathBuf,
    /// Initial approval ceiling.
    pub hdm_level: HdmLevel,
    /// Per-kind schedules.
    pub schedules: Schedules,
    /// Cycle history cap.
    pub max_history: usize,
    /// Event bus history cap.
    pub max_event_history: usize,
    /// Per-task deadline.
    pub task_timeout: Duration,
    /// Attempts per task; retries apply only to timeouts.
    pub task_retry_attempts: u32,
    /// Delay before a retry attempt.
    pub task_retry_delay: Duration,
}

impl EngineOptions {
    /// Creates options with defaults rooted at the given directory.
    #[must_use]
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            hdm_level: HdmLevel::default(),
            schedules: Schedules::default(),
            max_history: default_max_history(),
            max_event_history: default_max_event_history(),
            task_timeout: Duration::from_secs(default_task_timeout_secs()),
            task_retry_attempts: default_task_retry_attempts(),
            task_retry_delay: Duration::from_millis(default_task_retry_delay_ms()),
        }
    }

    /// Overrides the approval ceiling.
    #[must_use]
    pub fn with_hdm_level(mut self, level: HdmLevel) -> Self {
        self.hdm_level = level;
        self
    }

    /// Overrides the schedules.
    #[must_use]
    pub fn with_schedules(mut self, schedules: Schedules) -> Self {
        self.schedules = schedules;
        self
    }

    /// Overrides the per-task deadline.
    #[must_use]
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_task_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.task_retry_attempts = attempts;
        self.task_retry_delay = delay;
        self
    }

    /// Loads options from a TOML document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let parsed: EngineOptionsSerde = toml::from_str(&raw)
            .map_err(|err| EngineError::Configuration(format!("{}: {err}", path.display())))?;
        let options = Self {
            root_dir: parsed.root_dir,
            hdm_level: HdmLevel::from_index(parsed.hdm_level).ok_or_else(|| {
                EngineError::Configuration(format!(
                    "hdm_level {} out of range 0..=4",
                    parsed.hdm_level
                ))
            })?,
            schedules: parsed.schedules,
            max_history: parsed.max_history,
            max_event_history: parsed.max_event_history,
            task_timeout: Duration::from_secs(parsed.task_timeout_secs),
            task_retry_attempts: parsed.task_retry_attempts,
            task_retry_delay: Duration::from_millis(parsed.task_retry_delay_ms),
        };
        options.validate()?;
        Ok(options)
    }

    /// Rejects incoherent options.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(EngineError::Configuration("root_dir must not be empty".into()));
        }
        if self.max_history == 0 {
            return Err(EngineError::Configuration("max_history must be positive".into()));
        }
        if self.task_retry_attempts == 0 {
            return Err(EngineError::Configuration(
                "task_retry_attempts must be positive".into(),
            ));
        }
        self.schedules.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let options = EngineOptions::new("/tmp/eaos");
        assert_eq!(options.hdm_level, HdmLevel::Elevated);
        assert_eq!(options.schedules.daily.hour, 2);
        assert_eq!(options.schedules.weekly.day_of_week, Some(0));
        assert_eq!(options.schedules.monthly.day_of_month, Some(1));
        assert_eq!(options.task_timeout, Duration::from_secs(60));
        assert_eq!(options.task_retry_attempts, 2);
        options.validate().unwrap();
    }

    #[test]
    fn load_applies_overrides_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(
            &path,
            r#"
root_dir = "/srv/ops"
hdm_level = 1
task_timeout_secs = 30

[schedules.daily]
hour = 5
minute = 30
"#,
        )
        .unwrap();

        let options = EngineOptions::load(&path).unwrap();
        assert_eq!(options.hdm_level, HdmLevel::Routine);
        assert_eq!(options.schedules.daily.hour, 5);
        assert_eq!(options.schedules.weekly.hour, 3);
        assert_eq!(options.task_timeout, Duration::from_secs(30));
    }

    #[test]
    fn load_rejects_bad_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(
            &path,
            r#"
root_dir = "/srv/ops"

[schedules.monthly]
hour = 4
minute = 0
day_of_month = 0
"#,
        )
        .unwrap();
        assert!(matches!(
            EngineOptions::load(&path),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn load_rejects_out_of_range_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        fs::write(&path, "root_dir = \"/srv/ops\"\nhdm_level = 9\n").unwrap();
        assert!(matches!(
            EngineOptions::load(&path),
            Err(EngineError::Configuration(_))
        ));
    }
}
