use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};

use crate::{
    config::ScheduleSpec,
    state::{CycleKind, EngineError},
};

/// Computes the next fire instant for a cycle kind, strictly after `now`.
///
/// An instant exactly equal to `now` is considered already fired and rolls
/// to the next period. Non-existent monthly days (e.g. day 30 in February)
/// clamp to the last valid day of the target month.
pub fn next_fire(
    kind: CycleKind,
    spec: &ScheduleSpec,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, EngineError> {
    let time = NaiveTime::from_hms_opt(spec.hour, spec.minute, 0).ok_or_else(|| {
        EngineError::Configuration(format!(
            "{kind} schedule time {:02}:{:02} out of range",
            spec.hour, spec.minute
        ))
    })?;

    match kind {
        CycleKind::Daily | CycleKind::Manual => {
            let mut candidate = now.date_naive().and_time(time).and_utc();
            if candidate <= now {
                candidate += Duration::days(1);
            }
            Ok(candidate)
        }
        CycleKind::Weekly => {
            let target = spec.day_of_week.unwrap_or(0);
            if target > 6 {
                return Err(EngineError::Configuration(format!(
                    "weekly day_of_week {target} out of range 0..=6"
                )));
            }
            let today = now.weekday().num_days_from_sunday();
            let ahead = (target + 7 - today) % 7;
            let date = now.date_naive() + Duration::days(i64::from(ahead));
            let mut candidate = date.and_time(time).and_utc();
            if candidate <= now {
                candidate += Duration::days(7);
            }
            Ok(candidate)
        }
        CycleKind::Monthly => {
            let day = spec.day_of_month.unwrap_or(1);
            if !(1..=31).contains(&day) {
                return Err(EngineError::Configuration(format!(
                    "monthly day_of_month {day} out of range 1..=31"
                )));
            }
            let date = clamped_day(now.year(), now.month(), day)?;
            let candidate = date.and_time(time).and_utc();
            if candidate > now {
                return Ok(candidate);
            }
            let (year, month) = if now.month() == 12 {
                (now.year() + 1, 1)
            } else {
                (now.year(), now.month() + 1)
            };
            let date = clamped_day(year, month, day)?;
            Ok(date.and_time(time).and_utc())
        }
    }
}

/// The requested day within a month, clamped to the month's last valid day.
fn clamped_day(year: i32, month: u32, day: u32) -> Result<NaiveDate, EngineError> {
    let last = days_in_month(year, month)?;
    NaiveDate::from_ymd_opt(year, month, day.min(last)).ok_or_else(|| {
        EngineError::Configuration(format!("invalid calendar date {year}-{month:02}-{day:02}"))
    })
}

fn days_in_month(year: i32, month: u32) -> Result<u32, EngineError> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|date| date.pred_opt())
        .map(|date| date.day())
        .ok_or_else(|| {
            EngineError::Configuration(format!("invalid calendar month {year}-{month:02}"))
        })
}
