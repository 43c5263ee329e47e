//! Fire-time computation for scheduled and cron modes

use crate::error::{LinkError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc};

/// Next occurrence of `hour:minute`, rolling to tomorrow when already past
pub fn next_daily(now: DateTime<Utc>, hour: u32, minute: u32) -> Result<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| LinkError::InvalidConfig(format!("invalid schedule {hour:02}:{minute:02}")))?;
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        Ok(today)
    } else {
        Ok(today + Duration::days(1))
    }
}

/// One parsed field of a cron expression
#[derive(Debug, Clone)]
struct CronField {
    allowed: Vec<u32>,
}

impl CronField {
    fn parse(spec: &str, min: u32, max: u32) -> Result<Self> {
        let mut allowed = Vec::new();
        for part in spec.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| invalid(spec))?;
                    if step == 0 {
                        return Err(invalid(spec));
                    }
                    (range, step)
                }
                None => (part, 1),
            };
            let (lo, hi) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                (
                    a.parse().map_err(|_| invalid(spec))?,
                    b.parse().map_err(|_| invalid(spec))?,
                )
            } else {
                let v: u32 = range.parse().map_err(|_| invalid(spec))?;
                (v, v)
            };
            if lo < min || hi > max || lo > hi {
                return Err(invalid(spec));
            }
            allowed.extend((lo..=hi).step_by(step as usize));
        }
        allowed.sort_unstable();
        allowed.dedup();
        Ok(CronField { allowed })
    }

    fn matches(&self, value: u32) -> bool {
        self.allowed.binary_search(&value).is_ok()
    }
}

fn invalid(spec: &str) -> LinkError {
    LinkError::InvalidConfig(format!("invalid cron field '{spec}'"))
}

/// Five-field cron expression: minute hour day-of-month month day-of-week
///
/// Supports `*`, values, lists, ranges, and steps. Day-of-week 0 and 7
/// both mean Sunday.
#[derive(Debug, Clone)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(LinkError::InvalidConfig(format!(
                "cron expression needs 5 fields, got {}: '{expr}'",
                fields.len()
            )));
        }
        let mut weekday = CronField::parse(fields[4], 0, 7)?;
        // 7 is an alias for Sunday
        if weekday.matches(7) && !weekday.matches(0) {
            weekday.allowed.insert(0, 0);
        }
        Ok(CronExpr {
            minute: CronField::parse(fields[0], 0, 59)?,
            hour: CronField::parse(fields[1], 0, 23)?,
            day: CronField::parse(fields[2], 1, 31)?,
            month: CronField::parse(fields[3], 1, 12)?,
            weekday,
        })
    }

    fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day.matches(t.day())
            && self.month.matches(t.month())
            && self.weekday.matches(t.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `now`
    ///
    /// Walks minute by minute with a four-year bound, which covers every
    /// satisfiable expression including Feb 29.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(now) + Duration::minutes(1);
        let limit = now + Duration::days(366 * 4);
        while t < limit {
            if self.matches(t) {
                return Some(t);
            }
            t += Duration::minutes(1);
        }
        None
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t - Duration::seconds(t.second() as i64)
        - Duration::nanoseconds(t.timestamp_subsec_nanos() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_daily_later_today() {
        let now = at(2024, 1, 1, 10, 15);
        assert_eq!(next_daily(now, 23, 30).unwrap(), at(2024, 1, 1, 23, 30));
    }

    #[test]
    fn test_daily_rolls_to_tomorrow() {
        let now = at(2024, 1, 1, 10, 15);
        assert_eq!(next_daily(now, 2, 0).unwrap(), at(2024, 1, 2, 2, 0));
    }

    #[test]
    fn test_daily_rejects_invalid_time() {
        assert!(next_daily(Utc::now(), 25, 0).is_err());
    }

    #[test]
    fn test_cron_hourly() {
        let cron = CronExpr::parse("0 * * * *").unwrap();
        assert_eq!(cron.next_fire(at(2024, 1, 1, 10, 15)), Some(at(2024, 1, 1, 11, 0)));
    }

    #[test]
    fn test_cron_strictly_after_now() {
        let cron = CronExpr::parse("15 10 * * *").unwrap();
        assert_eq!(cron.next_fire(at(2024, 1, 1, 10, 15)), Some(at(2024, 1, 2, 10, 15)));
    }

    #[test]
    fn test_cron_lists_ranges_steps() {
        let cron = CronExpr::parse("*/15 8-17 * * 1-5").unwrap();
        // Jan 1 2024 is a Monday
        assert_eq!(cron.next_fire(at(2024, 1, 1, 7, 50)), Some(at(2024, 1, 1, 8, 0)));
        assert_eq!(cron.next_fire(at(2024, 1, 1, 8, 0)), Some(at(2024, 1, 1, 8, 15)));
        // Friday 17:45 -> Monday 08:00
        assert_eq!(cron.next_fire(at(2024, 1, 5, 17, 45)), Some(at(2024, 1, 8, 8, 0)));
    }

    #[test]
    fn test_cron_sunday_alias() {
        let cron = CronExpr::parse("0 12 * * 7").unwrap();
        // Jan 7 2024 is a Sunday
        assert_eq!(cron.next_fire(at(2024, 1, 6, 0, 0)), Some(at(2024, 1, 7, 12, 0)));
    }

    #[test]
    fn test_cron_rejects_bad_expressions() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
    }
}
