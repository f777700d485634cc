//! Cron evaluation in the butler's configured timezone.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{SchedulerError, SchedulerResult};

/// Compute the next fire time strictly after `after`, evaluating the
/// expression in `tz` and returning the instant in UTC.
///
/// # Errors
///
/// Returns [`SchedulerError::BadCron`] for unparseable expressions or
/// expressions with no future fire time.
pub fn next_fire(expr: &str, tz: chrono_tz::Tz, after: DateTime<Utc>) -> SchedulerResult<DateTime<Utc>> {
    let schedule = cron::Schedule::from_str(expr).map_err(|e| SchedulerError::BadCron {
        expr: expr.to_owned(),
        message: e.to_string(),
    })?;
    let local = after.with_timezone(&tz);
    schedule
        .after(&local)
        .next()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| SchedulerError::BadCron {
            expr: expr.to_owned(),
            message: "no future fire time".to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_fire_advances_strictly() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 7, 59, 59).unwrap();
        let next = next_fire("0 0 8 * * *", chrono_tz::UTC, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap());

        // From exactly the fire instant, the next fire is tomorrow.
        let next2 = next_fire("0 0 8 * * *", chrono_tz::UTC, next).unwrap();
        assert_eq!(next2, Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap());
        assert!(next2 > next);
    }

    #[test]
    fn timezone_shifts_the_utc_instant() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        // 08:00 in Amsterdam (CEST, UTC+2) is 06:00 UTC.
        let next = next_fire("0 0 8 * * *", chrono_tz::Europe::Amsterdam, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 6, 1, 6, 0, 0).unwrap());
    }

    #[test]
    fn garbage_expression_is_rejected() {
        let now = Utc::now();
        let err = next_fire("every tuesday", chrono_tz::UTC, now).unwrap_err();
        assert!(matches!(err, SchedulerError::BadCron { .. }));
    }
}
