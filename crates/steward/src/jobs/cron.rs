use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{QueueError, QueueResult};

/// Parse a standard five-field cron expression.
///
/// The `cron` crate wants a seconds field, so a literal `0` is prepended;
/// anything other than exactly five fields is rejected before it gets near
/// the parser.
pub fn parse_expr(expr: &str) -> QueueResult<Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(QueueError::validation(format!(
            "cron expression must have 5 fields, got {fields}: {expr:?}"
        )));
    }

    Schedule::from_str(&format!("0 {expr}"))
        .map_err(|e| QueueError::validation(format!("bad cron expression {expr:?}: {e}")))
}

pub fn parse_timezone(name: &str) -> QueueResult<Tz> {
    Tz::from_str(name).map_err(|_| QueueError::validation(format!("unknown timezone: {name}")))
}

/// The next tick strictly after `after`, evaluated in `timezone` and
/// returned as a UTC instant.
///
/// DST note: the underlying parser skips local times that do not exist in
/// the zone and takes the earliest mapping for ambiguous ones.
pub fn next_occurrence(
    expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> QueueResult<DateTime<Utc>> {
    let schedule = parse_expr(expr)?;
    let tz = parse_timezone(timezone)?;

    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            QueueError::validation(format!("cron expression {expr:?} has no future occurrence"))
        })
}

/// Validates both pieces without computing anything; used by the admin
/// surface before a schedule row is written.
pub fn validate(expr: &str, timezone: &str) -> QueueResult<()> {
    parse_expr(expr)?;
    parse_timezone(timezone)?;
    Ok(())
}
