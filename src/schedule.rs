//! Cron schedule handling shared by collection workers and refresh jobs.
//!
//! Both subsystems use the same 5-field notation and the same iterator so a
//! schedule string means the same thing wherever it appears. An empty string
//! means "no automatic fire" (manual triggering only).

use chrono::{DateTime, Utc};
use croner::Cron;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid cron expression \"{expression}\": {message}")]
pub struct ScheduleError {
    pub expression: String,
    pub message: String,
}

/// A parsed schedule. `None` inside means the empty "manual only" schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    cron: Option<Cron>,
    source: String,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Ok(Self {
                cron: None,
                source: String::new(),
            });
        }

        let cron = Cron::new(trimmed)
            .parse()
            .map_err(|e| ScheduleError {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            cron: Some(cron),
            source: trimmed.to_string(),
        })
    }

    pub fn is_manual_only(&self) -> bool {
        self.cron.is_none()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Next fire instant strictly after `after`, or `None` for manual-only
    /// schedules and exhausted iterators.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron
            .as_ref()
            .and_then(|cron| cron.find_next_occurrence(&after, false).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_schedule_is_manual_only() {
        let schedule = Schedule::parse("").unwrap();
        assert!(schedule.is_manual_only());
        assert_eq!(schedule.next_after(Utc::now()), None);

        let schedule = Schedule::parse("   ").unwrap();
        assert!(schedule.is_manual_only());
    }

    #[test]
    fn test_five_field_notation() {
        let schedule = Schedule::parse("*/15 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let next = schedule.next_after(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 10, 15, 0).unwrap());
    }

    #[test]
    fn test_next_is_strictly_after() {
        let schedule = Schedule::parse("0 * * * *").unwrap();
        let on_the_hour = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let next = schedule.next_after(on_the_hour).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        assert!(Schedule::parse("every tuesday").is_err());
        assert!(Schedule::parse("* * *").is_err());
    }
}
