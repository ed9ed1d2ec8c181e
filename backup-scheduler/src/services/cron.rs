//! Five-field cron expressions evaluated in UTC at minute granularity.

use backup_engine::{BackupError, Result};
use chrono::{DateTime, Timelike, Utc};
use croner::Cron;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct CronSpec {
    expression: String,
    cron: Arc<Cron>,
}

impl CronSpec {
    /// Parse `minute hour day-of-month month day-of-week`.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields = expression.split_whitespace().count();
        if fields != 5 {
            return Err(BackupError::InvalidCron(format!(
                "'{}' has {} fields, expected 5",
                expression, fields
            )));
        }

        let normalized = expression.split_whitespace().collect::<Vec<_>>().join(" ");
        let cron = Cron::new(&normalized)
            .parse()
            .map_err(|e| BackupError::InvalidCron(format!("'{}': {}", expression, e)))?;

        Ok(Self {
            expression: normalized,
            cron: Arc::new(cron),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the minute containing `at` is an occurrence.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.cron
            .is_time_matching(&truncate_to_minute(at))
            .unwrap_or(false)
    }

    /// First occurrence strictly after `at`.
    pub fn next_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.find_next_occurrence(&at, false).ok()
    }
}

impl fmt::Debug for CronSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSpec").field(&self.expression).finish()
    }
}

pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}
