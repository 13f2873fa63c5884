//! Next-check policy.
//!
//! Two modes, selected by [`PollingScheduler`]:
//!
//! - **Round robin**: every feed waits `polling_frequency_minutes`.
//! - **Entry frequency**: the wait is `round(10080 / (weekly_count × factor))`
//!   minutes (10080 minutes in a week), clamped to the configured min/max.
//!   Feeds with no entries last week wait the maximum.
//!
//! A positive override (cache headers, `Retry-After`) acts as a floor. The
//! result is then capped at the mode's maximum interval.

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::{Config, PollingScheduler};

const MINUTES_PER_WEEK: i64 = 7 * 24 * 60;

/// Last second of year 9999. Later timestamps need a sign and more year
/// digits in RFC 3339 and then sort before present dates as text.
const LATEST_CHECK_TIMESTAMP: i64 = 253_402_300_799;

/// Computes next-check timestamps. Cheap to copy; built once from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextCheckScheduler {
    mode: PollingScheduler,
    polling_frequency: i64,
    round_robin_max: i64,
    entry_frequency_min: i64,
    entry_frequency_max: i64,
    entry_frequency_factor: i64,
}

impl NextCheckScheduler {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.polling_scheduler,
            polling_frequency: config.polling_frequency_minutes.max(1),
            round_robin_max: config.scheduler_round_robin_max_interval_minutes,
            entry_frequency_min: config.scheduler_entry_frequency_min_interval_minutes.max(1),
            entry_frequency_max: config.scheduler_entry_frequency_max_interval_minutes,
            entry_frequency_factor: config.scheduler_entry_frequency_factor.max(1),
        }
    }

    /// Whether the weekly entry count is needed.
    #[must_use]
    pub fn uses_entry_frequency(&self) -> bool {
        self.mode == PollingScheduler::EntryFrequency
    }

    fn max_interval(&self) -> i64 {
        match self.mode {
            PollingScheduler::RoundRobin => self.round_robin_max.max(self.polling_frequency),
            PollingScheduler::EntryFrequency => {
                self.entry_frequency_max.max(self.entry_frequency_min)
            }
        }
    }

    fn base_interval(&self, weekly_count: i64) -> i64 {
        match self.mode {
            PollingScheduler::RoundRobin => self.polling_frequency,
            PollingScheduler::EntryFrequency => {
                let max = self.max_interval();
                if weekly_count <= 0 {
                    return max;
                }
                let divisor = weekly_count.saturating_mul(self.entry_frequency_factor);
                // Integer round-half-up of MINUTES_PER_WEEK / divisor.
                let interval =
                    (2 * MINUTES_PER_WEEK).saturating_add(divisor) / divisor.saturating_mul(2);
                interval.clamp(self.entry_frequency_min, max)
            }
        }
    }

    /// Interval in minutes until the next check.
    #[must_use]
    pub fn interval_minutes(&self, weekly_count: i64, override_minutes: i64) -> i64 {
        let mut interval = self.base_interval(weekly_count);
        if override_minutes > 0 {
            interval = interval.max(override_minutes);
        }
        interval.min(self.max_interval())
    }

    /// Timestamp of the next check relative to `now`, never past year 9999.
    #[must_use]
    pub fn next_check_at(
        &self,
        now: DateTime<Utc>,
        weekly_count: i64,
        override_minutes: i64,
    ) -> DateTime<Utc> {
        let minutes = self.interval_minutes(weekly_count, override_minutes);
        TimeDelta::try_minutes(minutes)
            .and_then(|delta| now.checked_add_signed(delta))
            .filter(|at| at.timestamp() <= LATEST_CHECK_TIMESTAMP)
            .or_else(|| DateTime::from_timestamp(LATEST_CHECK_TIMESTAMP, 0))
            .unwrap_or(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_robin() -> NextCheckScheduler {
        NextCheckScheduler::from_config(&Config {
            polling_frequency_minutes: 60,
            scheduler_round_robin_max_interval_minutes: 1440,
            ..Config::default()
        })
    }

    fn entry_frequency(factor: i64) -> NextCheckScheduler {
        NextCheckScheduler::from_config(&Config {
            polling_scheduler: PollingScheduler::EntryFrequency,
            scheduler_entry_frequency_min_interval_minutes: 5,
            scheduler_entry_frequency_max_interval_minutes: 1440,
            scheduler_entry_frequency_factor: factor,
            ..Config::default()
        })
    }

    #[test]
    fn test_round_robin_uses_polling_frequency() {
        let scheduler = round_robin();
        assert!(!scheduler.uses_entry_frequency());
        assert_eq!(scheduler.interval_minutes(0, 0), 60);
        assert_eq!(scheduler.interval_minutes(500, 0), 60);
    }

    #[test]
    fn test_override_is_a_floor() {
        let scheduler = round_robin();
        assert_eq!(scheduler.interval_minutes(0, 2), 60);
        assert_eq!(scheduler.interval_minutes(0, 120), 120);
    }

    #[test]
    fn test_override_capped_at_max() {
        assert_eq!(round_robin().interval_minutes(0, 100_000), 1440);
        assert_eq!(entry_frequency(1).interval_minutes(100, 100_000), 1440);
    }

    #[test]
    fn test_entry_frequency_without_entries_uses_max() {
        let scheduler = entry_frequency(1);
        assert!(scheduler.uses_entry_frequency());
        assert_eq!(scheduler.interval_minutes(0, 0), 1440);
        assert_eq!(scheduler.interval_minutes(-3, 0), 1440);
    }

    #[test]
    fn test_entry_frequency_curve() {
        let scheduler = entry_frequency(1);
        // One entry a week would be 10080 minutes, clamped to the max.
        assert_eq!(scheduler.interval_minutes(1, 0), 1440);
        assert_eq!(scheduler.interval_minutes(7, 0), 1440);
        assert_eq!(scheduler.interval_minutes(14, 0), 720);
        assert_eq!(scheduler.interval_minutes(3, 0), 1440);
        assert_eq!(scheduler.interval_minutes(168, 0), 60);
        // Rounded, not truncated: 10080 / 1000 = 10.08.
        assert_eq!(scheduler.interval_minutes(1000, 0), 10);
        assert_eq!(scheduler.interval_minutes(1_000_000, 0), 5);
    }

    #[test]
    fn test_entry_frequency_factor_shortens_interval() {
        assert_eq!(entry_frequency(2).interval_minutes(14, 0), 360);
    }

    #[test]
    fn test_entry_frequency_is_clamped_and_monotonic() {
        let scheduler = entry_frequency(1);
        let mut previous = i64::MAX;
        for weekly in (0..5_000).step_by(7) {
            let interval = scheduler.interval_minutes(weekly, 0);
            assert!((5..=1440).contains(&interval), "weekly={weekly} interval={interval}");
            assert!(interval <= previous, "weekly={weekly} not monotonic");
            previous = interval;
        }
    }

    #[test]
    fn test_next_check_at_adds_interval() {
        let now = Utc::now();
        let next = round_robin().next_check_at(now, 0, 0);
        assert_eq!(next - now, TimeDelta::minutes(60));
    }

    #[test]
    fn test_next_check_at_clamped_to_year_9999() {
        let scheduler = NextCheckScheduler::from_config(&Config {
            scheduler_round_robin_max_interval_minutes: i64::MAX,
            ..Config::default()
        });
        let now = Utc::now();

        // Not representable as a duration at all.
        let next = scheduler.next_check_at(now, 0, i64::MAX);
        assert_eq!(next.timestamp(), LATEST_CHECK_TIMESTAMP);

        // Representable, but lands around year 21000.
        let next = scheduler.next_check_at(now, 0, 10_000_000_000);
        assert_eq!(next.timestamp(), LATEST_CHECK_TIMESTAMP);
        assert!(next.to_rfc3339() > now.to_rfc3339());
    }
}
