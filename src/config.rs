//! Configuration types.
//!
//! Every threshold here is product policy rather than an invariant, so each
//! one can be overridden from the environment.

use std::str::FromStr;
use std::time::Duration;

/// Cadence policy: timing thresholds for the lead follow-up schedule.
#[derive(Debug, Clone)]
pub struct CadenceConfig {
    /// Debounce window: a lead contacted within this window is not re-selected.
    pub grace: Duration,
    /// Hot-window spacing after the 1st, 2nd and 3rd message on day 0.
    pub hot_window_intervals: Vec<Duration>,
    /// Minimum spacing between standard touches on days 1–7.
    pub daily_interval: Duration,
    /// Maximum outbound messages in any trailing 24 hours during days 1–7.
    pub daily_cap: u32,
    /// Last day (inclusive) of the daily phase.
    pub daily_phase_end_day: i64,
    /// Last day (inclusive) of week 2.
    pub week_two_end_day: i64,
    pub week_two_interval: Duration,
    /// Last day (inclusive) of weeks 3–4.
    pub weeks_three_four_end_day: i64,
    pub weeks_three_four_interval: Duration,
    pub month_two_interval: Duration,
    /// Leads this old that never replied are archived to LOST.
    pub archive_after_days: i64,
    /// Lead ages (days) that emit an operator notification.
    pub milestone_days: Vec<i64>,
    /// Smallest delay used whenever a computed review time is not in the future.
    pub min_reschedule: Duration,
    /// Delay before retrying a lead whose processing failed.
    pub retry_delay: Duration,
    /// Random jitter added on top of `retry_delay`.
    pub retry_jitter: Duration,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5 * 60),
            hot_window_intervals: vec![
                Duration::from_secs(3600),
                Duration::from_secs(4 * 3600),
                Duration::from_secs(12 * 3600),
            ],
            daily_interval: Duration::from_secs(24 * 3600),
            daily_cap: 2,
            daily_phase_end_day: 7,
            week_two_end_day: 14,
            week_two_interval: Duration::from_secs(2 * 86_400),
            weeks_three_four_end_day: 30,
            weeks_three_four_interval: Duration::from_secs(4 * 86_400),
            month_two_interval: Duration::from_secs(7 * 86_400),
            archive_after_days: 60,
            milestone_days: vec![3, 7, 10, 15, 21, 28, 35, 45, 55],
            min_reschedule: Duration::from_secs(15 * 60),
            retry_delay: Duration::from_secs(30 * 60),
            retry_jitter: Duration::from_secs(5 * 60),
        }
    }
}

impl CadenceConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            grace: env_minutes("LEAD_CADENCE_GRACE_MIN", d.grace),
            hot_window_intervals: vec![
                env_minutes("LEAD_CADENCE_HOT_1_MIN", d.hot_window_intervals[0]),
                env_minutes("LEAD_CADENCE_HOT_2_MIN", d.hot_window_intervals[1]),
                env_minutes("LEAD_CADENCE_HOT_3_MIN", d.hot_window_intervals[2]),
            ],
            daily_interval: env_hours("LEAD_CADENCE_DAILY_INTERVAL_HOURS", d.daily_interval),
            daily_cap: env_or("LEAD_CADENCE_DAILY_CAP", d.daily_cap),
            daily_phase_end_day: d.daily_phase_end_day,
            week_two_end_day: d.week_two_end_day,
            week_two_interval: env_hours("LEAD_CADENCE_WEEK2_INTERVAL_HOURS", d.week_two_interval),
            weeks_three_four_end_day: d.weeks_three_four_end_day,
            weeks_three_four_interval: env_hours(
                "LEAD_CADENCE_WEEK34_INTERVAL_HOURS",
                d.weeks_three_four_interval,
            ),
            month_two_interval: env_hours(
                "LEAD_CADENCE_MONTH2_INTERVAL_HOURS",
                d.month_two_interval,
            ),
            archive_after_days: env_or("LEAD_CADENCE_ARCHIVE_DAYS", d.archive_after_days),
            milestone_days: d.milestone_days,
            min_reschedule: env_minutes("LEAD_CADENCE_MIN_RESCHEDULE_MIN", d.min_reschedule),
            retry_delay: env_minutes("LEAD_CADENCE_RETRY_MIN", d.retry_delay),
            retry_jitter: d.retry_jitter,
        }
    }
}

/// Engine runtime configuration: ticker, concurrency, timeouts and sweep windows.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the sweep ticker fires.
    pub tick_interval: Duration,
    /// Maximum leads processed concurrently within one pass.
    pub max_concurrent: usize,
    /// Hard timeout for a Decision Service call.
    pub decision_timeout: Duration,
    /// Hard timeout for a single gateway send.
    pub gateway_timeout: Duration,
    /// Hard timeout for an operator notification.
    pub notify_timeout: Duration,
    /// Reminder lead times before an appointment.
    pub reminder_day_before: Duration,
    pub reminder_hour_before: Duration,
    /// Time after the appointment start at which a missing outcome is assumed completed.
    pub call_duration: Duration,
    /// Delay of the deferred post-call follow-up.
    pub follow_up_delay: Duration,
    /// Application nudge offsets after application start.
    pub application_nudges: Vec<Duration>,
    /// Nudge offset after a completed call with no application.
    pub call_nudge_after: Duration,
    /// A nudge is skipped if any outbound message was sent within this window.
    pub nudge_quiet_window: Duration,
    /// Stale-lead thresholds in days.
    pub stale_warning_days: i64,
    pub stale_critical_days: i64,
    /// Cron schedule for the stale-lead alert sweep.
    pub stale_alert_schedule: String,
    /// Window for the duplicate-submission check on call outcomes and application links.
    pub duplicate_window: Duration,
    /// Re-review delay when the Decision Service asks to wait without a horizon.
    pub decision_wait_default: Duration,
    /// Upper bound on a decision-requested wait.
    pub decision_wait_max: Duration,
    /// Communications included in the decision context.
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            max_concurrent: 8,
            decision_timeout: Duration::from_secs(30),
            gateway_timeout: Duration::from_secs(15),
            notify_timeout: Duration::from_secs(5),
            reminder_day_before: Duration::from_secs(24 * 3600),
            reminder_hour_before: Duration::from_secs(3600),
            call_duration: Duration::from_secs(30 * 60),
            follow_up_delay: Duration::from_secs(3600),
            application_nudges: vec![
                Duration::from_secs(24 * 3600),
                Duration::from_secs(48 * 3600),
            ],
            call_nudge_after: Duration::from_secs(72 * 3600),
            nudge_quiet_window: Duration::from_secs(20 * 3600),
            stale_warning_days: 3,
            stale_critical_days: 5,
            stale_alert_schedule: "0 0 14 * * *".to_string(),
            duplicate_window: Duration::from_secs(5 * 60),
            decision_wait_default: Duration::from_secs(4 * 3600),
            decision_wait_max: Duration::from_secs(30 * 86_400),
            history_limit: 20,
        }
    }
}

impl EngineConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            tick_interval: env_secs("LEAD_CADENCE_TICK_SECS", d.tick_interval),
            max_concurrent: env_or("LEAD_CADENCE_MAX_CONCURRENT", d.max_concurrent).max(1),
            decision_timeout: env_secs("LEAD_CADENCE_DECISION_TIMEOUT_SECS", d.decision_timeout),
            gateway_timeout: env_secs("LEAD_CADENCE_GATEWAY_TIMEOUT_SECS", d.gateway_timeout),
            notify_timeout: d.notify_timeout,
            reminder_day_before: d.reminder_day_before,
            reminder_hour_before: d.reminder_hour_before,
            call_duration: env_minutes("LEAD_CADENCE_CALL_DURATION_MIN", d.call_duration),
            follow_up_delay: env_minutes("LEAD_CADENCE_FOLLOW_UP_MIN", d.follow_up_delay),
            application_nudges: d.application_nudges,
            call_nudge_after: d.call_nudge_after,
            nudge_quiet_window: d.nudge_quiet_window,
            stale_warning_days: env_or("LEAD_CADENCE_STALE_WARN_DAYS", d.stale_warning_days),
            stale_critical_days: env_or("LEAD_CADENCE_STALE_CRIT_DAYS", d.stale_critical_days),
            stale_alert_schedule: std::env::var("LEAD_CADENCE_STALE_CRON")
                .unwrap_or(d.stale_alert_schedule),
            duplicate_window: env_minutes("LEAD_CADENCE_DUPLICATE_WINDOW_MIN", d.duplicate_window),
            decision_wait_default: env_hours(
                "LEAD_CADENCE_DECISION_WAIT_HOURS",
                d.decision_wait_default,
            ),
            decision_wait_max: env_hours("LEAD_CADENCE_DECISION_WAIT_MAX_HOURS", d.decision_wait_max),
            history_limit: env_or("LEAD_CADENCE_HISTORY_LIMIT", d.history_limit),
        }
    }
}

/// Guardrail limits applied to every proposed outbound message.
#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    pub sms_max_chars: usize,
    pub email_max_chars: usize,
    pub voice_max_chars: usize,
    /// Outbound messages in the trailing 24 hours that trigger a warning.
    pub daily_soft_ceiling: u32,
    /// How far back the anti-repetition check looks.
    pub repetition_lookback: Duration,
    /// Token-overlap ratio at or above which two messages count as identical.
    pub repetition_similarity: f64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            sms_max_chars: 480,
            email_max_chars: 10_000,
            voice_max_chars: 2_000,
            daily_soft_ceiling: 3,
            repetition_lookback: Duration::from_secs(14 * 86_400),
            repetition_similarity: 0.9,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

fn env_minutes(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs() / 60) * 60)
}

fn env_hours(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs() / 3600) * 3600)
}

/// Convert a std duration to a chrono duration, saturating on overflow.
pub fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_defaults_match_policy() {
        let c = CadenceConfig::default();
        assert_eq!(c.grace.as_secs(), 300);
        assert_eq!(c.hot_window_intervals.len(), 3);
        assert_eq!(c.hot_window_intervals[2].as_secs(), 12 * 3600);
        assert_eq!(c.archive_after_days, 60);
        assert_eq!(c.milestone_days, vec![3, 7, 10, 15, 21, 28, 35, 45, 55]);
    }

    #[test]
    fn env_minutes_falls_back_on_garbage() {
        let d = env_minutes("LEAD_CADENCE_TEST_UNSET_KEY", Duration::from_secs(600));
        assert_eq!(d.as_secs(), 600);
    }

    #[test]
    fn engine_defaults() {
        let e = EngineConfig::default();
        assert_eq!(e.max_concurrent, 8);
        assert_eq!(e.application_nudges.len(), 2);
        assert!(cron::Schedule::from_str(&e.stale_alert_schedule).is_ok());
    }
}
