//! The cadence table: one ordered rule list that maps a lead's age and
//! contact history to an action class and the next review instant.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{CadenceConfig, chrono_duration};

/// Cadence phase a lead is in, by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    HotWindow,
    Daily,
    WeekTwo,
    WeeksThreeFour,
    MonthTwoPlus,
    Archive,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HotWindow => "hot_window",
            Self::Daily => "daily",
            Self::WeekTwo => "week_two",
            Self::WeeksThreeFour => "weeks_three_four",
            Self::MonthTwoPlus => "month_two_plus",
            Self::Archive => "archive",
        }
    }
}

/// What class of action a pass should take for a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    /// First touch or a re-engagement touch in the hot or daily phase.
    Touch,
    /// Low-frequency nurture message.
    Nurture,
    /// Move the lead to `LOST`.
    Archive,
    /// Nothing fires yet.
    Wait,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Touch => "touch",
            Self::Nurture => "nurture",
            Self::Archive => "archive",
            Self::Wait => "wait",
        }
    }
}

/// History facts the table is evaluated on. All are derived from the
/// communication log at evaluation time.
#[derive(Debug, Clone)]
pub struct CadenceInput {
    pub created_at: DateTime<Utc>,
    pub outbound_count: i64,
    pub outbound_last_24h: i64,
    pub last_outbound_at: Option<DateTime<Utc>>,
    pub has_replied: bool,
}

impl CadenceInput {
    /// The same history with one more outbound message sent at `at`.
    pub fn after_send(&self, at: DateTime<Utc>) -> Self {
        Self {
            created_at: self.created_at,
            outbound_count: self.outbound_count + 1,
            outbound_last_24h: self.outbound_last_24h + 1,
            last_outbound_at: Some(at),
            has_replied: self.has_replied,
        }
    }
}

/// Result of evaluating the table.
#[derive(Debug, Clone, Serialize)]
pub struct CadenceDecision {
    pub phase: Phase,
    pub action: ActionClass,
    /// When the lead should next be looked at. `None` only for `Archive`.
    pub next_review_at: Option<DateTime<Utc>>,
}

impl CadenceDecision {
    pub fn fires(&self) -> bool {
        matches!(self.action, ActionClass::Touch | ActionClass::Nurture)
    }
}

/// The ordered cadence rules, built from configuration.
#[derive(Debug, Clone)]
pub struct CadenceTable {
    config: CadenceConfig,
}

impl CadenceTable {
    pub fn new(config: CadenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.config
    }

    /// Phase for a lead age in whole days.
    pub fn phase_for_age(&self, age_days: i64) -> Phase {
        let c = &self.config;
        match age_days {
            d if d <= 0 => Phase::HotWindow,
            d if d <= c.daily_phase_end_day => Phase::Daily,
            d if d <= c.week_two_end_day => Phase::WeekTwo,
            d if d <= c.weeks_three_four_end_day => Phase::WeeksThreeFour,
            _ => Phase::MonthTwoPlus,
        }
    }

    /// Evaluate the table at `now`. The first matching row wins.
    pub fn evaluate(&self, input: &CadenceInput, now: DateTime<Utc>) -> CadenceDecision {
        let c = &self.config;
        let age_days = now.signed_duration_since(input.created_at).num_days().max(0);

        if age_days >= c.archive_after_days && !input.has_replied {
            return CadenceDecision {
                phase: Phase::Archive,
                action: ActionClass::Archive,
                next_review_at: None,
            };
        }

        let phase = self.phase_for_age(age_days);

        let Some(last) = input.last_outbound_at.filter(|_| input.outbound_count > 0) else {
            // Nothing sent yet: the first touch is always immediate.
            return self.fire(phase, ActionClass::Touch, input, now);
        };

        let (due_at, class) = match phase {
            Phase::HotWindow => {
                let idx = (input.outbound_count - 1) as usize;
                match c.hot_window_intervals.get(idx) {
                    Some(interval) => (last + chrono_duration(*interval), ActionClass::Touch),
                    // Hot window exhausted: next touch belongs to day 1.
                    None => (
                        input.created_at + chrono::Duration::days(1),
                        ActionClass::Touch,
                    ),
                }
            }
            Phase::Daily => {
                let due = last + chrono_duration(c.daily_interval);
                if input.outbound_last_24h >= c.daily_cap as i64 {
                    (due.max(now + chrono_duration(c.min_reschedule)), ActionClass::Touch)
                } else {
                    (due, ActionClass::Touch)
                }
            }
            Phase::WeekTwo => (last + chrono_duration(c.week_two_interval), ActionClass::Nurture),
            Phase::WeeksThreeFour => (
                last + chrono_duration(c.weeks_three_four_interval),
                ActionClass::Nurture,
            ),
            Phase::MonthTwoPlus | Phase::Archive => (
                last + chrono_duration(c.month_two_interval),
                ActionClass::Nurture,
            ),
        };

        if due_at <= now {
            self.fire(phase, class, input, now)
        } else {
            CadenceDecision {
                phase,
                action: ActionClass::Wait,
                next_review_at: Some(self.cap_at_archive(input, due_at)),
            }
        }
    }

    /// Where the next review lands after a message goes out at `at`.
    ///
    /// Always strictly after `at`.
    pub fn next_review_after_send(&self, input: &CadenceInput, at: DateTime<Utc>) -> DateTime<Utc> {
        let after = input.after_send(at);
        self.evaluate(&after, at)
            .next_review_at
            .filter(|t| *t > at)
            .unwrap_or_else(|| self.rearm(at))
    }

    /// Smallest strictly-future review instant.
    pub fn rearm(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono_duration(self.config.min_reschedule)
    }

    /// A firing row still carries a fallback review time in case the pass
    /// ends without sending.
    fn fire(
        &self,
        phase: Phase,
        action: ActionClass,
        input: &CadenceInput,
        now: DateTime<Utc>,
    ) -> CadenceDecision {
        CadenceDecision {
            phase,
            action,
            next_review_at: Some(self.cap_at_archive(input, self.rearm(now))),
        }
    }

    /// A lead that never replied must be looked at again no later than its
    /// archive day.
    fn cap_at_archive(&self, input: &CadenceInput, at: DateTime<Utc>) -> DateTime<Utc> {
        if input.has_replied {
            return at;
        }
        let archive_at = input.created_at + chrono::Duration::days(self.config.archive_after_days);
        at.min(archive_at)
    }

    /// The most recent milestone day reached at `age_days`, if any.
    pub fn current_milestone(&self, age_days: i64) -> Option<i64> {
        self.config
            .milestone_days
            .iter()
            .copied()
            .filter(|d| *d <= age_days)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn table() -> CadenceTable {
        CadenceTable::new(CadenceConfig::default())
    }

    fn input(
        now: DateTime<Utc>,
        age: Duration,
        sent: i64,
        last_ago: Option<Duration>,
        replied: bool,
    ) -> CadenceInput {
        CadenceInput {
            created_at: now - age,
            outbound_count: sent,
            outbound_last_24h: match last_ago {
                Some(ago) if ago < Duration::hours(24) => sent.min(1),
                _ => 0,
            },
            last_outbound_at: last_ago.map(|ago| now - ago),
            has_replied: replied,
        }
    }

    #[test]
    fn new_lead_gets_immediate_first_touch() {
        let now = Utc::now();
        let d = table().evaluate(&input(now, Duration::minutes(2), 0, None, false), now);
        assert_eq!(d.phase, Phase::HotWindow);
        assert_eq!(d.action, ActionClass::Touch);
    }

    #[test]
    fn hot_window_spacing() {
        let now = Utc::now();
        let t = table();

        let early = t.evaluate(
            &input(now, Duration::hours(1), 1, Some(Duration::minutes(30)), false),
            now,
        );
        assert_eq!(early.action, ActionClass::Wait);
        assert_eq!(
            early.next_review_at.unwrap(),
            now - Duration::minutes(30) + Duration::hours(1)
        );

        let second = t.evaluate(
            &input(now, Duration::hours(2), 1, Some(Duration::minutes(61)), false),
            now,
        );
        assert_eq!(second.action, ActionClass::Touch);

        let third_early = t.evaluate(
            &input(now, Duration::hours(5), 2, Some(Duration::hours(3)), false),
            now,
        );
        assert_eq!(third_early.action, ActionClass::Wait);

        let fourth = t.evaluate(
            &input(now, Duration::hours(20), 3, Some(Duration::hours(12)), false),
            now,
        );
        assert_eq!(fourth.action, ActionClass::Touch);
    }

    #[test]
    fn exhausted_hot_window_waits_for_day_one() {
        let now = Utc::now();
        let inp = input(now, Duration::hours(20), 4, Some(Duration::hours(1)), false);
        let d = table().evaluate(&inp, now);
        assert_eq!(d.action, ActionClass::Wait);
        assert_eq!(d.next_review_at.unwrap(), inp.created_at + Duration::days(1));
    }

    #[test]
    fn daily_phase_respects_spacing_and_cap() {
        let now = Utc::now();
        let t = table();

        let d = t.evaluate(
            &input(now, Duration::days(3), 5, Some(Duration::hours(25)), false),
            now,
        );
        assert_eq!(d.phase, Phase::Daily);
        assert_eq!(d.action, ActionClass::Touch);

        let mut capped = input(now, Duration::days(3), 6, Some(Duration::hours(23)), false);
        capped.outbound_last_24h = 2;
        let d = t.evaluate(&capped, now);
        assert_eq!(d.action, ActionClass::Wait);
        assert!(d.next_review_at.unwrap() > now);
    }

    #[test]
    fn day_ten_no_reply_is_nurture() {
        let now = Utc::now();
        let d = table().evaluate(
            &input(now, Duration::days(10), 4, Some(Duration::days(10)), false),
            now,
        );
        assert_eq!(d.phase, Phase::WeekTwo);
        assert_eq!(d.action, ActionClass::Nurture);
    }

    #[test]
    fn day_sixty_five_no_reply_is_archive() {
        let now = Utc::now();
        let d = table().evaluate(
            &input(now, Duration::days(65), 4, Some(Duration::days(10)), false),
            now,
        );
        assert_eq!(d.action, ActionClass::Archive);
        assert!(d.next_review_at.is_none());
    }

    #[test]
    fn replied_old_lead_keeps_weekly_nurture() {
        let now = Utc::now();
        let t = table();
        let d = t.evaluate(
            &input(now, Duration::days(65), 9, Some(Duration::days(8)), true),
            now,
        );
        assert_eq!(d.phase, Phase::MonthTwoPlus);
        assert_eq!(d.action, ActionClass::Nurture);

        let d = t.evaluate(
            &input(now, Duration::days(65), 9, Some(Duration::days(2)), true),
            now,
        );
        assert_eq!(d.action, ActionClass::Wait);
    }

    #[test]
    fn wait_is_capped_at_archive_day() {
        let now = Utc::now();
        let inp = input(now, Duration::days(58), 10, Some(Duration::days(1)), false);
        let d = table().evaluate(&inp, now);
        assert_eq!(d.action, ActionClass::Wait);
        assert_eq!(d.next_review_at.unwrap(), inp.created_at + Duration::days(60));
    }

    #[test]
    fn decay_across_phases() {
        let now = Utc::now();
        let t = table();
        // Same silence (3 days) means different things at different ages.
        let daily = t.evaluate(&input(now, Duration::days(5), 6, Some(Duration::days(3)), false), now);
        let week_two = t.evaluate(&input(now, Duration::days(12), 8, Some(Duration::days(3)), false), now);
        let week_three = t.evaluate(&input(now, Duration::days(20), 9, Some(Duration::days(3)), false), now);
        assert!(daily.fires());
        assert!(week_two.fires());
        assert!(!week_three.fires());
    }

    #[test]
    fn next_review_after_send_is_strictly_future() {
        let now = Utc::now();
        let t = table();
        for (age, sent) in [
            (Duration::minutes(1), 0),
            (Duration::hours(2), 1),
            (Duration::days(4), 6),
            (Duration::days(12), 8),
            (Duration::days(40), 12),
        ] {
            let inp = input(now, age, sent, Some(Duration::days(30)), true);
            let next = t.next_review_after_send(&inp, now);
            assert!(next > now, "age {age:?} produced {next} <= {now}");
        }
    }

    #[test]
    fn current_milestone_picks_latest_reached() {
        let t = table();
        assert_eq!(t.current_milestone(2), None);
        assert_eq!(t.current_milestone(3), Some(3));
        assert_eq!(t.current_milestone(12), Some(10));
        assert_eq!(t.current_milestone(90), Some(55));
    }
}
