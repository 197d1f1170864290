use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::prayer::OccurrenceKey;
use crate::resolver::ResolvedNextPrayer;
use crate::tracking::{Subsystem, Trackers};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ArrivalPhase {
    /// Polling the resolved prayer on the poll cadence.
    Idle,
    /// Triggered; waiting for the reschedule to propagate before confirming.
    Propagating {
        key: OccurrenceKey,
        confirm_at: NaiveDateTime,
    },
    /// Holding off before polling again. `retry` is set when the resolved
    /// prayer failed to advance and one more advancement attempt is owed.
    Settling {
        key: OccurrenceKey,
        resume_at: NaiveDateTime,
        retry: bool,
    },
    /// Host in background.
    Paused,
}

/// Work the monitor asks its owner to carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalAction {
    /// Lift the schedule cooldown, advance past `key`, reschedule.
    Trigger(OccurrenceKey),
    /// Re-resolve and report back through [`ArrivalMonitor::confirm`].
    Confirm(OccurrenceKey),
    /// Still stuck on `key` after settling; try advancing once more.
    RetryAdvance(OccurrenceKey),
    /// Normal polling resumed.
    Resumed,
}

/// Watches the resolved next prayer and fires once per occurrence when its
/// instant is reached.
#[derive(Debug, Clone)]
pub struct ArrivalMonitor {
    phase: ArrivalPhase,
    poll_interval: Duration,
    window: Duration,
    propagation_delay: Duration,
    settle_delay: Duration,
    next_poll_at: Option<NaiveDateTime>,
}

impl ArrivalMonitor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            phase: ArrivalPhase::Idle,
            poll_interval: config.arrival_poll,
            window: config.arrival_window,
            propagation_delay: config.propagation_delay,
            settle_delay: config.settle_delay,
            next_poll_at: None,
        }
    }

    pub fn phase(&self) -> &ArrivalPhase {
        &self.phase
    }

    pub fn poll(
        &mut self,
        now: NaiveDateTime,
        next: Option<&ResolvedNextPrayer>,
        day_offset: i64,
        trackers: &mut Trackers,
    ) -> Option<ArrivalAction> {
        match self.phase.clone() {
            ArrivalPhase::Paused => None,
            ArrivalPhase::Propagating { key, confirm_at } => {
                (now >= confirm_at).then_some(ArrivalAction::Confirm(key))
            }
            ArrivalPhase::Settling {
                key,
                resume_at,
                retry,
            } => {
                if now < resume_at {
                    return None;
                }
                self.phase = ArrivalPhase::Idle;
                self.next_poll_at = None;
                if retry {
                    tracing::debug!(key = %key, "settle elapsed, retrying advancement");
                    Some(ArrivalAction::RetryAdvance(key))
                } else {
                    Some(ArrivalAction::Resumed)
                }
            }
            ArrivalPhase::Idle => {
                if day_offset != 0 {
                    return None;
                }
                if self.next_poll_at.is_some_and(|due| now < due) {
                    return None;
                }
                self.next_poll_at = Some(now + self.poll_interval);

                let next = next?;
                if now - next.instant < -self.window {
                    return None;
                }
                let key = next.key();
                // Claim before anything else so a re-entrant poll cannot fire twice.
                if !trackers.claim(Subsystem::Arrival, &key) {
                    return None;
                }
                self.next_poll_at = None;
                self.phase = ArrivalPhase::Propagating {
                    key,
                    confirm_at: now + self.propagation_delay,
                };
                tracing::info!(key = %key, "prayer arrival triggered");
                Some(ArrivalAction::Trigger(key))
            }
        }
    }

    /// Reports whether the resolved prayer moved past `key` after a trigger.
    pub fn confirm(&mut self, now: NaiveDateTime, key: OccurrenceKey, advanced: bool) {
        let resume_at = if advanced {
            now + self.settle_delay
        } else {
            now + self.settle_delay + self.settle_delay
        };
        self.phase = ArrivalPhase::Settling {
            key,
            resume_at,
            retry: !advanced,
        };
    }

    /// Polls promptly on the next call; only affects an idle monitor.
    pub fn reset_polling(&mut self) {
        if self.phase == ArrivalPhase::Idle {
            self.next_poll_at = None;
        }
    }

    pub fn pause(&mut self) {
        self.phase = ArrivalPhase::Paused;
        self.next_poll_at = None;
    }

    pub fn resume(&mut self) {
        if self.phase == ArrivalPhase::Paused {
            self.phase = ArrivalPhase::Idle;
        }
        self.next_poll_at = None;
    }

    /// Drops any in-flight trigger sequence, e.g. on a day change.
    pub fn restart(&mut self) {
        if self.phase != ArrivalPhase::Paused {
            self.phase = ArrivalPhase::Idle;
        }
        self.next_poll_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prayer::PrayerName;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn asr() -> ResolvedNextPrayer {
        ResolvedNextPrayer {
            name: PrayerName::Asr,
            next_day: false,
            instant: at(15, 2, 0),
            display_time: "15:02".into(),
        }
    }

    fn monitor() -> ArrivalMonitor {
        ArrivalMonitor::new(&EngineConfig::default())
    }

    #[test]
    fn stays_idle_outside_trigger_window() {
        let mut monitor = monitor();
        let mut trackers = Trackers::default();
        assert_eq!(
            monitor.poll(at(15, 1, 45), Some(&asr()), 0, &mut trackers),
            None
        );
        assert_eq!(monitor.phase(), &ArrivalPhase::Idle);
    }

    #[test]
    fn polls_on_cadence() {
        let mut monitor = monitor();
        let mut trackers = Trackers::default();
        assert_eq!(monitor.poll(at(15, 0, 0), Some(&asr()), 0, &mut trackers), None);
        // Inside the window but before the next poll is due.
        assert_eq!(
            monitor.poll(at(15, 0, 14), Some(&asr()), 0, &mut trackers),
            None
        );
        let mut monitor = ArrivalMonitor::new(&EngineConfig::default());
        monitor.poll(at(15, 1, 45), Some(&asr()), 0, &mut trackers);
        assert_eq!(
            monitor.poll(at(15, 1, 55), Some(&asr()), 0, &mut trackers),
            None
        );
        assert_eq!(
            monitor.poll(at(15, 2, 0), Some(&asr()), 0, &mut trackers),
            Some(ArrivalAction::Trigger(asr().key()))
        );
    }

    #[test]
    fn triggers_once_per_occurrence() {
        let mut monitor = monitor();
        let mut trackers = Trackers::default();
        let key = asr().key();

        assert_eq!(
            monitor.poll(at(15, 1, 52), Some(&asr()), 0, &mut trackers),
            Some(ArrivalAction::Trigger(key))
        );
        assert!(trackers.is_claimed(Subsystem::Arrival, &key));
        // Polling stopped while the trigger sequence runs.
        assert_eq!(
            monitor.poll(at(15, 1, 53), Some(&asr()), 0, &mut trackers),
            None
        );
        assert_eq!(
            monitor.poll(at(15, 1, 54), Some(&asr()), 0, &mut trackers),
            Some(ArrivalAction::Confirm(key))
        );
        monitor.confirm(at(15, 1, 54), key, true);
        assert_eq!(
            monitor.poll(at(15, 2, 24), Some(&asr()), 0, &mut trackers),
            Some(ArrivalAction::Resumed)
        );
        // Same occurrence still resolved: the claim blocks a second trigger.
        assert_eq!(
            monitor.poll(at(15, 2, 25), Some(&asr()), 0, &mut trackers),
            None
        );
    }

    #[test]
    fn stale_resolution_retries_once_after_longer_settle() {
        let mut monitor = monitor();
        let mut trackers = Trackers::default();
        let key = asr().key();
        monitor.poll(at(15, 2, 0), Some(&asr()), 0, &mut trackers);
        monitor.confirm(at(15, 2, 2), key, false);
        assert_eq!(
            monitor.poll(at(15, 2, 32), Some(&asr()), 0, &mut trackers),
            None
        );
        assert_eq!(
            monitor.poll(at(15, 3, 2), Some(&asr()), 0, &mut trackers),
            Some(ArrivalAction::RetryAdvance(key))
        );
        assert_eq!(monitor.phase(), &ArrivalPhase::Idle);
    }

    #[test]
    fn preview_days_and_background_never_trigger() {
        let mut monitor = monitor();
        let mut trackers = Trackers::default();
        assert_eq!(monitor.poll(at(15, 2, 0), Some(&asr()), 1, &mut trackers), None);
        monitor.pause();
        assert_eq!(monitor.poll(at(15, 2, 0), Some(&asr()), 0, &mut trackers), None);
        monitor.resume();
        assert!(matches!(
            monitor.poll(at(15, 2, 0), Some(&asr()), 0, &mut trackers),
            Some(ArrivalAction::Trigger(_))
        ));
    }
}
