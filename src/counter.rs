//! Out-of-order-safe reconciliation for discrete speculative state.
//!
//! The canonical use is ammunition: `shots_fired` counts every shot ever
//! taken (monotonic, never reset) and `reload_point` is the authoritative
//! threshold beyond which shots are refused. A completed reload does not
//! reset the count; it raises the threshold by one magazine.
//!
//! The owner predicts reload transitions locally and the authority's
//! corrections arrive later, possibly after the owner has made further
//! predictions. `steps_into_future` counts the speculative start/cancel
//! transitions made since the last applied correction: each incoming
//! correction decrements it, and while it remains above zero the correction
//! is known-stale (superseded by a newer local prediction) and discarded.
//! Only the correction that brings it to exactly zero is merged, through a
//! four-way matrix over (last prediction kind) x (authority reloading or
//! idle). Every branch converges local state toward the authority; none
//! diverges further, so a single mis-merge cannot be self-corrected later.
//! That matrix is the heart of this module.
//!
//! Reload countdowns run on an [`AlarmScheduler`] alarm, so they stay
//! deterministic under replay and rate scaling.

use crate::error::RampartError;
use crate::report_violation;
use crate::scheduler::{AlarmFired, AlarmHandle, AlarmScheduler, AlarmSpec, NodeId};
use crate::telemetry::{InvariantChecker, InvariantViolation, ViolationKind, ViolationSeverity};
use crate::{Role, Tick};

// ############
// # MESSAGES #
// ############

/// Authoritative counter state, broadcast to all peers.
///
/// Delivery is "keep last": a (re)joining peer is replayed the newest
/// broadcast, available from [`CounterReconciler::latest_broadcast`] on the
/// authority.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CorrectionBroadcast {
    /// The tick the authority emitted this correction at.
    pub tick: Tick,
    /// The authoritative reload threshold.
    pub reload_point: u32,
    /// Whether a reload is in progress on the authority.
    pub reloading: bool,
}

// ##########
// # CONFIG #
// ##########

/// Configuration for a [`CounterReconciler`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CounterConfig {
    /// Shots added to `reload_point` by each completed reload. At least 1.
    pub magazine: u32,
    /// Reload countdown duration, in node-local seconds. Positive.
    pub reload_duration: f64,
    /// The starting reload threshold. At least 1.
    pub initial_reload_point: u32,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            magazine: 8,
            reload_duration: 1.5,
            initial_reload_point: 8,
        }
    }
}

// ############
// # OUTCOMES #
// ############

/// What [`CounterReconciler::apply_correction`] did with a broadcast.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CorrectionOutcome {
    /// The correction was superseded (by a newer local prediction or a newer
    /// already-applied correction) and discarded. Expected steady-state.
    Stale,
    /// The correction was merged into local state.
    Applied,
}

// ##############
// # RECONCILER #
// ##############

/// Speculative discrete-counter state with authoritative correction.
///
/// Construct one per counter per peer with the peer's [`Role`]. The owner
/// predicts; the authority is ground truth and emits
/// [`CorrectionBroadcast`]s; observers only consume broadcasts.
#[derive(Debug)]
pub struct CounterReconciler {
    role: Role,
    config: CounterConfig,
    shots_fired: u32,
    reload_point: u32,
    reloading: bool,
    /// Owner only: speculative transitions not yet confirmed or refuted.
    steps_into_future: u32,
    /// Owner only: whether the newest speculative transition was a start.
    is_last_prediction_start: bool,
    /// Authority only: newest emitted broadcast, for keep-last replay.
    latest_broadcast: Option<CorrectionBroadcast>,
    last_correction_tick: Tick,
    reload_alarm: Option<AlarmHandle>,
}

impl CounterReconciler {
    /// Creates a counter reconciler.
    ///
    /// # Errors
    /// [`RampartError::InvalidRequest`] for a zero magazine, a zero initial
    /// reload point, or a non-positive reload duration.
    pub fn new(role: Role, config: CounterConfig) -> Result<Self, RampartError> {
        if config.magazine == 0 || config.initial_reload_point == 0 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "counter magazine and initial reload point must be at least 1"
            );
            return Err(RampartError::InvalidRequest {
                info: "counter magazine and initial reload point must be at least 1".to_owned(),
            });
        }
        if !(config.reload_duration > 0.0 && config.reload_duration.is_finite()) {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "reload duration must be positive and finite, got {}",
                config.reload_duration
            );
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "reload duration must be positive and finite, got {}",
                    config.reload_duration
                ),
            });
        }
        Ok(Self {
            role,
            config,
            shots_fired: 0,
            reload_point: config.initial_reload_point,
            reloading: false,
            steps_into_future: 0,
            is_last_prediction_start: false,
            latest_broadcast: None,
            last_correction_tick: Tick::NULL,
            reload_alarm: None,
        })
    }

    /// Total shots ever taken on this peer. Monotonic.
    #[must_use]
    pub fn shots_fired(&self) -> u32 {
        self.shots_fired
    }

    /// The current reload threshold.
    #[must_use]
    pub fn reload_point(&self) -> u32 {
        self.reload_point
    }

    /// Whether a reload is in progress (locally, possibly speculative).
    #[must_use]
    pub fn is_reloading(&self) -> bool {
        self.reloading
    }

    /// Owner only: outstanding speculative transitions.
    #[must_use]
    pub fn steps_into_future(&self) -> u32 {
        self.steps_into_future
    }

    /// Authority only: the newest emitted broadcast, for replaying to a
    /// (re)joining peer. `None` before the first transition.
    #[must_use]
    pub fn latest_broadcast(&self) -> Option<CorrectionBroadcast> {
        self.latest_broadcast
    }

    /// Binds the reload countdown to a scheduler node.
    ///
    /// The alarm fires once per reload; route its [`AlarmFired`] event back
    /// through [`service`](CounterReconciler::service). Without a bound
    /// alarm, reload completion must be driven by calling
    /// [`finish_reload`](CounterReconciler::finish_reload) directly.
    ///
    /// # Errors
    /// [`RampartError::UnknownNode`] if `node` is not live.
    pub fn bind_reload_alarm(
        &mut self,
        scheduler: &mut AlarmScheduler,
        node: NodeId,
    ) -> Result<(), RampartError> {
        if let Some(old) = self.reload_alarm.take() {
            let _ = scheduler.remove(old);
        }
        let spec = AlarmSpec::new(self.config.reload_duration)
            .started(false)
            .auto_restart(false);
        self.reload_alarm = Some(scheduler.add_alarm(node, spec)?);
        Ok(())
    }

    /// The bound reload alarm, if any.
    #[must_use]
    pub fn reload_alarm_handle(&self) -> Option<AlarmHandle> {
        self.reload_alarm
    }

    /// Attempts one speculative action (a shot).
    ///
    /// Succeeds only below the reload threshold and outside a reload.
    /// Refusal is expected steady-state, not an error.
    pub fn try_consume(&mut self) -> bool {
        if !self.role.may_author_input() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Counter,
                "try_consume refused: {} peers do not author actions",
                self.role
            );
            return false;
        }
        if self.reloading || self.shots_fired >= self.reload_point {
            return false;
        }
        self.shots_fired += 1;
        true
    }

    /// Starts a reload.
    ///
    /// Raises `reload_point` by one magazine and starts the local countdown.
    /// On the authority this is ground truth and returns a broadcast to send;
    /// on the owner it is a speculative step (`steps_into_future` grows) and
    /// returns `None`. A no-op returning `None` while already reloading.
    ///
    /// # Errors
    /// [`RampartError::WrongRole`] on an observer.
    pub fn start_reload(
        &mut self,
        scheduler: &mut AlarmScheduler,
        tick: Tick,
    ) -> Result<Option<CorrectionBroadcast>, RampartError> {
        self.require_author("start_reload")?;
        if self.reloading {
            return Ok(None);
        }
        self.reloading = true;
        self.reload_point += self.config.magazine;
        self.restart_countdown(scheduler)?;
        Ok(self.conclude_transition(tick, true))
    }

    /// Cancels an in-progress reload, reverting the threshold raise.
    ///
    /// Authority: ground truth plus a broadcast. Owner: speculative step.
    /// A no-op returning `None` while not reloading.
    ///
    /// # Errors
    /// [`RampartError::WrongRole`] on an observer.
    pub fn cancel_reload(
        &mut self,
        scheduler: &mut AlarmScheduler,
        tick: Tick,
    ) -> Result<Option<CorrectionBroadcast>, RampartError> {
        self.require_author("cancel_reload")?;
        if !self.reloading {
            return Ok(None);
        }
        self.reloading = false;
        self.reload_point = self.reload_point.saturating_sub(self.config.magazine);
        self.stop_countdown(scheduler)?;
        Ok(self.conclude_transition(tick, false))
    }

    /// Completes a reload: the countdown elapsed.
    ///
    /// The threshold was already raised at start; completion only clears the
    /// reloading flag. On the owner this is a speculative completion, not a
    /// start/cancel transition, so `steps_into_future` is untouched. Returns
    /// a broadcast on the authority.
    pub fn finish_reload(&mut self, tick: Tick) -> Option<CorrectionBroadcast> {
        if !self.reloading {
            return None;
        }
        self.reloading = false;
        if self.role.is_authority() {
            let broadcast = CorrectionBroadcast {
                tick,
                reload_point: self.reload_point,
                reloading: false,
            };
            self.latest_broadcast = Some(broadcast);
            return Some(broadcast);
        }
        None
    }

    /// Drives the reload countdown from the tick loop.
    ///
    /// Call once per tick after [`AlarmScheduler::advance`] with the fired
    /// events; completes the reload when the bound alarm fired.
    pub fn service(&mut self, fired: &[AlarmFired], tick: Tick) -> Option<CorrectionBroadcast> {
        let handle = self.reload_alarm?;
        if fired.iter().any(|event| event.handle == handle) {
            self.finish_reload(tick)
        } else {
            None
        }
    }

    /// Applies an authoritative correction on a non-authority peer.
    ///
    /// Decrements `steps_into_future` (never below zero). While it remains
    /// above zero the correction is superseded by a newer local prediction
    /// and discarded. The correction that lands it on exactly zero merges
    /// through the four-way matrix; with no outstanding predictions the
    /// authoritative values are adopted outright.
    ///
    /// Corrections are processed even while the owner's input is disabled;
    /// records already sent still get their replies, and dropping them here
    /// would leak `steps_into_future` counts.
    ///
    /// Delivery is assumed keep-last: the channel carries at most the newest
    /// broadcast, so one tagged older than the last applied tick can only be
    /// a redelivery of something already superseded. It is discarded without
    /// consuming a pending `steps_into_future` decrement; the decrement
    /// belongs to the newer broadcast the channel still holds.
    ///
    /// # Errors
    /// - [`RampartError::WrongRole`] on the authority.
    /// - [`RampartError::InvalidTick`] for a null-tick broadcast.
    pub fn apply_correction(
        &mut self,
        scheduler: &mut AlarmScheduler,
        broadcast: &CorrectionBroadcast,
    ) -> Result<CorrectionOutcome, RampartError> {
        if self.role.is_authority() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Counter,
                "apply_correction refused: the authority does not correct itself"
            );
            return Err(RampartError::WrongRole {
                expected: Role::Owner,
                actual: self.role,
            });
        }
        if broadcast.tick.is_null() {
            return Err(RampartError::InvalidTick {
                tick: broadcast.tick,
                reason: "corrections must carry a valid tick".to_owned(),
            });
        }
        if self.last_correction_tick.is_valid() && broadcast.tick < self.last_correction_tick {
            // Keep-last channel: an older tick is a redelivery, not a missed
            // reply. Its decrement stays pending for the newer broadcast.
            return Ok(CorrectionOutcome::Stale);
        }
        self.last_correction_tick = broadcast.tick;

        if self.steps_into_future > 0 {
            self.steps_into_future -= 1;
            if self.steps_into_future > 0 {
                // Still ahead of the authority: this correction answers a
                // prediction we have already superseded locally.
                return Ok(CorrectionOutcome::Stale);
            }
            self.merge_at_zero(scheduler, broadcast)?;
            return Ok(CorrectionOutcome::Applied);
        }

        // No outstanding predictions: the authority's word is final.
        self.adopt(scheduler, broadcast)?;
        Ok(CorrectionOutcome::Applied)
    }

    /// The four-way matrix: (last prediction kind) x (authority state).
    /// Every branch converges local state; none diverges further.
    fn merge_at_zero(
        &mut self,
        scheduler: &mut AlarmScheduler,
        broadcast: &CorrectionBroadcast,
    ) -> Result<(), RampartError> {
        match (self.is_last_prediction_start, broadcast.reloading) {
            // Predicted start, authority reloading: agreement. Merge the
            // authoritative end-point; the local countdown keeps running, so
            // there is no visible discontinuity.
            (true, true) => {
                self.reload_point = broadcast.reload_point;
                if !self.reloading {
                    // Local countdown already completed; fall back in line
                    // with the authority's still-running reload.
                    self.reloading = true;
                    self.restart_countdown(scheduler)?;
                }
            }
            // Predicted start, authority idle: our speculative reload
            // already completed from the authority's perspective. The
            // correction carries the reload's end value.
            (true, false) => {
                self.reload_point = broadcast.reload_point;
                self.reloading = false;
                self.stop_countdown(scheduler)?;
            }
            // Predicted cancel, authority reloading: the prediction was
            // wrong. Adopt the in-progress reload, restarting the local
            // countdown.
            (false, true) => {
                self.reload_point = broadcast.reload_point;
                self.reloading = true;
                self.restart_countdown(scheduler)?;
            }
            // Predicted cancel, authority idle: agreement. Adopt the
            // authoritative counter value.
            (false, false) => {
                self.reload_point = broadcast.reload_point;
                self.reloading = false;
                self.stop_countdown(scheduler)?;
            }
        }
        Ok(())
    }

    fn adopt(
        &mut self,
        scheduler: &mut AlarmScheduler,
        broadcast: &CorrectionBroadcast,
    ) -> Result<(), RampartError> {
        self.reload_point = broadcast.reload_point;
        let was_reloading = self.reloading;
        self.reloading = broadcast.reloading;
        if broadcast.reloading && !was_reloading {
            self.restart_countdown(scheduler)?;
        } else if !broadcast.reloading && was_reloading {
            self.stop_countdown(scheduler)?;
        }
        Ok(())
    }

    fn conclude_transition(&mut self, tick: Tick, was_start: bool) -> Option<CorrectionBroadcast> {
        if self.role.is_authority() {
            let broadcast = CorrectionBroadcast {
                tick,
                reload_point: self.reload_point,
                reloading: self.reloading,
            };
            self.latest_broadcast = Some(broadcast);
            Some(broadcast)
        } else {
            self.steps_into_future += 1;
            self.is_last_prediction_start = was_start;
            None
        }
    }

    fn require_author(&self, operation: &str) -> Result<(), RampartError> {
        if self.role.may_author_input() {
            return Ok(());
        }
        report_violation!(
            ViolationSeverity::Error,
            ViolationKind::Counter,
            "{} refused: {} peers do not author actions",
            operation,
            self.role
        );
        Err(RampartError::WrongRole {
            expected: Role::Owner,
            actual: self.role,
        })
    }

    fn restart_countdown(&self, scheduler: &mut AlarmScheduler) -> Result<(), RampartError> {
        if let Some(handle) = self.reload_alarm {
            scheduler.reset(handle, self.config.reload_duration)?;
            scheduler.start(handle)?;
        }
        Ok(())
    }

    fn stop_countdown(&self, scheduler: &mut AlarmScheduler) -> Result<(), RampartError> {
        if let Some(handle) = self.reload_alarm {
            scheduler.stop(handle)?;
        }
        Ok(())
    }
}

impl InvariantChecker for CounterReconciler {
    fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        if self.role.is_authority() && self.steps_into_future != 0 {
            violations.push(
                InvariantViolation::new("CounterReconciler", "authority has speculative steps")
                    .with_details(format!("steps_into_future={}", self.steps_into_future)),
            );
        }
        if self.shots_fired > self.reload_point {
            violations.push(
                InvariantViolation::new("CounterReconciler", "shots exceed the reload threshold")
                    .with_details(format!(
                        "shots_fired={} reload_point={}",
                        self.shots_fired, self.reload_point
                    )),
            );
        }
        violations
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config() -> CounterConfig {
        CounterConfig {
            magazine: 8,
            reload_duration: 1.5,
            initial_reload_point: 10,
        }
    }

    fn pair() -> (AlarmScheduler, CounterReconciler) {
        (
            AlarmScheduler::new(),
            CounterReconciler::new(Role::Owner, config()).unwrap(),
        )
    }

    fn authority() -> (AlarmScheduler, CounterReconciler) {
        (
            AlarmScheduler::new(),
            CounterReconciler::new(Role::Authority, config()).unwrap(),
        )
    }

    // ==========================================
    // Configuration
    // ==========================================

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(CounterReconciler::new(
            Role::Owner,
            CounterConfig {
                magazine: 0,
                ..config()
            }
        )
        .is_err());
        assert!(CounterReconciler::new(
            Role::Owner,
            CounterConfig {
                reload_duration: 0.0,
                ..config()
            }
        )
        .is_err());
        assert!(CounterReconciler::new(
            Role::Owner,
            CounterConfig {
                initial_reload_point: 0,
                ..config()
            }
        )
        .is_err());
    }

    // ==========================================
    // Consuming
    // ==========================================

    #[test]
    fn try_consume_respects_threshold() {
        let (_, mut counter) = pair();
        for _ in 0..10 {
            assert!(counter.try_consume());
        }
        assert_eq!(counter.shots_fired(), 10);
        assert!(!counter.try_consume());
        assert_eq!(counter.shots_fired(), 10);
    }

    #[test]
    fn try_consume_refused_while_reloading() {
        let (mut scheduler, mut counter) = pair();
        assert!(counter.try_consume());
        counter.start_reload(&mut scheduler, Tick::new(1)).unwrap();
        assert!(!counter.try_consume());
    }

    #[test]
    fn observer_cannot_consume_or_reload() {
        let mut scheduler = AlarmScheduler::new();
        let mut counter = CounterReconciler::new(Role::Observer, config()).unwrap();
        assert!(!counter.try_consume());
        assert!(matches!(
            counter.start_reload(&mut scheduler, Tick::new(1)),
            Err(RampartError::WrongRole { .. })
        ));
    }

    // ==========================================
    // Reload transitions
    // ==========================================

    #[test]
    fn authority_reload_broadcasts_and_keeps_last() {
        let (mut scheduler, mut counter) = authority();
        let broadcast = counter
            .start_reload(&mut scheduler, Tick::new(5))
            .unwrap()
            .unwrap();
        assert_eq!(broadcast.reload_point, 18);
        assert!(broadcast.reloading);
        assert_eq!(counter.latest_broadcast(), Some(broadcast));

        let cancel = counter
            .cancel_reload(&mut scheduler, Tick::new(6))
            .unwrap()
            .unwrap();
        assert_eq!(cancel.reload_point, 10);
        assert!(!cancel.reloading);
        assert_eq!(counter.latest_broadcast(), Some(cancel));
    }

    #[test]
    fn owner_reload_is_speculative() {
        let (mut scheduler, mut counter) = pair();
        assert!(counter
            .start_reload(&mut scheduler, Tick::new(5))
            .unwrap()
            .is_none());
        assert_eq!(counter.steps_into_future(), 1);
        assert_eq!(counter.reload_point(), 18);
        assert!(counter.is_reloading());

        assert!(counter
            .cancel_reload(&mut scheduler, Tick::new(6))
            .unwrap()
            .is_none());
        assert_eq!(counter.steps_into_future(), 2);
        assert_eq!(counter.reload_point(), 10);
        assert!(!counter.is_reloading());
    }

    #[test]
    fn redundant_transitions_are_noops() {
        let (mut scheduler, mut counter) = pair();
        assert!(counter
            .cancel_reload(&mut scheduler, Tick::new(1))
            .unwrap()
            .is_none());
        assert_eq!(counter.steps_into_future(), 0);

        counter.start_reload(&mut scheduler, Tick::new(2)).unwrap();
        assert!(counter
            .start_reload(&mut scheduler, Tick::new(3))
            .unwrap()
            .is_none());
        assert_eq!(counter.steps_into_future(), 1);
    }

    // ==========================================
    // Countdown
    // ==========================================

    #[test]
    fn reload_completes_when_alarm_fires() {
        let (mut scheduler, mut counter) = pair();
        let root = scheduler.root();
        counter
            .bind_reload_alarm(&mut scheduler, root)
            .unwrap();
        for _ in 0..10 {
            counter.try_consume();
        }
        assert!(!counter.try_consume());

        counter.start_reload(&mut scheduler, Tick::new(1)).unwrap();
        let fired = scheduler.advance(1.5);
        counter.service(&fired, Tick::new(2));
        assert!(!counter.is_reloading());
        // Threshold was raised at start; shots resume up to it.
        assert!(counter.try_consume());
        assert_eq!(counter.shots_fired(), 11);
    }

    #[test]
    fn cancel_stops_the_countdown() {
        let (mut scheduler, mut counter) = pair();
        let root = scheduler.root();
        counter
            .bind_reload_alarm(&mut scheduler, root)
            .unwrap();
        counter.start_reload(&mut scheduler, Tick::new(1)).unwrap();
        counter.cancel_reload(&mut scheduler, Tick::new(2)).unwrap();
        let fired = scheduler.advance(10.0);
        assert!(counter.service(&fired, Tick::new(3)).is_none());
        assert!(!counter.is_reloading());
    }

    // ==========================================
    // Corrections
    // ==========================================

    fn correction(tick: u64, reload_point: u32, reloading: bool) -> CorrectionBroadcast {
        CorrectionBroadcast {
            tick: Tick::new(tick),
            reload_point,
            reloading,
        }
    }

    #[test]
    fn authority_never_applies_corrections() {
        let (mut scheduler, mut counter) = authority();
        assert!(matches!(
            counter.apply_correction(&mut scheduler, &correction(1, 18, true)),
            Err(RampartError::WrongRole { .. })
        ));
    }

    #[test]
    fn corrections_behind_newer_predictions_are_discarded() {
        let (mut scheduler, mut counter) = pair();
        counter.start_reload(&mut scheduler, Tick::new(1)).unwrap();
        counter.cancel_reload(&mut scheduler, Tick::new(2)).unwrap();
        assert_eq!(counter.steps_into_future(), 2);

        // Answer to the start: superseded by the local cancel.
        let outcome = counter
            .apply_correction(&mut scheduler, &correction(1, 18, true))
            .unwrap();
        assert_eq!(outcome, CorrectionOutcome::Stale);
        assert_eq!(counter.steps_into_future(), 1);
        // Local state untouched by the stale correction.
        assert_eq!(counter.reload_point(), 10);
        assert!(!counter.is_reloading());

        // Answer to the cancel: merges.
        let outcome = counter
            .apply_correction(&mut scheduler, &correction(2, 10, false))
            .unwrap();
        assert_eq!(outcome, CorrectionOutcome::Applied);
        assert_eq!(counter.steps_into_future(), 0);
    }

    #[test]
    fn redelivered_older_corrections_do_not_consume_a_decrement() {
        let (mut scheduler, mut counter) = pair();
        counter.start_reload(&mut scheduler, Tick::new(1)).unwrap();
        counter.cancel_reload(&mut scheduler, Tick::new(2)).unwrap();
        assert_eq!(counter.steps_into_future(), 2);

        // The cancel's answer arrives first and burns one step.
        let outcome = counter
            .apply_correction(&mut scheduler, &correction(2, 10, false))
            .unwrap();
        assert_eq!(outcome, CorrectionOutcome::Stale);
        assert_eq!(counter.steps_into_future(), 1);

        // A redelivery of the start's older answer is discarded outright;
        // the remaining step stays pending.
        let outcome = counter
            .apply_correction(&mut scheduler, &correction(1, 18, true))
            .unwrap();
        assert_eq!(outcome, CorrectionOutcome::Stale);
        assert_eq!(counter.steps_into_future(), 1);

        // The keep-last channel redelivers the newest broadcast, which
        // settles the remaining step.
        let outcome = counter
            .apply_correction(&mut scheduler, &correction(2, 10, false))
            .unwrap();
        assert_eq!(outcome, CorrectionOutcome::Applied);
        assert_eq!(counter.steps_into_future(), 0);
    }

    #[test]
    fn matrix_predict_start_authority_reloading() {
        let (mut scheduler, mut counter) = pair();
        let root = scheduler.root();
        counter
            .bind_reload_alarm(&mut scheduler, root)
            .unwrap();
        counter.start_reload(&mut scheduler, Tick::new(100)).unwrap();
        scheduler.advance(0.5);
        let remaining_before = scheduler
            .remaining(counter.reload_alarm_handle().unwrap())
            .unwrap();

        let outcome = counter
            .apply_correction(&mut scheduler, &correction(100, 18, true))
            .unwrap();
        assert_eq!(outcome, CorrectionOutcome::Applied);
        assert_eq!(counter.steps_into_future(), 0);
        assert_eq!(counter.reload_point(), 18);
        assert!(counter.is_reloading());
        // No discontinuity: the local countdown was not restarted.
        let remaining_after = scheduler
            .remaining(counter.reload_alarm_handle().unwrap())
            .unwrap();
        assert!((remaining_after - remaining_before).abs() < 1e-12);
    }

    #[test]
    fn matrix_predict_start_authority_idle() {
        let (mut scheduler, mut counter) = pair();
        counter.start_reload(&mut scheduler, Tick::new(100)).unwrap();

        // The authority already finished this reload; the correction carries
        // the end value.
        let outcome = counter
            .apply_correction(&mut scheduler, &correction(100, 18, false))
            .unwrap();
        assert_eq!(outcome, CorrectionOutcome::Applied);
        assert_eq!(counter.steps_into_future(), 0);
        assert_eq!(counter.reload_point(), 18);
        assert!(!counter.is_reloading());
    }

    #[test]
    fn matrix_predict_cancel_authority_reloading() {
        let (mut scheduler, mut counter) = pair();
        let root = scheduler.root();
        counter
            .bind_reload_alarm(&mut scheduler, root)
            .unwrap();
        counter.start_reload(&mut scheduler, Tick::new(100)).unwrap();
        counter.cancel_reload(&mut scheduler, Tick::new(101)).unwrap();
        // Burn both prediction answers; the second is the wrong cancel.
        counter
            .apply_correction(&mut scheduler, &correction(100, 18, true))
            .unwrap();
        let outcome = counter
            .apply_correction(&mut scheduler, &correction(101, 18, true))
            .unwrap();

        // Prediction was wrong: adopt the in-progress reload and restart the
        // local countdown.
        assert_eq!(outcome, CorrectionOutcome::Applied);
        assert_eq!(counter.reload_point(), 18);
        assert!(counter.is_reloading());
        let handle = counter.reload_alarm_handle().unwrap();
        assert!(scheduler.is_started(handle).unwrap());
        assert!(
            (scheduler.remaining(handle).unwrap() - config().reload_duration).abs() < 1e-12
        );
    }

    #[test]
    fn matrix_predict_cancel_authority_idle() {
        let (mut scheduler, mut counter) = pair();
        counter.start_reload(&mut scheduler, Tick::new(100)).unwrap();
        counter.cancel_reload(&mut scheduler, Tick::new(101)).unwrap();
        counter
            .apply_correction(&mut scheduler, &correction(100, 18, true))
            .unwrap();
        let outcome = counter
            .apply_correction(&mut scheduler, &correction(101, 10, false))
            .unwrap();

        assert_eq!(outcome, CorrectionOutcome::Applied);
        assert_eq!(counter.reload_point(), 10);
        assert!(!counter.is_reloading());
    }

    #[test]
    fn zero_steps_adopts_outright() {
        let (mut scheduler, mut counter) = pair();
        let root = scheduler.root();
        counter
            .bind_reload_alarm(&mut scheduler, root)
            .unwrap();
        let outcome = counter
            .apply_correction(&mut scheduler, &correction(50, 26, true))
            .unwrap();
        assert_eq!(outcome, CorrectionOutcome::Applied);
        assert_eq!(counter.reload_point(), 26);
        assert!(counter.is_reloading());
        assert!(scheduler
            .is_started(counter.reload_alarm_handle().unwrap())
            .unwrap());
    }

    #[test]
    fn older_tick_corrections_are_superseded() {
        let (mut scheduler, mut counter) = pair();
        counter
            .apply_correction(&mut scheduler, &correction(10, 18, false))
            .unwrap();
        let outcome = counter
            .apply_correction(&mut scheduler, &correction(9, 26, true))
            .unwrap();
        assert_eq!(outcome, CorrectionOutcome::Stale);
        assert_eq!(counter.reload_point(), 18);
    }

    #[test]
    fn null_tick_corrections_are_rejected() {
        let (mut scheduler, mut counter) = pair();
        let broadcast = CorrectionBroadcast {
            tick: Tick::NULL,
            reload_point: 18,
            reloading: false,
        };
        assert!(matches!(
            counter.apply_correction(&mut scheduler, &broadcast),
            Err(RampartError::InvalidTick { .. })
        ));
    }

    // ==========================================
    // End-to-end scenario
    // ==========================================

    #[test]
    fn tick_100_reload_scenario() {
        let (mut owner_scheduler, mut owner) = pair();
        let (mut authority_scheduler, mut authority) = authority();

        // Both sides burn through 10 shots by tick 100.
        for _ in 0..8 {
            assert!(owner.try_consume());
            assert!(authority.try_consume());
        }
        assert!(owner.try_consume());
        assert!(owner.try_consume());
        assert!(authority.try_consume());
        assert!(authority.try_consume());
        assert_eq!(owner.shots_fired(), 10);
        assert_eq!(owner.reload_point(), 10);

        // Owner predicts the reload at tick 100.
        owner
            .start_reload(&mut owner_scheduler, Tick::new(100))
            .unwrap();
        assert_eq!(owner.steps_into_future(), 1);

        // Authority independently starts it and broadcasts reload_point=18.
        let broadcast = authority
            .start_reload(&mut authority_scheduler, Tick::new(100))
            .unwrap()
            .unwrap();
        assert_eq!(broadcast.reload_point, 18);

        // The correction merges: predict-start x authority-reloading.
        let outcome = owner
            .apply_correction(&mut owner_scheduler, &broadcast)
            .unwrap();
        assert_eq!(outcome, CorrectionOutcome::Applied);
        assert_eq!(owner.steps_into_future(), 0);
        assert_eq!(owner.reload_point(), 18);
        assert!(owner.is_reloading());
        assert!(owner.check_invariants().is_empty());
    }
}
