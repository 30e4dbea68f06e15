//! Tick-synchronized prediction and reconciliation for continuous state.
//!
//! The owning peer simulates ahead of the authority: each tick it captures
//! local input into a [`ReplicateRecord`], steps its own state with it, and
//! sends the record to the authority. The authority steps from received
//! records (or coasts when none arrived) and emits one [`ReconcileSnapshot`]
//! per tick. On receipt, the owner snaps to the snapshot and replays every
//! buffered record newer than it, in tick order. Because the step function is
//! pure in `(state, input, dt)`, the rollback-replay is idempotent: the same
//! snapshot and records always produce the same final state.
//!
//! Missing input coasts instead of extrapolating: velocity damps to zero
//! while orientation is left untouched. This trades a velocity discontinuity
//! on input change against runaway extrapolation on input loss. The
//! alternative has known, different visible artifacts; keep this behavior.

use std::collections::VecDeque;

use crate::error::RampartError;
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{Role, SimConfig, Tick};

// ############
// # MESSAGES #
// ############

/// One tick of owner-authored input, replicated to the authority.
///
/// Delivery is unreliable, latest-wins per tick.
#[derive(Debug, Copy, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReplicateRecord<I> {
    /// The tick this input applies to.
    pub tick: Tick,
    /// The captured input.
    pub input: I,
}

/// One tick of authoritative physical state, sent to the owner.
///
/// Delivery is unreliable, one per tick, superseded by newer.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReconcileSnapshot<S> {
    /// The tick the state was sampled at, after that tick's step.
    pub tick: Tick,
    /// The authoritative physical state.
    pub state: S,
}

// ##########
// # CONFIG #
// ##########

/// Configuration for a [`PredictionLoop`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PredictionConfig {
    /// Maximum number of buffered [`ReplicateRecord`]s kept for replay.
    ///
    /// Bounds reconciliation memory; records older than the window are
    /// dropped oldest-first. A snapshot older than the whole window snaps
    /// without full replay, so size this to comfortably cover the worst
    /// expected authority round-trip in ticks.
    pub max_record_history: usize,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            max_record_history: 128,
        }
    }
}

// ##########
// # TRAITS #
// ##########

/// The deterministic step function supplied by gameplay.
///
/// Both methods must be pure: the same `(state, input, dt)` yields the same
/// output on every peer, every time. This is what makes rollback-replay
/// converge instead of drift.
pub trait Integrator<C: SimConfig> {
    /// Advances state by one tick under the given input.
    fn step(&self, state: &C::State, input: &C::Input, dt: f64) -> C::State;

    /// Advances state by one tick with no fresh input.
    ///
    /// The contract is held-last-heading, zero-thrust: damp velocity to zero
    /// and leave orientation untouched. Do not extrapolate stale velocity.
    fn coast(&self, state: &C::State, dt: f64) -> C::State;
}

// ########
// # LOOP #
// ########

/// Per-entity speculative simulation driver.
///
/// Construct one per predicted entity per peer, with the peer's [`Role`] for
/// that entity. Owner-only and authority-only operations are enforced: a
/// wrong-role call is reported via telemetry and refused without touching
/// state.
///
/// # Example
///
/// ```
/// use rampart::{Integrator, PredictionConfig, PredictionLoop, Role, SimConfig, Tick};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
/// struct Input { thrust: f64 }
///
/// #[derive(Clone, PartialEq, Debug)]
/// struct State { position: f64, velocity: f64 }
///
/// struct Cfg;
/// impl SimConfig for Cfg {
///     type Input = Input;
///     type State = State;
/// }
///
/// struct Euler;
/// impl Integrator<Cfg> for Euler {
///     fn step(&self, s: &State, i: &Input, dt: f64) -> State {
///         let velocity = s.velocity + i.thrust * dt;
///         State { position: s.position + velocity * dt, velocity }
///     }
///     fn coast(&self, s: &State, _dt: f64) -> State {
///         State { velocity: 0.0, ..s.clone() }
///     }
/// }
///
/// let mut owner = PredictionLoop::<Cfg, _>::new(
///     Role::Owner,
///     PredictionConfig::default(),
///     Euler,
///     1.0 / 60.0,
///     State { position: 0.0, velocity: 0.0 },
/// )
/// .unwrap();
///
/// let record = owner.capture(Tick::new(0), Input { thrust: 1.0 }).unwrap();
/// assert_eq!(record.tick, Tick::new(0));
/// assert!(owner.state().velocity > 0.0);
/// ```
pub struct PredictionLoop<C: SimConfig, I: Integrator<C>> {
    role: Role,
    config: PredictionConfig,
    integrator: I,
    dt: f64,
    state: C::State,
    /// Buffered records, ascending by tick, unique ticks.
    records: VecDeque<ReplicateRecord<C::Input>>,
    last_applied_snapshot: Tick,
    control_enabled: bool,
}

impl<C: SimConfig, I: Integrator<C>> PredictionLoop<C, I> {
    /// Creates a prediction loop for one entity.
    ///
    /// # Errors
    /// [`RampartError::InvalidRequest`] if `dt` is not positive and finite or
    /// the record history is zero.
    pub fn new(
        role: Role,
        config: PredictionConfig,
        integrator: I,
        dt: f64,
        initial_state: C::State,
    ) -> Result<Self, RampartError> {
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(RampartError::InvalidRequest {
                info: format!("tick delta-time must be positive and finite, got {}", dt),
            });
        }
        if config.max_record_history == 0 {
            return Err(RampartError::InvalidRequest {
                info: "max_record_history must be at least 1".to_owned(),
            });
        }
        Ok(Self {
            role,
            config,
            integrator,
            dt,
            state: initial_state,
            records: VecDeque::with_capacity(config.max_record_history),
            last_applied_snapshot: Tick::NULL,
            control_enabled: true,
        })
    }

    /// The current (possibly speculative) physical state.
    #[must_use]
    pub fn state(&self) -> &C::State {
        &self.state
    }

    /// This peer's role for the entity.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The tick of the most recently applied snapshot, [`Tick::NULL`] if none
    /// has been applied yet.
    #[must_use]
    pub fn last_applied_snapshot(&self) -> Tick {
        self.last_applied_snapshot
    }

    /// Number of records currently buffered for replay.
    #[must_use]
    pub fn buffered_records(&self) -> usize {
        self.records.len()
    }

    /// Whether input capture is live.
    #[must_use]
    pub fn control_enabled(&self) -> bool {
        self.control_enabled
    }

    /// Enables or disables the owner's control.
    ///
    /// Disabling freezes capture at "no input": subsequent [`capture`] calls
    /// record the [`Default`] input instead of the passed one. Reconciliation
    /// continues uninterrupted, and corrections for records already sent are
    /// still processed normally.
    ///
    /// [`capture`]: PredictionLoop::capture
    pub fn set_control_enabled(&mut self, enabled: bool) {
        self.control_enabled = enabled;
    }

    /// Owner: captures input for `tick`, steps local state with it, and
    /// returns the record to transmit to the authority.
    ///
    /// Capturing the same tick again replaces the buffered record
    /// (latest-wins) and re-steps from the current state.
    ///
    /// # Errors
    /// - [`RampartError::WrongRole`] if this peer may not author input.
    /// - [`RampartError::InvalidTick`] for the null tick or a tick older than
    ///   the newest buffered record.
    pub fn capture(
        &mut self,
        tick: Tick,
        input: C::Input,
    ) -> Result<ReplicateRecord<C::Input>, RampartError> {
        if !self.role.may_author_input() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Prediction,
                "capture refused: {} peers do not author input",
                self.role
            );
            return Err(RampartError::WrongRole {
                expected: Role::Owner,
                actual: self.role,
            });
        }
        if tick.is_null() {
            return Err(RampartError::InvalidTick {
                tick,
                reason: "cannot capture input for the null tick".to_owned(),
            });
        }
        if let Some(newest) = self.records.back() {
            if tick < newest.tick {
                return Err(RampartError::InvalidTick {
                    tick,
                    reason: format!("capture must be monotonic, newest record is {}", newest.tick),
                });
            }
        }
        let effective = if self.control_enabled {
            input
        } else {
            C::Input::default()
        };
        let record = ReplicateRecord {
            tick,
            input: effective,
        };
        self.buffer_record(record);
        self.state = self.integrator.step(&self.state, &record.input, self.dt);
        Ok(record)
    }

    /// Any peer: applies a received owner record for the current tick,
    /// stepping state with it and buffering it (latest-wins per tick).
    ///
    /// # Errors
    /// [`RampartError::InvalidTick`] for the null tick.
    pub fn apply_record(&mut self, record: ReplicateRecord<C::Input>) -> Result<(), RampartError> {
        if record.tick.is_null() {
            return Err(RampartError::InvalidTick {
                tick: record.tick,
                reason: "records must carry a valid tick".to_owned(),
            });
        }
        self.buffer_record(record);
        self.state = self.integrator.step(&self.state, &record.input, self.dt);
        Ok(())
    }

    /// Any peer: advances one tick with no fresh input, using the coast
    /// fallback (damp velocity, keep orientation).
    ///
    /// # Errors
    /// [`RampartError::InvalidTick`] for the null tick.
    pub fn tick_without_input(&mut self, tick: Tick) -> Result<(), RampartError> {
        if tick.is_null() {
            return Err(RampartError::InvalidTick {
                tick,
                reason: "cannot tick at the null tick".to_owned(),
            });
        }
        self.state = self.integrator.coast(&self.state, self.dt);
        Ok(())
    }

    /// Authority: samples the post-step state for `tick` as a snapshot to
    /// send to the owner.
    ///
    /// # Errors
    /// - [`RampartError::WrongRole`] if this peer is not the authority.
    /// - [`RampartError::InvalidTick`] for the null tick.
    pub fn snapshot(&self, tick: Tick) -> Result<ReconcileSnapshot<C::State>, RampartError> {
        if !self.role.is_authority() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Prediction,
                "snapshot refused: only the authority emits snapshots, this peer is the {}",
                self.role
            );
            return Err(RampartError::WrongRole {
                expected: Role::Authority,
                actual: self.role,
            });
        }
        if tick.is_null() {
            return Err(RampartError::InvalidTick {
                tick,
                reason: "snapshots must carry a valid tick".to_owned(),
            });
        }
        Ok(ReconcileSnapshot {
            tick,
            state: self.state.clone(),
        })
    }

    /// Owner/observer: reconciles against an authoritative snapshot.
    ///
    /// Overwrites local state with the snapshot, replays every buffered
    /// record with a newer tick in tick order, and discards records at or
    /// before the snapshot tick. Returns `false` when the snapshot is not
    /// newer than the last applied one and was dropped; dropping stale
    /// snapshots is expected steady-state, not an error.
    ///
    /// # Errors
    /// - [`RampartError::WrongRole`] on the authority; it never reconciles
    ///   against itself.
    /// - [`RampartError::InvalidTick`] for the null tick.
    pub fn reconcile(
        &mut self,
        snapshot: ReconcileSnapshot<C::State>,
    ) -> Result<bool, RampartError> {
        if self.role.is_authority() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Prediction,
                "reconcile refused: the authority does not reconcile against itself"
            );
            return Err(RampartError::WrongRole {
                expected: Role::Owner,
                actual: self.role,
            });
        }
        if snapshot.tick.is_null() {
            return Err(RampartError::InvalidTick {
                tick: snapshot.tick,
                reason: "snapshots must carry a valid tick".to_owned(),
            });
        }
        if self.last_applied_snapshot.is_valid() && snapshot.tick <= self.last_applied_snapshot {
            return Ok(false);
        }

        self.state = snapshot.state;
        while let Some(front) = self.records.front() {
            if front.tick > snapshot.tick {
                break;
            }
            self.records.pop_front();
        }
        for record in &self.records {
            self.state = self.integrator.step(&self.state, &record.input, self.dt);
        }
        self.last_applied_snapshot = snapshot.tick;
        Ok(true)
    }

    fn buffer_record(&mut self, record: ReplicateRecord<C::Input>) {
        match self.records.back_mut() {
            Some(newest) if newest.tick == record.tick => *newest = record,
            Some(newest) if newest.tick < record.tick => self.records.push_back(record),
            None => self.records.push_back(record),
            Some(_) => {
                // Out-of-order arrival (authority side, unordered channel).
                match self
                    .records
                    .binary_search_by(|buffered| buffered.tick.cmp(&record.tick))
                {
                    Ok(slot) => self.records[slot] = record,
                    Err(slot) => self.records.insert(slot, record),
                }
            }
        }
        while self.records.len() > self.config.max_record_history {
            self.records.pop_front();
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, PartialEq, Default, Debug, serde::Serialize, serde::Deserialize)]
    struct TestInput {
        thrust: f64,
        turn: f64,
    }

    #[derive(Clone, PartialEq, Debug)]
    struct TestState {
        position: f64,
        velocity: f64,
        heading: f64,
    }

    impl TestState {
        fn at_rest() -> Self {
            Self {
                position: 0.0,
                velocity: 0.0,
                heading: 0.0,
            }
        }
    }

    struct TestConfig;

    impl SimConfig for TestConfig {
        type Input = TestInput;
        type State = TestState;
    }

    struct Euler;

    impl Integrator<TestConfig> for Euler {
        fn step(&self, state: &TestState, input: &TestInput, dt: f64) -> TestState {
            let velocity = state.velocity + input.thrust * dt;
            TestState {
                position: state.position + velocity * dt,
                velocity,
                heading: state.heading + input.turn * dt,
            }
        }

        fn coast(&self, state: &TestState, _dt: f64) -> TestState {
            TestState {
                velocity: 0.0,
                ..state.clone()
            }
        }
    }

    const DT: f64 = 0.1;

    fn owner() -> PredictionLoop<TestConfig, Euler> {
        PredictionLoop::new(
            Role::Owner,
            PredictionConfig::default(),
            Euler,
            DT,
            TestState::at_rest(),
        )
        .unwrap()
    }

    fn authority() -> PredictionLoop<TestConfig, Euler> {
        PredictionLoop::new(
            Role::Authority,
            PredictionConfig::default(),
            Euler,
            DT,
            TestState::at_rest(),
        )
        .unwrap()
    }

    fn thrust(value: f64) -> TestInput {
        TestInput {
            thrust: value,
            turn: 0.0,
        }
    }

    // ==========================================
    // Construction
    // ==========================================

    #[test]
    fn rejects_bad_dt_and_empty_history() {
        assert!(PredictionLoop::<TestConfig, Euler>::new(
            Role::Owner,
            PredictionConfig::default(),
            Euler,
            0.0,
            TestState::at_rest(),
        )
        .is_err());

        assert!(PredictionLoop::<TestConfig, Euler>::new(
            Role::Owner,
            PredictionConfig {
                max_record_history: 0
            },
            Euler,
            DT,
            TestState::at_rest(),
        )
        .is_err());
    }

    // ==========================================
    // Capture
    // ==========================================

    #[test]
    fn capture_steps_and_buffers() {
        let mut owner = owner();
        let record = owner.capture(Tick::new(0), thrust(1.0)).unwrap();
        assert_eq!(record.tick, Tick::new(0));
        assert_eq!(record.input, thrust(1.0));
        assert_eq!(owner.buffered_records(), 1);
        assert_eq!(owner.state().velocity, 0.1);
    }

    #[test]
    fn observer_may_not_capture() {
        let mut observer = PredictionLoop::<TestConfig, Euler>::new(
            Role::Observer,
            PredictionConfig::default(),
            Euler,
            DT,
            TestState::at_rest(),
        )
        .unwrap();
        assert!(matches!(
            observer.capture(Tick::new(0), thrust(1.0)),
            Err(RampartError::WrongRole { .. })
        ));
        assert_eq!(observer.buffered_records(), 0);
    }

    #[test]
    fn capture_rejects_null_and_regressing_ticks() {
        let mut owner = owner();
        assert!(matches!(
            owner.capture(Tick::NULL, thrust(1.0)),
            Err(RampartError::InvalidTick { .. })
        ));
        owner.capture(Tick::new(5), thrust(1.0)).unwrap();
        assert!(matches!(
            owner.capture(Tick::new(4), thrust(1.0)),
            Err(RampartError::InvalidTick { .. })
        ));
    }

    #[test]
    fn recapturing_a_tick_is_latest_wins() {
        let mut owner = owner();
        owner.capture(Tick::new(0), thrust(1.0)).unwrap();
        owner.capture(Tick::new(0), thrust(-1.0)).unwrap();
        assert_eq!(owner.buffered_records(), 1);
    }

    #[test]
    fn disabled_control_captures_default_input() {
        let mut owner = owner();
        owner.set_control_enabled(false);
        let record = owner.capture(Tick::new(0), thrust(100.0)).unwrap();
        assert_eq!(record.input, TestInput::default());
        assert_eq!(owner.state().velocity, 0.0);

        owner.set_control_enabled(true);
        let record = owner.capture(Tick::new(1), thrust(1.0)).unwrap();
        assert_eq!(record.input, thrust(1.0));
    }

    #[test]
    fn history_is_bounded() {
        let mut owner = PredictionLoop::<TestConfig, Euler>::new(
            Role::Owner,
            PredictionConfig {
                max_record_history: 4,
            },
            Euler,
            DT,
            TestState::at_rest(),
        )
        .unwrap();
        for tick in 0..10u64 {
            owner.capture(Tick::new(tick), thrust(1.0)).unwrap();
        }
        assert_eq!(owner.buffered_records(), 4);
    }

    // ==========================================
    // Authority side
    // ==========================================

    #[test]
    fn authority_steps_from_records_and_coasts_without() {
        let mut authority = authority();
        authority
            .apply_record(ReplicateRecord {
                tick: Tick::new(0),
                input: thrust(1.0),
            })
            .unwrap();
        assert_eq!(authority.state().velocity, 0.1);

        // No record for tick 1: coast damps velocity, keeps heading.
        authority.tick_without_input(Tick::new(1)).unwrap();
        assert_eq!(authority.state().velocity, 0.0);
    }

    #[test]
    fn coast_keeps_orientation() {
        let mut authority = authority();
        authority
            .apply_record(ReplicateRecord {
                tick: Tick::new(0),
                input: TestInput {
                    thrust: 1.0,
                    turn: 2.0,
                },
            })
            .unwrap();
        let heading = authority.state().heading;
        assert!(heading > 0.0);
        authority.tick_without_input(Tick::new(1)).unwrap();
        assert_eq!(authority.state().heading, heading);
        assert_eq!(authority.state().velocity, 0.0);
    }

    #[test]
    fn only_authority_snapshots() {
        let owner = owner();
        assert!(matches!(
            owner.snapshot(Tick::new(0)),
            Err(RampartError::WrongRole { .. })
        ));
        let authority = authority();
        let snapshot = authority.snapshot(Tick::new(0)).unwrap();
        assert_eq!(snapshot.tick, Tick::new(0));
    }

    // ==========================================
    // Reconciliation
    // ==========================================

    #[test]
    fn reconcile_replays_newer_records() {
        let mut owner = owner();
        for tick in 0..6u64 {
            owner.capture(Tick::new(tick), thrust(1.0)).unwrap();
        }

        // Authority state as of tick 2: same inputs, so the replay from its
        // snapshot must land exactly on the owner's speculative state.
        let mut mirror = authority();
        for tick in 0..3u64 {
            mirror
                .apply_record(ReplicateRecord {
                    tick: Tick::new(tick),
                    input: thrust(1.0),
                })
                .unwrap();
        }
        let snapshot = mirror.snapshot(Tick::new(2)).unwrap();

        let speculative = owner.state().clone();
        assert!(owner.reconcile(snapshot).unwrap());
        assert_eq!(owner.state(), &speculative);
        // Records at or before the snapshot tick were discarded.
        assert_eq!(owner.buffered_records(), 3);
        assert_eq!(owner.last_applied_snapshot(), Tick::new(2));
    }

    #[test]
    fn reconcile_corrects_divergence() {
        let mut owner = owner();
        for tick in 0..4u64 {
            owner.capture(Tick::new(tick), thrust(1.0)).unwrap();
        }

        // Authority disagrees about tick 0 (e.g. the record was lost).
        let mut mirror = authority();
        mirror.tick_without_input(Tick::new(0)).unwrap();
        for tick in 1..2u64 {
            mirror
                .apply_record(ReplicateRecord {
                    tick: Tick::new(tick),
                    input: thrust(1.0),
                })
                .unwrap();
        }
        let snapshot = mirror.snapshot(Tick::new(1)).unwrap();
        let authoritative = snapshot.state.clone();

        assert!(owner.reconcile(snapshot).unwrap());
        // Replay of ticks 2..4 from the corrected base.
        let mut expected = authoritative;
        for _ in 0..2 {
            expected = Euler.step(&expected, &thrust(1.0), DT);
        }
        assert_eq!(owner.state(), &expected);
    }

    #[test]
    fn rollback_replay_is_idempotent() {
        let build = || {
            let mut owner = owner();
            for tick in 0..8u64 {
                owner
                    .capture(Tick::new(tick), thrust((tick as f64).sin()))
                    .unwrap();
            }
            owner
        };
        let snapshot = ReconcileSnapshot {
            tick: Tick::new(3),
            state: TestState {
                position: 42.0,
                velocity: -1.0,
                heading: 0.5,
            },
        };

        let mut first = build();
        let mut second = build();
        first.reconcile(snapshot.clone()).unwrap();
        second.reconcile(snapshot).unwrap();
        assert_eq!(first.state(), second.state());
    }

    #[test]
    fn stale_snapshots_are_dropped() {
        let mut owner = owner();
        for tick in 0..5u64 {
            owner.capture(Tick::new(tick), thrust(1.0)).unwrap();
        }
        let fresh = ReconcileSnapshot {
            tick: Tick::new(3),
            state: TestState::at_rest(),
        };
        let stale = ReconcileSnapshot {
            tick: Tick::new(2),
            state: TestState {
                position: 99.0,
                velocity: 99.0,
                heading: 99.0,
            },
        };
        assert!(owner.reconcile(fresh).unwrap());
        let reconciled = owner.state().clone();
        assert!(!owner.reconcile(stale).unwrap());
        assert_eq!(owner.state(), &reconciled);
        assert_eq!(owner.last_applied_snapshot(), Tick::new(3));
    }

    #[test]
    fn authority_never_reconciles() {
        let mut authority = authority();
        let snapshot = ReconcileSnapshot {
            tick: Tick::new(0),
            state: TestState::at_rest(),
        };
        assert!(matches!(
            authority.reconcile(snapshot),
            Err(RampartError::WrongRole { .. })
        ));
    }

    #[test]
    fn reconciliation_continues_while_control_disabled() {
        let mut owner = owner();
        owner.capture(Tick::new(0), thrust(1.0)).unwrap();
        owner.set_control_enabled(false);
        owner.capture(Tick::new(1), thrust(1.0)).unwrap();

        let snapshot = ReconcileSnapshot {
            tick: Tick::new(0),
            state: TestState::at_rest(),
        };
        assert!(owner.reconcile(snapshot).unwrap());
        // Tick 1 was captured as default input while disabled, so the replay
        // steps with no thrust.
        assert_eq!(owner.state().velocity, 0.0);
    }
}
