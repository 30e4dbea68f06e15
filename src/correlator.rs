//! Bounded rendezvous correlation for speculative object creation.
//!
//! When an owner fires, it creates a placeholder projectile immediately; the
//! authority independently issues a spawn ticket for the same shot. Either
//! side's message can arrive first. The correlator matches the two streams:
//! a new ticket binds the oldest waiting placeholder, a new placeholder binds
//! the oldest waiting ticket, and whichever has no counterpart yet waits in a
//! bounded FIFO.
//!
//! Waiting is bounded two ways:
//!
//! - **Capacity**: each queue holds at most `capacity` entries. Inserting
//!   into a full queue evicts the oldest entry and resolves it immediately:
//!   tickets fail open (materialize a real object at the ticket's pose),
//!   placeholders are rejected (disposal returns to the requester, distinct
//!   from normal removal).
//! - **Age**: a watchdog alarm sweeps both queues, resolving entries older
//!   than `max_wait` by the same rules. The correlator stops its own alarm
//!   while both queues are empty and restarts it on the next insertion, so an
//!   entry submitted at tick T is resolved no later than
//!   `T + ceil(max_wait / dt)` regardless of queue occupancy.
//!
//! Invariant: immediately after any submit, at most one queue is non-empty.
//! Every submit drains the opposite queue before touching its own.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::error::RampartError;
use crate::messages::Pose;
use crate::report_violation;
use crate::scheduler::{AlarmFired, AlarmHandle, AlarmScheduler, AlarmSpec, NodeId};
use crate::telemetry::{
    invariant_checking_enabled, InvariantChecker, InvariantViolation, ViolationKind,
    ViolationSeverity,
};
use crate::Tick;

// ############
// # MESSAGES #
// ############

/// An authority-side spawn that has no matching placeholder yet.
#[derive(Debug, Copy, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SpawnTicket {
    /// The tick the authority spawned at.
    pub tick: Tick,
    /// The authoritative spawn pose.
    pub pose: Pose,
}

// ##########
// # TRAITS #
// ##########

/// A speculatively created object awaiting authoritative confirmation.
///
/// The correlator repositions a placeholder to the ticket's authoritative
/// pose when the two bind.
pub trait Placeholder {
    /// The pose the placeholder was speculatively created at.
    fn pose(&self) -> Pose;

    /// Repositions the placeholder, called on bind with the ticket's pose.
    fn set_pose(&mut self, pose: Pose);
}

// ##########
// # CONFIG #
// ##########

/// Configuration for a [`SpawnCorrelator`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CorrelatorConfig {
    /// Capacity of each queue. Must be at least 1.
    pub capacity: usize,
    /// Maximum node-local seconds an entry may wait for its counterpart
    /// before the watchdog resolves it. Must be positive.
    pub max_wait: f64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            max_wait: 1.0,
        }
    }
}

// ############
// # OUTCOMES #
// ############

/// A resolved correlation, produced by submits, sweeps and evictions.
#[derive(Debug, PartialEq)]
pub enum Correlation<P> {
    /// A ticket and a placeholder matched. The placeholder has been
    /// repositioned to the authoritative pose and stamped with the tick; it
    /// is now globally visible.
    Bound {
        /// The authoritative spawn tick.
        tick: Tick,
        /// The bound placeholder.
        placeholder: P,
    },
    /// A ticket was evicted (capacity or age) without a counterpart.
    /// Fail-open: instantiate a real object at the ticket's pose.
    Materialized {
        /// The evicted ticket.
        ticket: SpawnTicket,
    },
    /// A placeholder was evicted (capacity or age) without a counterpart.
    /// Denied, not expired: disposal authority returns to the requester.
    Rejected {
        /// The evicted placeholder.
        placeholder: P,
    },
}

// ##############
// # CORRELATOR #
// ##############

#[derive(Debug, Clone, Copy)]
struct Watchdog {
    node: NodeId,
    handle: AlarmHandle,
    period: f64,
}

#[derive(Debug)]
struct Timed<T> {
    submitted_at: f64,
    value: T,
}

/// Matches authoritative spawn tickets against speculative placeholders
/// arriving in either order.
///
/// Time is node-local virtual seconds (an [`AlarmScheduler`] node clock), so
/// age-based eviction stays deterministic under replay and rate scaling.
#[derive(Debug)]
pub struct SpawnCorrelator<P> {
    config: CorrelatorConfig,
    tickets: VecDeque<Timed<SpawnTicket>>,
    placeholders: VecDeque<Timed<P>>,
    watchdog: Option<Watchdog>,
}

impl<P: Placeholder> SpawnCorrelator<P> {
    /// Creates a correlator.
    ///
    /// # Errors
    /// [`RampartError::InvalidRequest`] for a zero capacity or a non-positive
    /// `max_wait`.
    pub fn new(config: CorrelatorConfig) -> Result<Self, RampartError> {
        if config.capacity == 0 {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "correlator capacity must be at least 1"
            );
            return Err(RampartError::InvalidRequest {
                info: "correlator capacity must be at least 1".to_owned(),
            });
        }
        if !(config.max_wait > 0.0 && config.max_wait.is_finite()) {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "correlator max_wait must be positive and finite, got {}",
                config.max_wait
            );
            return Err(RampartError::InvalidRequest {
                info: format!(
                    "correlator max_wait must be positive and finite, got {}",
                    config.max_wait
                ),
            });
        }
        Ok(Self {
            config,
            tickets: VecDeque::with_capacity(config.capacity),
            placeholders: VecDeque::with_capacity(config.capacity),
            watchdog: None,
        })
    }

    /// `true` when both queues are empty.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.tickets.is_empty() && self.placeholders.is_empty()
    }

    /// Number of tickets waiting for a placeholder.
    #[must_use]
    pub fn pending_tickets(&self) -> usize {
        self.tickets.len()
    }

    /// Number of placeholders waiting for a ticket.
    #[must_use]
    pub fn pending_placeholders(&self) -> usize {
        self.placeholders.len()
    }

    /// Submits an authority-side spawn ticket at node-local time `now`.
    ///
    /// Drains the opposite queue first: a waiting placeholder binds
    /// immediately. Otherwise the ticket is enqueued, evicting (and
    /// resolving, fail-open) the oldest ticket if the queue is full.
    ///
    /// Returns the resolutions this submit produced, in resolution order.
    pub fn submit_ticket(
        &mut self,
        tick: Tick,
        pose: Pose,
        now: f64,
    ) -> SmallVec<[Correlation<P>; 2]> {
        let mut resolved = SmallVec::new();
        if let Some(waiting) = self.placeholders.pop_front() {
            let mut placeholder = waiting.value;
            placeholder.set_pose(pose);
            resolved.push(Correlation::Bound { tick, placeholder });
        } else {
            if self.tickets.len() >= self.config.capacity {
                if let Some(evicted) = self.tickets.pop_front() {
                    resolved.push(Correlation::Materialized {
                        ticket: evicted.value,
                    });
                }
            }
            self.tickets.push_back(Timed {
                submitted_at: now,
                value: SpawnTicket { tick, pose },
            });
        }
        if invariant_checking_enabled() {
            self.assert_invariants();
        }
        resolved
    }

    /// Submits a speculative placeholder at node-local time `now`.
    ///
    /// Symmetric to [`submit_ticket`]: a waiting ticket binds immediately
    /// (the placeholder is repositioned to the ticket's pose); otherwise the
    /// placeholder is enqueued, evicting (and rejecting) the oldest
    /// placeholder if the queue is full.
    ///
    /// [`submit_ticket`]: SpawnCorrelator::submit_ticket
    pub fn submit_placeholder(&mut self, placeholder: P, now: f64) -> SmallVec<[Correlation<P>; 2]> {
        let mut resolved = SmallVec::new();
        if let Some(waiting) = self.tickets.pop_front() {
            let ticket = waiting.value;
            let mut placeholder = placeholder;
            placeholder.set_pose(ticket.pose);
            resolved.push(Correlation::Bound {
                tick: ticket.tick,
                placeholder,
            });
        } else {
            if self.placeholders.len() >= self.config.capacity {
                if let Some(evicted) = self.placeholders.pop_front() {
                    resolved.push(Correlation::Rejected {
                        placeholder: evicted.value,
                    });
                }
            }
            self.placeholders.push_back(Timed {
                submitted_at: now,
                value: placeholder,
            });
        }
        if invariant_checking_enabled() {
            self.assert_invariants();
        }
        resolved
    }

    /// Evicts and resolves every entry older than `max_wait` as of `now`.
    ///
    /// Entries are age-ordered within each queue, so the sweep pops from the
    /// front until it finds a young enough entry.
    pub fn sweep(&mut self, now: f64) -> Vec<Correlation<P>> {
        let mut resolved = Vec::new();
        while let Some(front) = self.tickets.front() {
            if now - front.submitted_at < self.config.max_wait {
                break;
            }
            if let Some(evicted) = self.tickets.pop_front() {
                resolved.push(Correlation::Materialized {
                    ticket: evicted.value,
                });
            }
        }
        while let Some(front) = self.placeholders.front() {
            if now - front.submitted_at < self.config.max_wait {
                break;
            }
            if let Some(evicted) = self.placeholders.pop_front() {
                resolved.push(Correlation::Rejected {
                    placeholder: evicted.value,
                });
            }
        }
        resolved
    }

    /// Binds the age watchdog to a scheduler node.
    ///
    /// Creates a recurring alarm with the given period on `node`, initially
    /// stopped. [`service`] starts it whenever entries are waiting and stops
    /// it once both queues are empty.
    ///
    /// # Errors
    /// - [`RampartError::UnknownNode`] if `node` is not live.
    /// - [`RampartError::InvalidCooldown`] for a non-positive period.
    ///
    /// [`service`]: SpawnCorrelator::service
    pub fn bind_watchdog(
        &mut self,
        scheduler: &mut AlarmScheduler,
        node: NodeId,
        period: f64,
    ) -> Result<(), RampartError> {
        if let Some(old) = self.watchdog.take() {
            // Stale binds are fine; the old alarm may be long gone.
            let _ = scheduler.remove(old.handle);
        }
        let handle = scheduler.add_alarm(node, AlarmSpec::new(period).started(false))?;
        self.watchdog = Some(Watchdog {
            node,
            handle,
            period,
        });
        Ok(())
    }

    /// The bound watchdog alarm, if any.
    #[must_use]
    pub fn watchdog_handle(&self) -> Option<AlarmHandle> {
        self.watchdog.map(|watchdog| watchdog.handle)
    }

    /// Drives the watchdog from the tick loop.
    ///
    /// Call once per tick after [`AlarmScheduler::advance`], passing the
    /// fired events. If the watchdog fired, sweeps both queues at the node's
    /// current clock; then starts or stops the alarm to match queue
    /// occupancy. A no-op until [`bind_watchdog`] is called.
    ///
    /// # Errors
    /// [`RampartError::AlarmRemoved`] / [`RampartError::UnknownNode`] if the
    /// bound alarm or node was removed behind the correlator's back.
    ///
    /// [`bind_watchdog`]: SpawnCorrelator::bind_watchdog
    pub fn service(
        &mut self,
        scheduler: &mut AlarmScheduler,
        fired: &[AlarmFired],
    ) -> Result<Vec<Correlation<P>>, RampartError> {
        let Some(watchdog) = self.watchdog else {
            return Ok(Vec::new());
        };
        let mut resolved = Vec::new();
        if fired.iter().any(|event| event.handle == watchdog.handle) {
            let now = scheduler.clock(watchdog.node)?;
            resolved = self.sweep(now);
        }
        if self.is_idle() {
            scheduler.stop(watchdog.handle)?;
        } else if !scheduler.is_started(watchdog.handle)? {
            // Fresh countdown on restart so the first sweep after an
            // insertion is a full period out.
            scheduler.reset(watchdog.handle, watchdog.period)?;
            scheduler.start(watchdog.handle)?;
        }
        Ok(resolved)
    }
}

impl<P: Placeholder> InvariantChecker for SpawnCorrelator<P> {
    fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        if !self.tickets.is_empty() && !self.placeholders.is_empty() {
            violations.push(
                InvariantViolation::new("SpawnCorrelator", "both queues non-empty").with_details(
                    format!(
                        "tickets={} placeholders={}",
                        self.tickets.len(),
                        self.placeholders.len()
                    ),
                ),
            );
        }
        if self.tickets.len() > self.config.capacity
            || self.placeholders.len() > self.config.capacity
        {
            violations.push(
                InvariantViolation::new("SpawnCorrelator", "queue exceeds capacity").with_details(
                    format!(
                        "capacity={} tickets={} placeholders={}",
                        self.config.capacity,
                        self.tickets.len(),
                        self.placeholders.len()
                    ),
                ),
            );
        }
        violations
    }
}

// #########
// # TESTS #
// #########
