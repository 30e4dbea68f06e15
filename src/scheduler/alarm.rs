//! The alarm state machine: countdown state, trigger semantics, and the
//! re-entrant control view handed to callbacks.

use smallvec::SmallVec;

use crate::error::RampartError;

/// Callback invoked when an alarm fires.
///
/// The callback receives an [`AlarmCtl`] view of its own alarm, so re-entrant
/// logic (an alarm that stops, disarms, or destroys itself when it fires) is
/// expressed directly. Changes made through the view take effect for the
/// *next* crossing; the current crossing's post-trigger state has already been
/// computed from the pre-callback settings snapshot.
pub type AlarmCallback = Box<dyn FnMut(&mut AlarmCtl<'_>)>;

/// Configuration for a new alarm.
///
/// Defaults mirror the common case: started, armed, auto-restarting and
/// auto-rearming, not destroyed on trigger, first trigger after one full
/// `cooldown`.
///
/// # Example
///
/// ```
/// use rampart::AlarmSpec;
///
/// // A one-shot timeout: fires once after 2.5s, then removes itself.
/// let timeout = AlarmSpec::new(2.5).one_shot();
///
/// // A cooldown gate: counts down but does not fire; gameplay polls it.
/// let gate = AlarmSpec::new(0.8).armed(false);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmSpec {
    /// The alarm period, in seconds. Must be positive.
    pub cooldown: f64,
    /// Whether the alarm counts down immediately on creation.
    pub start_immediately: bool,
    /// Whether the alarm fires when it reaches zero, or idles there.
    pub arm_immediately: bool,
    /// Whether the alarm keeps counting down after it fires.
    pub auto_restart: bool,
    /// Whether the alarm stays armed after it fires.
    pub auto_rearm: bool,
    /// Seconds until the first trigger; `None` means one full `cooldown`.
    pub initial_remaining: Option<f64>,
    /// Whether the alarm removes itself after its first trigger.
    pub destroy_after_triggered: bool,
}

impl AlarmSpec {
    /// Creates a spec with the given cooldown and default flags.
    ///
    /// The cooldown is validated when the alarm is added to a scheduler, not
    /// here; non-positive cooldowns are rejected at creation time with
    /// [`RampartError::InvalidCooldown`].
    #[must_use]
    pub fn new(cooldown: f64) -> Self {
        Self {
            cooldown,
            start_immediately: true,
            arm_immediately: true,
            auto_restart: true,
            auto_rearm: true,
            initial_remaining: None,
            destroy_after_triggered: false,
        }
    }

    /// Sets whether the alarm starts counting down immediately.
    #[must_use]
    pub fn started(mut self, start: bool) -> Self {
        self.start_immediately = start;
        self
    }

    /// Sets whether the alarm is armed (will fire at zero) immediately.
    #[must_use]
    pub fn armed(mut self, arm: bool) -> Self {
        self.arm_immediately = arm;
        self
    }

    /// Sets whether the alarm keeps counting down after firing.
    #[must_use]
    pub fn auto_restart(mut self, restart: bool) -> Self {
        self.auto_restart = restart;
        self
    }

    /// Sets whether the alarm stays armed after firing.
    #[must_use]
    pub fn auto_rearm(mut self, rearm: bool) -> Self {
        self.auto_rearm = rearm;
        self
    }

    /// Sets the time until the first trigger, overriding the full cooldown.
    #[must_use]
    pub fn initial_remaining(mut self, remaining: f64) -> Self {
        self.initial_remaining = Some(remaining);
        self
    }

    /// Marks the alarm for removal after its first trigger.
    #[must_use]
    pub fn destroy_after_triggered(mut self, destroy: bool) -> Self {
        self.destroy_after_triggered = destroy;
        self
    }

    /// Convenience preset: fire once, then remove the alarm.
    #[must_use]
    pub fn one_shot(self) -> Self {
        self.destroy_after_triggered(true)
    }

    /// Returns an error if the spec cannot produce a valid alarm.
    pub(crate) fn validate(&self) -> Result<(), RampartError> {
        if !(self.cooldown > 0.0) {
            return Err(RampartError::InvalidCooldown {
                cooldown: self.cooldown,
            });
        }
        if let Some(remaining) = self.initial_remaining {
            if remaining < 0.0 || !remaining.is_finite() {
                return Err(RampartError::InvalidRequest {
                    info: format!("initial_remaining must be non-negative, got {}", remaining),
                });
            }
        }
        Ok(())
    }
}

/// One alarm owned by a scheduler node.
///
/// Invariants:
/// - an alarm that is not started never changes `remaining`;
/// - a started-but-unarmed alarm converges to `remaining == 0` and stays
///   there;
/// - a started-and-armed alarm fires exactly once per cooldown crossing.
pub(crate) struct Alarm {
    pub(crate) cooldown: f64,
    pub(crate) remaining: f64,
    pub(crate) is_started: bool,
    pub(crate) is_armed: bool,
    pub(crate) auto_restart: bool,
    pub(crate) auto_rearm: bool,
    pub(crate) destroy_after_triggered: bool,
    pub(crate) callback: Option<AlarmCallback>,
}

impl std::fmt::Debug for Alarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alarm")
            .field("cooldown", &self.cooldown)
            .field("remaining", &self.remaining)
            .field("is_started", &self.is_started)
            .field("is_armed", &self.is_armed)
            .field("auto_restart", &self.auto_restart)
            .field("auto_rearm", &self.auto_rearm)
            .field("destroy_after_triggered", &self.destroy_after_triggered)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl Alarm {
    pub(crate) fn from_spec(spec: &AlarmSpec, callback: Option<AlarmCallback>) -> Self {
        Self {
            cooldown: spec.cooldown,
            remaining: spec.initial_remaining.unwrap_or(spec.cooldown),
            is_started: spec.start_immediately,
            is_armed: spec.arm_immediately,
            auto_restart: spec.auto_restart,
            auto_rearm: spec.auto_rearm,
            destroy_after_triggered: spec.destroy_after_triggered,
            callback,
        }
    }

    /// Returns true while the alarm ticks and will fire at zero.
    pub(crate) fn is_ticking(&self) -> bool {
        self.is_started && self.is_armed
    }

    /// Processes one trigger crossing at `fired_at` (node-local offset within
    /// the current advance).
    ///
    /// The post-trigger state is computed from the settings snapshot *before*
    /// the callback runs, then the callback may adjust the alarm for the next
    /// crossing. Returns `true` if the alarm asked to be destroyed.
    pub(crate) fn fire(&mut self, fired_at: f64) -> bool {
        // Post-trigger state from the pre-callback snapshot.
        let mut destroy = self.destroy_after_triggered;
        self.remaining = self.cooldown;
        if !destroy {
            self.is_started = self.auto_restart;
            self.is_armed = self.auto_rearm;
        }

        // The callback is taken out for the call so the control view is the
        // only live borrow of the alarm.
        if let Some(mut callback) = self.callback.take() {
            {
                let mut ctl = AlarmCtl {
                    alarm: self,
                    destroy: &mut destroy,
                    fired_at,
                };
                callback(&mut ctl);
            }
            self.callback = Some(callback);
        }
        destroy
    }

    /// Advances this alarm by `dt` seconds of node-local time, firing every
    /// crossing. Crossing offsets (seconds into this advance) are appended to
    /// `fires`. Returns `true` if the alarm destroyed itself.
    ///
    /// Cooldowns shorter than `dt` trigger multiple times within one call;
    /// the loop walks crossing to crossing, so a callback that stops or
    /// disarms the alarm suppresses the remaining crossings of the same
    /// advance.
    pub(crate) fn advance(&mut self, dt: f64, fires: &mut SmallVec<[f64; 4]>) -> bool {
        if dt <= 0.0 || !self.is_started {
            return false;
        }

        let mut elapsed = 0.0;
        loop {
            if !self.is_started {
                // Stopped mid-advance (by its own callback): freeze remaining.
                return false;
            }
            if !self.is_armed {
                // Unarmed alarms idle at zero instead of firing.
                self.remaining = (self.remaining - (dt - elapsed)).max(0.0);
                return false;
            }
            let until_crossing = self.remaining;
            if until_crossing > dt - elapsed {
                self.remaining -= dt - elapsed;
                return false;
            }
            elapsed += until_crossing;
            fires.push(elapsed);
            if self.fire(elapsed) {
                return true;
            }
        }
    }
}

/// Re-entrant control view of the alarm currently firing.
///
/// Handed to [`AlarmCallback`]s so an alarm can stop, disarm, rearm, reset or
/// destroy *itself* from inside its own trigger. The view deliberately cannot
/// reach the scheduler or other alarms; cross-alarm reactions belong in the
/// caller's handling of [`AlarmFired`](crate::AlarmFired) events.
#[derive(Debug)]
pub struct AlarmCtl<'a> {
    alarm: &'a mut Alarm,
    destroy: &'a mut bool,
    fired_at: f64,
}

impl AlarmCtl<'_> {
    /// Node-local time offset (seconds into the current advance) at which
    /// this crossing occurred.
    #[must_use]
    pub fn fired_at(&self) -> f64 {
        self.fired_at
    }

    /// The alarm's cooldown, in seconds.
    #[must_use]
    pub fn cooldown(&self) -> f64 {
        self.alarm.cooldown
    }

    /// Seconds until the next trigger, as computed for this crossing.
    #[must_use]
    pub fn remaining(&self) -> f64 {
        self.alarm.remaining
    }

    /// Stops the countdown; `remaining` freezes until restarted.
    pub fn stop(&mut self) {
        self.alarm.is_started = false;
    }

    /// Restarts the countdown.
    pub fn start(&mut self) {
        self.alarm.is_started = true;
    }

    /// Disarms the alarm; it converges to zero without firing.
    pub fn disarm(&mut self) {
        self.alarm.is_armed = false;
    }

    /// Rearms the alarm.
    pub fn arm(&mut self) {
        self.alarm.is_armed = true;
    }

    /// Replaces the cooldown and restarts the countdown from it.
    ///
    /// # Errors
    /// Returns [`RampartError::InvalidCooldown`] for non-positive cooldowns;
    /// the alarm is left unchanged.
    pub fn reset(&mut self, new_cooldown: f64) -> Result<(), RampartError> {
        if !(new_cooldown > 0.0) {
            return Err(RampartError::InvalidCooldown {
                cooldown: new_cooldown,
            });
        }
        self.alarm.cooldown = new_cooldown;
        self.alarm.remaining = new_cooldown;
        Ok(())
    }

    /// Removes the alarm after this crossing.
    pub fn destroy(&mut self) {
        *self.destroy = true;
    }
}

// #########
// # TESTS #
// #########
