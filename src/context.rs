//! Explicit simulation context, replacing ambient global state.
//!
//! [`SimContext`] owns the [`AlarmScheduler`], the tick counter and the fixed
//! tick duration, and hands out scheduler nodes to registered collaborators.
//! Registration is keyed by [`RegisterContext`], a closed tagged union over
//! the known collaborator kinds, so lookups are exhaustive matches rather
//! than downcasts.
//!
//! Tick notifications use scoped ownership: [`SimContext::subscribe`] returns
//! a [`Subscription`] guard and dropping the guard unsubscribes. There is no
//! "is subscribed" flag to keep in sync with a lifecycle hook.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RampartError;
use crate::scheduler::{AlarmFired, AlarmScheduler, NodeId};
use crate::Tick;

// #########
// # ENUMS #
// #########

/// Identifies which collaborator is registering with the context.
///
/// This is a closed set. Matching on it is exhaustive, so adding a variant is
/// a compile-time event for every consumer rather than a runtime surprise.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RegisterContext {
    /// A prediction loop for a continuously-simulated entity.
    Prediction {
        /// The entity being predicted.
        entity: u64,
    },
    /// A spawn correlator for an entity's speculative projectiles.
    Spawning {
        /// The entity whose spawns are correlated.
        entity: u64,
    },
    /// A counter reconciler for an entity's ammunition.
    Ammunition {
        /// The entity whose ammunition is reconciled.
        entity: u64,
    },
}

impl RegisterContext {
    /// The entity this registration belongs to.
    #[must_use]
    pub fn entity(self) -> u64 {
        match self {
            RegisterContext::Prediction { entity }
            | RegisterContext::Spawning { entity }
            | RegisterContext::Ammunition { entity } => entity,
        }
    }
}

impl std::fmt::Display for RegisterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterContext::Prediction { entity } => write!(f, "prediction/{}", entity),
            RegisterContext::Spawning { entity } => write!(f, "spawning/{}", entity),
            RegisterContext::Ammunition { entity } => write!(f, "ammunition/{}", entity),
        }
    }
}

// #################
// # SUBSCRIPTIONS #
// #################

/// A tick listener: called after every advanced tick with the new tick number
/// and the alarm events that fired during it.
pub type TickListener = Box<dyn FnMut(Tick, &[AlarmFired]) + Send>;

struct ListenerSlot {
    id: u64,
    listener: TickListener,
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    slots: Mutex<Vec<ListenerSlot>>,
    // Ids whose guards were dropped. Applied lazily so a listener may drop
    // its own (or another) subscription during dispatch without deadlocking
    // on the slot lock.
    cancelled: Mutex<Vec<u64>>,
}

impl ListenerRegistry {
    fn subscribe(self: &Arc<Self>, listener: TickListener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().push(ListenerSlot { id, listener });
        Subscription {
            registry: Arc::clone(self),
            id,
        }
    }

    fn dispatch(&self, tick: Tick, fired: &[AlarmFired]) {
        self.apply_cancellations();
        // Dispatch outside the lock so listeners can subscribe or drop
        // guards re-entrantly.
        let mut active = std::mem::take(&mut *self.slots.lock());
        for slot in &mut active {
            (slot.listener)(tick, fired);
        }
        let mut slots = self.slots.lock();
        // Listeners added during dispatch landed in the (emptied) table;
        // keep them after the pre-existing ones.
        let added = std::mem::replace(&mut *slots, active);
        slots.extend(added);
        drop(slots);
        self.apply_cancellations();
    }

    fn apply_cancellations(&self) {
        let mut cancelled = self.cancelled.lock();
        if cancelled.is_empty() {
            return;
        }
        let mut slots = self.slots.lock();
        // An id with no matching slot belongs to a listener currently out on
        // a dispatch; it stays queued until the dispatch returns the slot.
        cancelled.retain(|id| {
            let before = slots.len();
            slots.retain(|slot| slot.id != *id);
            slots.len() == before
        });
    }
}

/// A scoped tick subscription.
///
/// Returned by [`SimContext::subscribe`]; the listener stays registered for
/// exactly as long as this guard lives.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Arc<ListenerRegistry>,
    id: u64,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.cancelled.lock().push(self.id);
        self.registry.apply_cancellations();
    }
}

// ###########
// # CONTEXT #
// ###########

/// The owning context for one peer's simulation.
///
/// Collaborators receive a `&mut SimContext` (or a [`NodeId`] carved out of
/// it) at construction instead of reaching for global state, which keeps
/// multiple independent simulations in one process possible and makes tests
/// hermetic.
pub struct SimContext {
    scheduler: AlarmScheduler,
    tick: Tick,
    dt: f64,
    nodes: HashMap<RegisterContext, NodeId>,
    listeners: Arc<ListenerRegistry>,
}

impl std::fmt::Debug for SimContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimContext")
            .field("tick", &self.tick)
            .field("dt", &self.dt)
            .field("registrations", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl SimContext {
    /// Creates a context with the session's fixed tick duration.
    ///
    /// The tick counter starts at 0; the first [`advance_tick`] lands on
    /// tick 1.
    ///
    /// # Errors
    /// [`RampartError::InvalidRequest`] for a non-positive or non-finite
    /// `dt`.
    ///
    /// [`advance_tick`]: SimContext::advance_tick
    pub fn new(dt: f64) -> Result<Self, RampartError> {
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(RampartError::InvalidRequest {
                info: format!("tick duration must be positive and finite, got {}", dt),
            });
        }
        Ok(Self {
            scheduler: AlarmScheduler::new(),
            tick: Tick::new(0),
            dt,
            nodes: HashMap::new(),
            listeners: Arc::new(ListenerRegistry::default()),
        })
    }

    /// The current tick.
    #[must_use]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// The fixed tick duration, in seconds.
    #[must_use]
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// The scheduler, for read-side queries.
    #[must_use]
    pub fn scheduler(&self) -> &AlarmScheduler {
        &self.scheduler
    }

    /// The scheduler, for alarm and node manipulation.
    pub fn scheduler_mut(&mut self) -> &mut AlarmScheduler {
        &mut self.scheduler
    }

    /// Registers a collaborator, carving out a dedicated scheduler node
    /// under the root.
    ///
    /// # Errors
    /// [`RampartError::InvalidRequest`] if the context is already
    /// registered.
    pub fn register(&mut self, context: RegisterContext) -> Result<NodeId, RampartError> {
        if self.nodes.contains_key(&context) {
            return Err(RampartError::InvalidRequest {
                info: format!("{} is already registered", context),
            });
        }
        let node = self.scheduler.add_node(self.scheduler.root(), 1.0)?;
        self.nodes.insert(context, node);
        Ok(node)
    }

    /// Unregisters a collaborator, removing its scheduler node and every
    /// alarm under it.
    ///
    /// # Errors
    /// [`RampartError::InvalidRequest`] if the context was never registered.
    pub fn unregister(&mut self, context: RegisterContext) -> Result<(), RampartError> {
        let Some(node) = self.nodes.remove(&context) else {
            return Err(RampartError::InvalidRequest {
                info: format!("{} is not registered", context),
            });
        };
        self.scheduler.remove_node(node)
    }

    /// Looks up the scheduler node registered for a context.
    #[must_use]
    pub fn node_for(&self, context: RegisterContext) -> Option<NodeId> {
        self.nodes.get(&context).copied()
    }

    /// Subscribes a listener to tick notifications.
    ///
    /// The listener runs after each [`advance_tick`] with the new tick and
    /// that tick's fired alarm events, until the returned guard is dropped.
    ///
    /// [`advance_tick`]: SimContext::advance_tick
    pub fn subscribe(&self, listener: TickListener) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Advances the simulation by one tick.
    ///
    /// Increments the tick counter, advances the scheduler by `dt`, then
    /// notifies subscribers. Returns the new tick and the fired alarm
    /// events for callers that drive components directly.
    pub fn advance_tick(&mut self) -> (Tick, Vec<AlarmFired>) {
        self.tick += 1;
        let fired = self.scheduler.advance(self.dt);
        self.listeners.dispatch(self.tick, &fired);
        (self.tick, fired)
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::scheduler::AlarmSpec;

    #[test]
    fn rejects_bad_tick_duration() {
        assert!(SimContext::new(0.0).is_err());
        assert!(SimContext::new(-0.1).is_err());
        assert!(SimContext::new(f64::NAN).is_err());
    }

    #[test]
    fn register_lookup_unregister() {
        let mut context = SimContext::new(0.1).unwrap();
        let key = RegisterContext::Prediction { entity: 7 };
        let node = context.register(key).unwrap();
        assert_eq!(context.node_for(key), Some(node));
        assert_eq!(
            context.node_for(RegisterContext::Spawning { entity: 7 }),
            None
        );

        // Double registration is refused.
        assert!(context.register(key).is_err());

        context.unregister(key).unwrap();
        assert_eq!(context.node_for(key), None);
        assert!(context.unregister(key).is_err());
    }

    #[test]
    fn same_entity_different_kinds_are_distinct() {
        let mut context = SimContext::new(0.1).unwrap();
        let prediction = context
            .register(RegisterContext::Prediction { entity: 1 })
            .unwrap();
        let ammunition = context
            .register(RegisterContext::Ammunition { entity: 1 })
            .unwrap();
        assert_ne!(prediction, ammunition);
    }

    #[test]
    fn advance_tick_counts_and_fires() {
        let mut context = SimContext::new(0.5).unwrap();
        let node = context
            .register(RegisterContext::Ammunition { entity: 1 })
            .unwrap();
        let handle = context
            .scheduler_mut()
            .add_alarm(node, AlarmSpec::new(1.0).one_shot())
            .unwrap();

        let (tick, fired) = context.advance_tick();
        assert_eq!(tick, Tick::new(1));
        assert!(fired.is_empty());

        let (tick, fired) = context.advance_tick();
        assert_eq!(tick, Tick::new(2));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].handle, handle);
    }

    #[test]
    fn subscription_receives_ticks_until_dropped() {
        let mut context = SimContext::new(0.1).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let guard = context.subscribe(Box::new(move |tick, _| sink.lock().push(tick)));

        context.advance_tick();
        context.advance_tick();
        drop(guard);
        context.advance_tick();

        assert_eq!(*seen.lock(), vec![Tick::new(1), Tick::new(2)]);
    }

    #[test]
    fn unregistering_removes_pending_alarms() {
        let mut context = SimContext::new(0.5).unwrap();
        let key = RegisterContext::Spawning { entity: 3 };
        let node = context.register(key).unwrap();
        context
            .scheduler_mut()
            .add_alarm(node, AlarmSpec::new(1.0))
            .unwrap();
        context.unregister(key).unwrap();

        let (_, fired) = context.advance_tick();
        let (_, fired_later) = context.advance_tick();
        assert!(fired.is_empty());
        assert!(fired_later.is_empty());
    }

    #[test]
    fn listener_may_drop_its_own_subscription() {
        let mut context = SimContext::new(0.1).unwrap();
        let calls = Arc::new(Mutex::new(0u32));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner_slot = Arc::clone(&slot);
        let sink = Arc::clone(&calls);
        let guard = context.subscribe(Box::new(move |_, _| {
            *sink.lock() += 1;
            // One-shot listener: release the guard from inside the callback.
            inner_slot.lock().take();
        }));
        *slot.lock() = Some(guard);

        context.advance_tick();
        context.advance_tick();
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn register_context_accessors() {
        let key = RegisterContext::Ammunition { entity: 42 };
        assert_eq!(key.entity(), 42);
        assert_eq!(format!("{}", key), "ammunition/42");
    }
}
