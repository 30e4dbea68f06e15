//! Hierarchical, sub-tick-accurate countdown scheduler.
//!
//! A scheduler is a tree of nodes, each owning a set of alarms. Advancing the
//! scheduler by a time delta walks the tree from the root; every node
//! multiplies the incoming delta by its own rate multiplier before advancing
//! its own alarms and before recursing into its children, so slow-motion,
//! pause (rate 0) and fast-forward compose multiplicatively down the tree.
//!
//! Each node advances its alarms with one of two interchangeable strategies:
//!
//! - [`AdvanceStrategy::Linear`] scans every alarm each advance. O(n) per
//!   advance, no bookkeeping, fires grouped per alarm.
//! - [`AdvanceStrategy::HeapOrdered`] keeps ticking alarms in an
//!   [`IndexedHeap`] keyed by absolute due time against a per-node virtual
//!   clock. O(fired · log n) per advance, fires globally ordered by time
//!   within the node.
//!
//! Both strategies produce the same trigger counts and the same per-crossing
//! offsets for any advance sequence; only the event ordering across distinct
//! alarms differs.
//!
//! Alarms fire exactly once per cooldown crossing. An advance longer than the
//! cooldown crosses multiple times and fires each crossing with its exact
//! sub-advance offset; the post-trigger state (restart, rearm, destroy) is
//! computed from the alarm's settings as they were *before* the trigger
//! callback ran, so a callback's changes apply from the next crossing on.
//!
//! Operations on a handle whose alarm was removed fail with
//! [`RampartError::AlarmRemoved`] instead of panicking or silently acting on
//! a recycled slot; both alarm and node handles carry generation counters.

mod alarm;

pub use alarm::{AlarmCallback, AlarmCtl, AlarmSpec};

use smallvec::SmallVec;

use crate::error::RampartError;
use crate::heap::{HeapOrder, IndexedHeap};
use crate::report_violation;
use crate::telemetry::{
    invariant_checking_enabled, InvariantChecker, InvariantViolation, ViolationKind,
    ViolationSeverity,
};

use alarm::Alarm;

const ROOT_INDEX: u32 = 0;

// #############
// #   ENUMS   #
// #############

/// How a node advances the alarms it owns.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum AdvanceStrategy {
    /// Scan every alarm on each advance. Fires are grouped per alarm.
    #[default]
    Linear,
    /// Keep ticking alarms ordered by due time in an indexed heap. Fires are
    /// globally time-ordered within the node.
    HeapOrdered,
}

// #############
// #  HANDLES  #
// #############

/// Identifies a node in the scheduler tree.
///
/// Ids are generation-counted: once a node is removed, its id (and every id
/// in its subtree) permanently refers to nothing, even if the underlying slot
/// is recycled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Identifies an alarm owned by a scheduler.
///
/// Handles are generation-counted. All operations on a handle whose alarm was
/// removed (explicitly, by `destroy_after_triggered`, or with its node's
/// subtree) fail with [`RampartError::AlarmRemoved`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AlarmHandle {
    index: u32,
    generation: u32,
}

/// One alarm trigger produced by [`AlarmScheduler::advance`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AlarmFired {
    /// The alarm that fired.
    pub handle: AlarmHandle,
    /// Node-local seconds into the advance at which the crossing occurred.
    ///
    /// Sub-tick timestamps let a caller order effects within one simulation
    /// step, e.g. two shots from a fast-firing weapon inside a single tick.
    pub at: f64,
}

// ###############
// #  INTERNALS  #
// ###############

#[derive(Debug)]
struct SchedulerNode {
    parent: Option<u32>,
    children: Vec<u32>,
    rate_multiplier: f64,
    strategy: AdvanceStrategy,
    /// Indices of alarms owned by this node, in creation order.
    alarms: Vec<u32>,
    /// Virtual time accumulated by this node, in node-local seconds.
    clock: f64,
    /// Absolute due times of ticking alarms, heap strategy only.
    due: IndexedHeap<u32, f64>,
}

impl SchedulerNode {
    fn new(parent: Option<u32>, rate_multiplier: f64, strategy: AdvanceStrategy) -> Self {
        Self {
            parent,
            children: Vec::new(),
            rate_multiplier,
            strategy,
            alarms: Vec::new(),
            clock: 0.0,
            due: IndexedHeap::new(HeapOrder::Min),
        }
    }
}

#[derive(Debug)]
struct AlarmEntry {
    alarm: Alarm,
    node: u32,
}

#[derive(Debug)]
struct NodeSlot {
    generation: u32,
    node: Option<SchedulerNode>,
}

#[derive(Debug)]
struct AlarmSlot {
    generation: u32,
    entry: Option<AlarmEntry>,
}

// #############
// # SCHEDULER #
// #############

/// The hierarchical alarm scheduler.
///
/// # Example
///
/// ```
/// use rampart::{AlarmScheduler, AlarmSpec};
///
/// let mut scheduler = AlarmScheduler::new();
/// let reload = scheduler
///     .add_alarm(scheduler.root(), AlarmSpec::new(1.5))
///     .unwrap();
///
/// let fired = scheduler.advance(2.0);
/// assert_eq!(fired.len(), 1);
/// assert_eq!(fired[0].handle, reload);
/// assert!((fired[0].at - 1.5).abs() < 1e-12);
/// ```
#[derive(Debug)]
pub struct AlarmScheduler {
    nodes: Vec<NodeSlot>,
    alarms: Vec<AlarmSlot>,
    free_nodes: Vec<u32>,
    free_alarms: Vec<u32>,
}

impl Default for AlarmScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl AlarmScheduler {
    /// Creates a scheduler with a single root node at rate 1.0 using the
    /// default [`AdvanceStrategy::Linear`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeSlot {
                generation: 0,
                node: Some(SchedulerNode::new(None, 1.0, AdvanceStrategy::default())),
            }],
            alarms: Vec::new(),
            free_nodes: Vec::new(),
            free_alarms: Vec::new(),
        }
    }

    /// Returns the id of the root node. The root always exists.
    #[must_use]
    pub const fn root(&self) -> NodeId {
        NodeId {
            index: ROOT_INDEX,
            generation: 0,
        }
    }

    // ==========================================
    // Node operations
    // ==========================================

    /// Adds a child node under `parent` with the given rate multiplier and
    /// the default linear strategy.
    ///
    /// # Errors
    /// - [`RampartError::UnknownNode`] if `parent` is not a live node.
    /// - [`RampartError::InvalidRequest`] if the rate is negative or not
    ///   finite.
    pub fn add_node(&mut self, parent: NodeId, rate_multiplier: f64) -> Result<NodeId, RampartError> {
        self.add_node_with_strategy(parent, rate_multiplier, AdvanceStrategy::default())
    }

    /// Adds a child node under `parent` with an explicit advance strategy.
    ///
    /// # Errors
    /// See [`AlarmScheduler::add_node`].
    pub fn add_node_with_strategy(
        &mut self,
        parent: NodeId,
        rate_multiplier: f64,
        strategy: AdvanceStrategy,
    ) -> Result<NodeId, RampartError> {
        validate_rate(rate_multiplier)?;
        self.live_node(parent)?;
        let node = SchedulerNode::new(Some(parent.index), rate_multiplier, strategy);
        let index = match self.free_nodes.pop() {
            Some(index) => {
                self.nodes[index as usize].node = Some(node);
                index
            }
            None => {
                let index = u32::try_from(self.nodes.len()).map_err(|_| {
                    RampartError::InvalidRequest {
                        info: "scheduler node capacity exhausted".to_owned(),
                    }
                })?;
                self.nodes.push(NodeSlot {
                    generation: 0,
                    node: Some(node),
                });
                index
            }
        };
        let generation = self.nodes[index as usize].generation;
        self.live_node_mut(parent)?.children.push(index);
        Ok(NodeId { index, generation })
    }

    /// Removes a node and its entire subtree, including all alarms owned by
    /// the subtree. Handles into the subtree become permanently invalid.
    ///
    /// # Errors
    /// - [`RampartError::UnknownNode`] if `id` is not a live node.
    /// - [`RampartError::InvalidRequest`] when removing the root.
    pub fn remove_node(&mut self, id: NodeId) -> Result<(), RampartError> {
        let parent = self.live_node(id)?.parent;
        if id.index == ROOT_INDEX {
            return Err(RampartError::InvalidRequest {
                info: "the root node cannot be removed".to_owned(),
            });
        }
        if let Some(parent_index) = parent {
            if let Some(parent_node) = self.node_at_mut(parent_index) {
                parent_node.children.retain(|&child| child != id.index);
            }
        }
        let mut stack = vec![id.index];
        while let Some(index) = stack.pop() {
            let Some(slot) = self.nodes.get_mut(index as usize) else {
                continue;
            };
            let Some(node) = slot.node.take() else {
                continue;
            };
            slot.generation += 1;
            self.free_nodes.push(index);
            stack.extend(node.children.iter().copied());
            for alarm_index in node.alarms {
                if let Some(alarm_slot) = self.alarms.get_mut(alarm_index as usize) {
                    if alarm_slot.entry.take().is_some() {
                        alarm_slot.generation += 1;
                        self.free_alarms.push(alarm_index);
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns a node's rate multiplier.
    ///
    /// # Errors
    /// [`RampartError::UnknownNode`] if `id` is not a live node.
    pub fn rate_multiplier(&self, id: NodeId) -> Result<f64, RampartError> {
        Ok(self.live_node(id)?.rate_multiplier)
    }

    /// Sets a node's rate multiplier. 0 freezes the node's subtree, values
    /// above 1 run it faster than real time.
    ///
    /// # Errors
    /// - [`RampartError::UnknownNode`] if `id` is not a live node.
    /// - [`RampartError::InvalidRequest`] if the rate is negative or not
    ///   finite.
    pub fn set_rate_multiplier(&mut self, id: NodeId, rate: f64) -> Result<(), RampartError> {
        validate_rate(rate)?;
        self.live_node_mut(id)?.rate_multiplier = rate;
        Ok(())
    }

    /// Returns a node's virtual clock: the node-local seconds it has
    /// accumulated across all advances, after rate scaling.
    ///
    /// # Errors
    /// [`RampartError::UnknownNode`] if `id` is not a live node.
    pub fn clock(&self, id: NodeId) -> Result<f64, RampartError> {
        Ok(self.live_node(id)?.clock)
    }

    /// Returns a node's advance strategy.
    ///
    /// # Errors
    /// [`RampartError::UnknownNode`] if `id` is not a live node.
    pub fn strategy(&self, id: NodeId) -> Result<AdvanceStrategy, RampartError> {
        Ok(self.live_node(id)?.strategy)
    }

    /// Switches a node's advance strategy in place.
    ///
    /// Alarm countdown state carries over exactly; a switch between advances
    /// is unobservable in the trigger stream.
    ///
    /// # Errors
    /// [`RampartError::UnknownNode`] if `id` is not a live node.
    pub fn set_strategy(&mut self, id: NodeId, strategy: AdvanceStrategy) -> Result<(), RampartError> {
        let current = self.live_node(id)?.strategy;
        if current == strategy {
            return Ok(());
        }
        // Materialize heap due times back into per-alarm remaining first.
        let members: Vec<u32> = self.live_node(id)?.due.keys().copied().collect();
        for alarm_index in members {
            self.sync_from_heap(id.index, alarm_index);
        }
        let owned = {
            let node = self.live_node_mut(id)?;
            node.strategy = strategy;
            node.alarms.clone()
        };
        if strategy == AdvanceStrategy::HeapOrdered {
            for alarm_index in owned {
                self.maybe_enqueue(id.index, alarm_index);
            }
        }
        Ok(())
    }

    // ==========================================
    // Alarm operations
    // ==========================================

    /// Adds an alarm to a node.
    ///
    /// # Errors
    /// - [`RampartError::UnknownNode`] if `node` is not a live node.
    /// - [`RampartError::InvalidCooldown`] for non-positive cooldowns.
    /// - [`RampartError::InvalidRequest`] for a negative `initial_remaining`.
    pub fn add_alarm(&mut self, node: NodeId, spec: AlarmSpec) -> Result<AlarmHandle, RampartError> {
        self.insert_alarm(node, spec, None)
    }

    /// Adds an alarm with a trigger callback.
    ///
    /// The callback runs once per crossing and receives an [`AlarmCtl`] view
    /// of its own alarm, for re-entrant patterns like a watchdog that stops
    /// itself once its work is done. Reactions involving other alarms or
    /// outside state belong in the [`AlarmFired`] events `advance` returns.
    ///
    /// # Errors
    /// See [`AlarmScheduler::add_alarm`].
    pub fn add_alarm_with_callback(
        &mut self,
        node: NodeId,
        spec: AlarmSpec,
        callback: impl FnMut(&mut AlarmCtl<'_>) + 'static,
    ) -> Result<AlarmHandle, RampartError> {
        self.insert_alarm(node, spec, Some(Box::new(callback)))
    }

    fn insert_alarm(
        &mut self,
        node: NodeId,
        spec: AlarmSpec,
        callback: Option<AlarmCallback>,
    ) -> Result<AlarmHandle, RampartError> {
        spec.validate()?;
        self.live_node(node)?;
        let entry = AlarmEntry {
            alarm: Alarm::from_spec(&spec, callback),
            node: node.index,
        };
        let index = match self.free_alarms.pop() {
            Some(index) => {
                self.alarms[index as usize].entry = Some(entry);
                index
            }
            None => {
                let index = u32::try_from(self.alarms.len()).map_err(|_| {
                    RampartError::InvalidRequest {
                        info: "scheduler alarm capacity exhausted".to_owned(),
                    }
                })?;
                self.alarms.push(AlarmSlot {
                    generation: 0,
                    entry: Some(entry),
                });
                index
            }
        };
        let generation = self.alarms[index as usize].generation;
        self.live_node_mut(node)?.alarms.push(index);
        self.maybe_enqueue(node.index, index);
        Ok(AlarmHandle { index, generation })
    }

    /// Starts (or restarts) an alarm's countdown.
    ///
    /// # Errors
    /// [`RampartError::AlarmRemoved`] if the handle's alarm no longer exists.
    pub fn start(&mut self, handle: AlarmHandle) -> Result<(), RampartError> {
        let node_index = {
            let entry = self.live_alarm_mut(handle)?;
            entry.alarm.is_started = true;
            entry.node
        };
        self.maybe_enqueue(node_index, handle.index);
        Ok(())
    }

    /// Stops an alarm's countdown; `remaining` freezes where it is.
    ///
    /// # Errors
    /// [`RampartError::AlarmRemoved`] if the handle's alarm no longer exists.
    pub fn stop(&mut self, handle: AlarmHandle) -> Result<(), RampartError> {
        let node_index = self.live_alarm(handle)?.node;
        self.sync_from_heap(node_index, handle.index);
        self.live_alarm_mut(handle)?.alarm.is_started = false;
        Ok(())
    }

    /// Arms an alarm; it will fire when its countdown reaches zero.
    ///
    /// An alarm that already idles at zero fires at the start of the next
    /// advance.
    ///
    /// # Errors
    /// [`RampartError::AlarmRemoved`] if the handle's alarm no longer exists.
    pub fn arm(&mut self, handle: AlarmHandle) -> Result<(), RampartError> {
        let node_index = {
            let entry = self.live_alarm_mut(handle)?;
            entry.alarm.is_armed = true;
            entry.node
        };
        self.maybe_enqueue(node_index, handle.index);
        Ok(())
    }

    /// Disarms an alarm; it converges to zero without firing.
    ///
    /// # Errors
    /// [`RampartError::AlarmRemoved`] if the handle's alarm no longer exists.
    pub fn disarm(&mut self, handle: AlarmHandle) -> Result<(), RampartError> {
        let node_index = self.live_alarm(handle)?.node;
        self.sync_from_heap(node_index, handle.index);
        self.live_alarm_mut(handle)?.alarm.is_armed = false;
        Ok(())
    }

    /// Replaces an alarm's cooldown and restarts its countdown from it.
    /// Started/armed flags are unchanged.
    ///
    /// # Errors
    /// - [`RampartError::AlarmRemoved`] if the handle's alarm no longer
    ///   exists.
    /// - [`RampartError::InvalidCooldown`] for non-positive cooldowns; the
    ///   alarm is left unchanged.
    pub fn reset(&mut self, handle: AlarmHandle, new_cooldown: f64) -> Result<(), RampartError> {
        if !(new_cooldown > 0.0) {
            return Err(RampartError::InvalidCooldown {
                cooldown: new_cooldown,
            });
        }
        let node_index = self.live_alarm(handle)?.node;
        self.sync_from_heap(node_index, handle.index);
        {
            let entry = self.live_alarm_mut(handle)?;
            entry.alarm.cooldown = new_cooldown;
            entry.alarm.remaining = new_cooldown;
        }
        self.maybe_enqueue(node_index, handle.index);
        Ok(())
    }

    /// Removes an alarm. The handle becomes permanently invalid.
    ///
    /// # Errors
    /// [`RampartError::AlarmRemoved`] if the handle's alarm no longer exists.
    pub fn remove(&mut self, handle: AlarmHandle) -> Result<(), RampartError> {
        let node_index = self.live_alarm(handle)?.node;
        self.release_alarm(node_index, handle.index);
        Ok(())
    }

    /// Seconds until the alarm's next trigger.
    ///
    /// # Errors
    /// [`RampartError::AlarmRemoved`] if the handle's alarm no longer exists.
    pub fn remaining(&self, handle: AlarmHandle) -> Result<f64, RampartError> {
        let entry = self.live_alarm(handle)?;
        if let Some(node) = self.node_at(entry.node) {
            if let Some(&due) = node.due.priority(&handle.index) {
                return Ok((due - node.clock).max(0.0));
            }
        }
        Ok(entry.alarm.remaining)
    }

    /// The alarm's cooldown, in seconds.
    ///
    /// # Errors
    /// [`RampartError::AlarmRemoved`] if the handle's alarm no longer exists.
    pub fn cooldown(&self, handle: AlarmHandle) -> Result<f64, RampartError> {
        Ok(self.live_alarm(handle)?.alarm.cooldown)
    }

    /// Whether the alarm's countdown is running.
    ///
    /// # Errors
    /// [`RampartError::AlarmRemoved`] if the handle's alarm no longer exists.
    pub fn is_started(&self, handle: AlarmHandle) -> Result<bool, RampartError> {
        Ok(self.live_alarm(handle)?.alarm.is_started)
    }

    /// Whether the alarm fires when it reaches zero.
    ///
    /// # Errors
    /// [`RampartError::AlarmRemoved`] if the handle's alarm no longer exists.
    pub fn is_armed(&self, handle: AlarmHandle) -> Result<bool, RampartError> {
        Ok(self.live_alarm(handle)?.alarm.is_armed)
    }

    /// Returns the number of live alarms across all nodes.
    #[must_use]
    pub fn alarm_count(&self) -> usize {
        self.alarms.iter().filter(|slot| slot.entry.is_some()).count()
    }

    // ==========================================
    // Advancing
    // ==========================================

    /// Advances the whole tree by `dt` seconds of real time, returning every
    /// alarm trigger.
    ///
    /// Within a [`AdvanceStrategy::HeapOrdered`] node, triggers are ordered
    /// by time; within a [`AdvanceStrategy::Linear`] node they are grouped
    /// per alarm. Each [`AlarmFired::at`] is the exact node-local offset of
    /// its crossing under either strategy.
    ///
    /// A negative or non-finite `dt` is refused (reported via telemetry) and
    /// advances nothing.
    pub fn advance(&mut self, dt: f64) -> Vec<AlarmFired> {
        let mut fired = Vec::new();
        if !dt.is_finite() || dt < 0.0 {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Scheduler,
                "advance refused: dt must be finite and non-negative, got {}",
                dt
            );
            return fired;
        }
        if dt == 0.0 {
            return fired;
        }
        self.advance_node(ROOT_INDEX, dt, &mut fired);
        // Checked in debug builds and under the `paranoid` feature; the
        // branch folds away otherwise.
        if invariant_checking_enabled() {
            self.assert_invariants();
        }
        fired
    }

    fn advance_node(&mut self, index: u32, dt: f64, fired: &mut Vec<AlarmFired>) {
        let (rate, strategy) = match self.node_at(index) {
            Some(node) => (node.rate_multiplier, node.strategy),
            None => return,
        };
        let scaled = dt * rate;
        // Rate 0 freezes this node and everything below it.
        if scaled <= 0.0 {
            return;
        }
        match strategy {
            AdvanceStrategy::Linear => self.advance_linear(index, scaled, fired),
            AdvanceStrategy::HeapOrdered => self.advance_heap(index, scaled, fired),
        }
        let children = match self.node_at(index) {
            Some(node) => node.children.clone(),
            None => return,
        };
        for child in children {
            self.advance_node(child, scaled, fired);
        }
    }

    fn advance_linear(&mut self, node_index: u32, dt: f64, fired: &mut Vec<AlarmFired>) {
        let owned = match self.node_at_mut(node_index) {
            Some(node) => {
                node.clock += dt;
                node.alarms.clone()
            }
            None => return,
        };
        let mut destroyed: SmallVec<[u32; 4]> = SmallVec::new();
        let mut fires: SmallVec<[f64; 4]> = SmallVec::new();
        for index in owned {
            fires.clear();
            let Some(slot) = self.alarms.get_mut(index as usize) else {
                continue;
            };
            let Some(entry) = slot.entry.as_mut() else {
                continue;
            };
            let handle = AlarmHandle {
                index,
                generation: slot.generation,
            };
            if entry.alarm.advance(dt, &mut fires) {
                destroyed.push(index);
            }
            for &at in &fires {
                fired.push(AlarmFired { handle, at });
            }
        }
        for index in destroyed {
            self.release_alarm(node_index, index);
        }
    }

    fn advance_heap(&mut self, node_index: u32, dt: f64, fired: &mut Vec<AlarmFired>) {
        // Started-but-unarmed alarms live outside the heap and only decay.
        let owned = match self.node_at(node_index) {
            Some(node) => node.alarms.clone(),
            None => return,
        };
        for &index in &owned {
            let in_heap = self
                .node_at(node_index)
                .is_some_and(|node| node.due.contains(&index));
            if in_heap {
                continue;
            }
            if let Some(entry) = self
                .alarms
                .get_mut(index as usize)
                .and_then(|slot| slot.entry.as_mut())
            {
                if entry.alarm.is_started && !entry.alarm.is_armed {
                    entry.alarm.remaining = (entry.alarm.remaining - dt).max(0.0);
                }
            }
        }

        let mut destroyed: SmallVec<[u32; 4]> = SmallVec::new();
        {
            let Self { nodes, alarms, .. } = self;
            let Some(node) = nodes
                .get_mut(node_index as usize)
                .and_then(|slot| slot.node.as_mut())
            else {
                return;
            };
            let start_clock = node.clock;
            let target = start_clock + dt;
            while let Some((&index, &due)) = node.due.peek() {
                if due > target {
                    break;
                }
                let _ = node.due.pop();
                node.clock = due;
                let Some(slot) = alarms.get_mut(index as usize) else {
                    continue;
                };
                let Some(entry) = slot.entry.as_mut() else {
                    continue;
                };
                let at = due - start_clock;
                entry.alarm.remaining = 0.0;
                fired.push(AlarmFired {
                    handle: AlarmHandle {
                        index,
                        generation: slot.generation,
                    },
                    at,
                });
                if entry.alarm.fire(at) {
                    destroyed.push(index);
                    continue;
                }
                if entry.alarm.is_ticking() {
                    node.due.push(index, node.clock + entry.alarm.remaining);
                } else if entry.alarm.is_started && !entry.alarm.is_armed {
                    // Decays through the rest of this advance immediately.
                    entry.alarm.remaining =
                        (entry.alarm.remaining - (target - node.clock)).max(0.0);
                }
            }
            node.clock = target;
        }
        for index in destroyed {
            self.release_alarm(node_index, index);
        }
    }

    // ==========================================
    // Slot plumbing
    // ==========================================

    fn node_at(&self, index: u32) -> Option<&SchedulerNode> {
        self.nodes.get(index as usize).and_then(|slot| slot.node.as_ref())
    }

    fn node_at_mut(&mut self, index: u32) -> Option<&mut SchedulerNode> {
        self.nodes
            .get_mut(index as usize)
            .and_then(|slot| slot.node.as_mut())
    }

    fn live_node(&self, id: NodeId) -> Result<&SchedulerNode, RampartError> {
        self.nodes
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(RampartError::UnknownNode)
    }

    fn live_node_mut(&mut self, id: NodeId) -> Result<&mut SchedulerNode, RampartError> {
        self.nodes
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or(RampartError::UnknownNode)
    }

    fn live_alarm(&self, handle: AlarmHandle) -> Result<&AlarmEntry, RampartError> {
        self.alarms
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(RampartError::AlarmRemoved)
    }

    fn live_alarm_mut(&mut self, handle: AlarmHandle) -> Result<&mut AlarmEntry, RampartError> {
        self.alarms
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(RampartError::AlarmRemoved)
    }

    /// Pulls an alarm out of its node's heap, materializing the due time back
    /// into `remaining`. No-op for linear nodes and non-members.
    fn sync_from_heap(&mut self, node_index: u32, alarm_index: u32) {
        let Self { nodes, alarms, .. } = self;
        let Some(node) = nodes
            .get_mut(node_index as usize)
            .and_then(|slot| slot.node.as_mut())
        else {
            return;
        };
        let Some(due) = node.due.remove(&alarm_index) else {
            return;
        };
        if let Some(entry) = alarms
            .get_mut(alarm_index as usize)
            .and_then(|slot| slot.entry.as_mut())
        {
            entry.alarm.remaining = (due - node.clock).max(0.0);
        }
    }

    /// Inserts an alarm into its node's heap when the node uses the heap
    /// strategy and the alarm is ticking. Existing members are left alone;
    /// their due time in the heap is authoritative.
    fn maybe_enqueue(&mut self, node_index: u32, alarm_index: u32) {
        let ticking_remaining = self
            .alarms
            .get(alarm_index as usize)
            .and_then(|slot| slot.entry.as_ref())
            .filter(|entry| entry.alarm.is_ticking())
            .map(|entry| entry.alarm.remaining);
        let Some(remaining) = ticking_remaining else {
            return;
        };
        if let Some(node) = self.node_at_mut(node_index) {
            if node.strategy == AdvanceStrategy::HeapOrdered && !node.due.contains(&alarm_index) {
                let due = node.clock + remaining;
                node.due.push(alarm_index, due);
            }
        }
    }

    fn release_alarm(&mut self, node_index: u32, alarm_index: u32) {
        if let Some(node) = self.node_at_mut(node_index) {
            node.alarms.retain(|&index| index != alarm_index);
            let _ = node.due.remove(&alarm_index);
        }
        if let Some(slot) = self.alarms.get_mut(alarm_index as usize) {
            if slot.entry.take().is_some() {
                slot.generation += 1;
                self.free_alarms.push(alarm_index);
            }
        }
    }
}

fn validate_rate(rate: f64) -> Result<(), RampartError> {
    if rate.is_finite() && rate >= 0.0 {
        Ok(())
    } else {
        Err(RampartError::InvalidRequest {
            info: format!("rate multipliers must be finite and non-negative, got {}", rate),
        })
    }
}

impl InvariantChecker for AlarmScheduler {
    fn check_invariants(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        for (node_index, slot) in self.nodes.iter().enumerate() {
            let Some(node) = slot.node.as_ref() else {
                continue;
            };
            for key in node.due.keys() {
                match self
                    .alarms
                    .get(*key as usize)
                    .and_then(|slot| slot.entry.as_ref())
                {
                    Some(entry) if entry.alarm.is_ticking() => {}
                    Some(_) => violations.push(
                        InvariantViolation::new("AlarmScheduler", "heap holds a non-ticking alarm")
                            .with_details(format!("node={} alarm={}", node_index, key)),
                    ),
                    None => violations.push(
                        InvariantViolation::new("AlarmScheduler", "heap holds a removed alarm")
                            .with_details(format!("node={} alarm={}", node_index, key)),
                    ),
                }
            }
            for &alarm_index in &node.alarms {
                let live = self
                    .alarms
                    .get(alarm_index as usize)
                    .and_then(|slot| slot.entry.as_ref())
                    .is_some();
                if !live {
                    violations.push(
                        InvariantViolation::new("AlarmScheduler", "node references a removed alarm")
                            .with_details(format!("node={} alarm={}", node_index, alarm_index)),
                    );
                }
            }
        }
        for (alarm_index, slot) in self.alarms.iter().enumerate() {
            let Some(entry) = slot.entry.as_ref() else {
                continue;
            };
            if entry.alarm.remaining < 0.0 {
                violations.push(
                    InvariantViolation::new("AlarmScheduler", "alarm remaining is negative")
                        .with_details(format!(
                            "alarm={} remaining={}",
                            alarm_index, entry.alarm.remaining
                        )),
                );
            }
            if self.node_at(entry.node).is_none() {
                violations.push(
                    InvariantViolation::new("AlarmScheduler", "alarm references a removed node")
                        .with_details(format!("alarm={} node={}", alarm_index, entry.node)),
                );
            }
        }
        violations
    }
}

// #########
// # TESTS #
// #########
