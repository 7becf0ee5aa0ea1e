//! Throttle controller: the coordination core.
//!
//! [`ThrottleController`] owns the four throttle slots, the two knobs and the
//! current roster behind one lock. Every entry point follows the same shape:
//!
//! 1. acquire the lock (bounded by the configured lock timeout)
//! 2. read-modify-write the slot and knob state, queueing outbound commands
//! 3. release the lock
//! 4. send the queued commands through the [`ThrottleLink`]
//! 5. bump the change revision so observers can pull fresh snapshots
//!
//! Outbound writes are optimistic. The local mirror is updated before the
//! server has confirmed anything, and [`poll_throttle_states`] later asks the
//! server for the truth.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_knobcab::config::ThrottleConfig;
//! use rs_knobcab::controller::{PressOutcome, ThrottleController, TouchOutcome};
//! use rs_knobcab::hal::{LinkCommand, MockLink};
//! use rs_knobcab::roster::{Roster, RosterEntry};
//! use rs_knobcab::{AddressType, KnobState, LocoAddress};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let link = Arc::new(MockLink::new());
//! let controller = ThrottleController::new(Arc::clone(&link), &ThrottleConfig::default());
//!
//! let (roster, _) = Roster::from_entries([RosterEntry::new("Mogul", 3, AddressType::Short)]);
//! controller.on_roster(roster).await.unwrap();
//!
//! let touch = controller.on_knob_touch(0, 0).await.unwrap();
//! assert_eq!(touch, TouchOutcome::Assigned { knob: KnobState::Selecting });
//!
//! let press = controller.on_knob_press(0).await.unwrap();
//! assert!(matches!(press, PressOutcome::Acquired { throttle: 0, .. }));
//! assert_eq!(link.commands(), vec![LinkCommand::Acquire(0, LocoAddress::short(3))]);
//! # });
//! ```
//!
//! [`poll_throttle_states`]: ThrottleController::poll_throttle_states

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::config::ThrottleConfig;
use crate::error::{Error, Result};
use crate::knob::{Knob, KnobState};
use crate::locomotive::{Direction, LocoAddress, SpeedStepMode, MAX_SPEED};
use crate::roster::{Roster, RosterEntry};
use crate::throttle::{Throttle, ThrottleState};
use crate::traits::{KnobEvent, ThrottleLink};
use crate::withrottle::ThrottleUpdate;

/// Number of throttle slots.
pub const THROTTLE_COUNT: usize = 4;

/// Number of physical knobs.
pub const KNOB_COUNT: usize = 2;

// ============================================================================
// Speed arithmetic
// ============================================================================

/// Applies `delta` detent clicks to a speed/direction pair.
///
/// Speed is treated as signed (forward positive). The result is clamped to
/// `-126..=126`; the direction follows the sign and a result of exactly zero
/// keeps the previous direction.
///
/// ```rust
/// use rs_knobcab::controller::apply_rotation;
/// use rs_knobcab::Direction;
///
/// assert_eq!(apply_rotation(4, Direction::Forward, -2, 4), (4, Direction::Reverse));
/// assert_eq!(apply_rotation(8, Direction::Reverse, 3, 4), (4, Direction::Forward));
/// assert_eq!(apply_rotation(4, Direction::Forward, -1, 4), (0, Direction::Forward));
/// ```
pub fn apply_rotation(
    speed: u8,
    direction: Direction,
    delta: i32,
    steps_per_click: u8,
) -> (u8, Direction) {
    let max = i32::from(MAX_SPEED);
    let signed = i32::from(speed) * direction.sign();
    let next = signed
        .saturating_add(delta.saturating_mul(i32::from(steps_per_click)))
        .clamp(-max, max);
    let direction = match next {
        n if n > 0 => Direction::Forward,
        n if n < 0 => Direction::Reverse,
        _ => direction,
    };
    (next.unsigned_abs() as u8, direction)
}

// ============================================================================
// Outcomes
// ============================================================================

/// Result of [`ThrottleController::on_knob_touch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TouchOutcome {
    /// The knob left throttle `from` for the touched one.
    Moved {
        /// Throttle the knob was attached to.
        from: u8,
        /// Knob state after the move.
        knob: KnobState,
    },
    /// An idle knob was attached.
    Assigned {
        /// Knob state after attaching.
        knob: KnobState,
    },
    /// No rule matched.
    Ignored,
}

/// Result of [`ThrottleController::on_knob_rotate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RotateOutcome {
    /// The roster browse index moved.
    Browsed {
        /// New browse index.
        index: usize,
    },
    /// Speed and/or direction changed.
    Speed {
        /// Throttle driven by the knob.
        throttle: u8,
        /// New speed.
        speed: u8,
        /// New direction.
        direction: Direction,
    },
    /// Idle knob, empty roster, or no change.
    Ignored,
}

/// Result of [`ThrottleController::on_knob_press`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PressOutcome {
    /// The highlighted roster entry was assigned and acquired.
    Acquired {
        /// Throttle slot.
        throttle: u8,
        /// Address requested from the server.
        address: LocoAddress,
    },
    /// The controlled throttle was brought to speed 0.
    Stopped {
        /// Throttle slot.
        throttle: u8,
    },
    /// Idle knob or nothing to select.
    Ignored,
}

/// Result of [`ThrottleController::on_throttle_release`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// The slot was reset.
    Released {
        /// Knob that was freed, if one was attached.
        knob: Option<u8>,
    },
    /// The slot was already unallocated.
    Ignored,
}

// ============================================================================
// Snapshots
// ============================================================================

/// Read-only view of one throttle slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ThrottleSnapshot {
    /// Slot id.
    pub id: u8,
    /// Slot state.
    pub state: ThrottleState,
    /// Attached knob.
    pub assigned_knob: Option<u8>,
    /// Speed (0..=126).
    pub speed: u8,
    /// Direction.
    pub direction: Direction,
    /// Locomotive name, if allocated.
    pub loco_name: Option<String>,
    /// Locomotive address, if allocated.
    pub loco_address: Option<LocoAddress>,
    /// Decoder speed-step mode, if allocated.
    pub speed_steps: Option<SpeedStepMode>,
}

impl ThrottleSnapshot {
    fn of(throttle: &Throttle) -> Self {
        let loco = throttle.locomotive();
        Self {
            id: throttle.id(),
            state: throttle.state(),
            assigned_knob: throttle.assigned_knob(),
            speed: throttle.speed(),
            direction: throttle.direction(),
            loco_name: loco.map(|l| l.name().to_string()),
            loco_address: loco.map(|l| l.address()),
            speed_steps: loco.map(|l| l.speed_steps()),
        }
    }
}

/// Read-only view of one knob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct KnobSnapshot {
    /// Knob id.
    pub id: u8,
    /// Knob state.
    pub state: KnobState,
    /// Attached throttle.
    pub throttle: Option<u8>,
    /// Roster browse index.
    pub roster_index: usize,
}

/// What the roster picker should show.
///
/// Describes the first knob that is currently selecting, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RosterSelectionSnapshot {
    /// True when some knob is browsing.
    pub active: bool,
    /// Throttle being filled.
    pub throttle_id: Option<u8>,
    /// Browsing knob.
    pub knob_id: Option<u8>,
    /// Highlighted index.
    pub roster_index: usize,
    /// Roster size.
    pub roster_len: usize,
    /// Highlighted entry.
    pub entry: Option<RosterEntry>,
}

/// One decoder function of an allocated throttle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FunctionSnapshot {
    /// Function number.
    pub number: u8,
    /// Whether it is on.
    pub on: bool,
    /// Server-provided label (may be empty).
    pub label: String,
}

// ============================================================================
// Controller
// ============================================================================

#[derive(Debug)]
struct ControllerState {
    throttles: [Throttle; THROTTLE_COUNT],
    knobs: [Knob; KNOB_COUNT],
    roster: Roster,
    steps_per_click: u8,
}

/// A command queued under the lock and sent after it is released.
#[derive(Clone, Copy, Debug)]
enum Outbound {
    Acquire(u8, LocoAddress),
    Release(u8),
    Speed(u8, u8),
    Direction(u8, Direction),
    Function(u8, u8, bool),
    QuerySpeed(u8),
    QueryDirection(u8),
}

/// Coordinates knobs, throttle slots and the roster.
///
/// Generic over the outbound [`ThrottleLink`] so tests can run against
/// [`MockLink`](crate::hal::MockLink).
#[derive(Debug)]
pub struct ThrottleController<L: ThrottleLink> {
    link: Arc<L>,
    state: Mutex<ControllerState>,
    lock_timeout: Duration,
    changes: watch::Sender<u64>,
}

impl<L: ThrottleLink> ThrottleController<L> {
    /// Creates a controller with all slots unallocated and all knobs idle.
    pub fn new(link: Arc<L>, config: &ThrottleConfig) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            link,
            state: Mutex::new(ControllerState {
                throttles: core::array::from_fn(|i| Throttle::new(i as u8)),
                knobs: core::array::from_fn(|i| Knob::new(i as u8)),
                roster: Roster::new(),
                steps_per_click: config.steps_per_click,
            }),
            lock_timeout: config.lock_timeout(),
            changes,
        }
    }

    /// The outbound link.
    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    /// Receives a revision number that increments after every change.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    // ------------------------------------------------------------------------
    // Knob input
    // ------------------------------------------------------------------------

    /// A knob was pointed at a throttle.
    ///
    /// Rules, first match wins:
    ///
    /// | Knob | Touched throttle | Result |
    /// |------|------------------|--------|
    /// | on another throttle | `ALLOCATED_NO_KNOB` | move, `CONTROLLING` |
    /// | on another throttle | `UNALLOCATED` | move, `SELECTING` from index 0 |
    /// | idle | `UNALLOCATED` | attach, `SELECTING` |
    /// | idle | `ALLOCATED_NO_KNOB` | attach, `CONTROLLING` |
    /// | anything else | | ignored |
    ///
    /// The throttle a knob leaves goes from `ALLOCATED_WITH_KNOB` to
    /// `ALLOCATED_NO_KNOB`, or from `SELECTING` back to `UNALLOCATED`.
    pub async fn on_knob_touch(&self, throttle_id: u8, knob_id: u8) -> Result<TouchOutcome> {
        let t = throttle_index(throttle_id)?;
        let k = knob_index(knob_id)?;

        let outcome = {
            let mut guard = self.lock("knob_touch").await?;
            let state = &mut *guard;
            let target = state.throttles[t].state();
            let knob = &mut state.knobs[k];

            match (knob.assigned_throttle(), target) {
                (Some(from), ThrottleState::AllocatedNoKnob | ThrottleState::Unallocated)
                    if from != throttle_id =>
                {
                    let next = if target == ThrottleState::AllocatedNoKnob {
                        KnobState::Controlling
                    } else {
                        KnobState::Selecting
                    };
                    knob.reassign(throttle_id, next, true);
                    if let Some(old) = state.throttles.get_mut(usize::from(from)) {
                        old.unassign_knob();
                    }
                    state.throttles[t].assign_knob(knob_id);
                    TouchOutcome::Moved { from, knob: next }
                }
                (None, ThrottleState::Unallocated) => {
                    knob.assign(throttle_id);
                    state.throttles[t].assign_knob(knob_id);
                    TouchOutcome::Assigned {
                        knob: KnobState::Selecting,
                    }
                }
                (None, ThrottleState::AllocatedNoKnob) => {
                    knob.reassign(throttle_id, KnobState::Controlling, true);
                    state.throttles[t].assign_knob(knob_id);
                    TouchOutcome::Assigned {
                        knob: KnobState::Controlling,
                    }
                }
                _ => TouchOutcome::Ignored,
            }
        };

        match outcome {
            TouchOutcome::Ignored => {
                tracing::debug!(throttle = throttle_id, knob = knob_id, "knob touch ignored");
            }
            _ => {
                tracing::info!(throttle = throttle_id, knob = knob_id, ?outcome, "knob touch");
                self.notify();
            }
        }
        Ok(outcome)
    }

    /// A knob turned by `delta` detent clicks.
    ///
    /// Browses the roster while selecting; changes signed speed while
    /// controlling. Sends the direction (only if it flipped) and then the
    /// speed after the lock is released.
    pub async fn on_knob_rotate(&self, knob_id: u8, delta: i32) -> Result<RotateOutcome> {
        let k = knob_index(knob_id)?;
        if delta == 0 {
            return Ok(RotateOutcome::Ignored);
        }

        let mut outbound = Vec::new();
        let outcome = {
            let mut guard = self.lock("knob_rotate").await?;
            let state = &mut *guard;
            let knob = &mut state.knobs[k];

            match (knob.state(), knob.assigned_throttle()) {
                (KnobState::Selecting, _) => match knob.handle_rotation(delta, &state.roster) {
                    Some(index) => RotateOutcome::Browsed { index },
                    None => RotateOutcome::Ignored,
                },
                (KnobState::Controlling, Some(throttle_id)) => {
                    let throttle = &mut state.throttles[usize::from(throttle_id)];
                    let (speed, direction) = apply_rotation(
                        throttle.speed(),
                        throttle.direction(),
                        delta,
                        state.steps_per_click,
                    );
                    if speed == throttle.speed() && direction == throttle.direction() {
                        RotateOutcome::Ignored
                    } else {
                        if direction != throttle.direction() {
                            throttle.set_direction(direction);
                            outbound.push(Outbound::Direction(throttle_id, direction));
                        }
                        throttle.set_speed(i32::from(speed));
                        outbound.push(Outbound::Speed(throttle_id, speed));
                        RotateOutcome::Speed {
                            throttle: throttle_id,
                            speed,
                            direction,
                        }
                    }
                }
                _ => RotateOutcome::Ignored,
            }
        };

        if outcome != RotateOutcome::Ignored {
            tracing::debug!(knob = knob_id, delta, ?outcome, "knob rotate");
            self.dispatch(outbound).await;
            self.notify();
        }
        Ok(outcome)
    }

    /// A knob's button was pressed.
    ///
    /// While selecting, acquires the highlighted roster entry for the knob's
    /// throttle. While controlling, stops the throttle (speed 0, not an
    /// emergency stop).
    pub async fn on_knob_press(&self, knob_id: u8) -> Result<PressOutcome> {
        let k = knob_index(knob_id)?;

        let mut outbound = Vec::new();
        let outcome = {
            let mut guard = self.lock("knob_press").await?;
            let state = &mut *guard;
            let knob = &mut state.knobs[k];

            match (knob.state(), knob.assigned_throttle()) {
                (KnobState::Selecting, Some(throttle_id)) => {
                    match state.roster.get(knob.roster_index()) {
                        Some(entry) => {
                            let loco = entry.to_locomotive();
                            let address = loco.address();
                            let throttle = &mut state.throttles[usize::from(throttle_id)];
                            if throttle.assign_locomotive(loco) && knob.start_controlling() {
                                outbound.push(Outbound::Acquire(throttle_id, address));
                                PressOutcome::Acquired {
                                    throttle: throttle_id,
                                    address,
                                }
                            } else {
                                PressOutcome::Ignored
                            }
                        }
                        None => PressOutcome::Ignored,
                    }
                }
                (KnobState::Controlling, Some(throttle_id)) => {
                    state.throttles[usize::from(throttle_id)].set_speed(0);
                    outbound.push(Outbound::Speed(throttle_id, 0));
                    PressOutcome::Stopped {
                        throttle: throttle_id,
                    }
                }
                _ => PressOutcome::Ignored,
            }
        };

        if outcome != PressOutcome::Ignored {
            tracing::info!(knob = knob_id, ?outcome, "knob press");
            self.dispatch(outbound).await;
            self.notify();
        }
        Ok(outcome)
    }

    /// Dispatches a raw device event. Only the pressed edge of a button
    /// triggers [`on_knob_press`](Self::on_knob_press).
    pub async fn on_input(&self, event: KnobEvent) -> Result<()> {
        match event {
            KnobEvent::Rotate { knob, delta } => {
                self.on_knob_rotate(knob, delta).await?;
            }
            KnobEvent::Button {
                knob,
                pressed: true,
            } => {
                self.on_knob_press(knob).await?;
            }
            KnobEvent::Button { knob, .. } => knob_index(knob).map(drop)?,
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Throttle operations
    // ------------------------------------------------------------------------

    /// Releases whatever the throttle holds and frees its knob.
    ///
    /// The release command is only sent if a locomotive was owned.
    pub async fn on_throttle_release(&self, throttle_id: u8) -> Result<ReleaseOutcome> {
        let outcome = self.reset_slot(throttle_id, None, "throttle_release").await?;
        if let (ReleaseOutcome::Released { .. }, true) = outcome {
            self.dispatch(vec![Outbound::Release(throttle_id)]).await;
        }
        Ok(outcome.0)
    }

    /// The server dropped the throttle on its own. Same local reset as
    /// [`on_throttle_release`](Self::on_throttle_release) without sending
    /// anything.
    ///
    /// With `Some(address)` the slot is reset only while it still owns that
    /// address, so a late echo of an earlier release cannot drop a
    /// locomotive acquired since. `None` resets whatever the slot holds.
    pub async fn on_server_release(
        &self,
        throttle_id: u8,
        address: Option<LocoAddress>,
    ) -> Result<ReleaseOutcome> {
        Ok(self
            .reset_slot(throttle_id, address, "server_release")
            .await?
            .0)
    }

    async fn reset_slot(
        &self,
        throttle_id: u8,
        only: Option<LocoAddress>,
        op: &'static str,
    ) -> Result<(ReleaseOutcome, bool)> {
        let t = throttle_index(throttle_id)?;

        let (outcome, had_loco) = {
            let mut guard = self.lock(op).await?;
            let state = &mut *guard;
            let throttle = &mut state.throttles[t];
            let owned = throttle.locomotive().map(|l| l.address());
            if throttle.state() == ThrottleState::Unallocated {
                (ReleaseOutcome::Ignored, false)
            } else if only.is_some() && only != owned {
                tracing::debug!(throttle = throttle_id, ?only, ?owned, op, "release for another address");
                (ReleaseOutcome::Ignored, false)
            } else {
                let had_loco = throttle.locomotive().is_some();
                let knob = throttle.release_locomotive();
                if let Some(k) = knob.and_then(|k| state.knobs.get_mut(usize::from(k))) {
                    k.release();
                }
                (ReleaseOutcome::Released { knob }, had_loco)
            }
        };

        if outcome != ReleaseOutcome::Ignored {
            tracing::info!(throttle = throttle_id, ?outcome, op, "throttle reset");
            self.notify();
        }
        Ok((outcome, had_loco))
    }

    /// Sets a decoder function on an allocated throttle. Returns `false`
    /// when the throttle has no locomotive or the number is out of range.
    pub async fn set_function(&self, throttle_id: u8, function: u8, on: bool) -> Result<bool> {
        let t = throttle_index(throttle_id)?;
        let applied = {
            let mut guard = self.lock("set_function").await?;
            guard.throttles[t].set_function(function, on)
        };
        if applied {
            tracing::debug!(throttle = throttle_id, function, on, "function set");
            self.dispatch(vec![Outbound::Function(throttle_id, function, on)])
                .await;
            self.notify();
        }
        Ok(applied)
    }

    /// Flips a decoder function. Returns the new state, or `None` when
    /// nothing was changed.
    pub async fn toggle_function(&self, throttle_id: u8, function: u8) -> Result<Option<bool>> {
        let t = throttle_index(throttle_id)?;
        let next = {
            let mut guard = self.lock("toggle_function").await?;
            let throttle = &mut guard.throttles[t];
            let next = throttle
                .locomotive()
                .and_then(|l| l.function(function))
                .map(|slot| !slot.on);
            next.filter(|on| throttle.set_function(function, *on))
        };
        if let Some(on) = next {
            self.dispatch(vec![Outbound::Function(throttle_id, function, on)])
                .await;
            self.notify();
        }
        Ok(next)
    }

    // ------------------------------------------------------------------------
    // Server-side input
    // ------------------------------------------------------------------------

    /// Applies an inbound speed/direction/function update.
    ///
    /// Only present fields are written, and only when the throttle currently
    /// owns the address the update names. Returns whether anything applied.
    pub async fn on_protocol_update(&self, update: &ThrottleUpdate) -> Result<bool> {
        let t = throttle_index(update.throttle)?;
        let applied = {
            let mut guard = self.lock("protocol_update").await?;
            let throttle = &mut guard.throttles[t];
            let owns = throttle
                .locomotive()
                .is_some_and(|l| l.address() == update.address);
            if owns {
                if let Some(speed) = update.speed {
                    throttle.set_speed(i32::from(speed));
                }
                if let Some(direction) = update.direction {
                    throttle.set_direction(direction);
                }
                if let Some(f) = update.function {
                    throttle.set_function(f.number, f.on);
                }
                if let (Some(mode), Some(loco)) = (update.speed_steps, throttle.locomotive_mut()) {
                    loco.set_speed_steps(mode);
                }
            }
            owns
        };

        if applied {
            tracing::trace!(throttle = update.throttle, ?update, "protocol update applied");
            self.notify();
        } else {
            tracing::debug!(
                throttle = update.throttle,
                address = %update.address,
                "update for an address this slot does not own"
            );
        }
        Ok(applied)
    }

    /// Replaces the roster. Every selecting knob starts over at index 0.
    pub async fn on_roster(&self, roster: Roster) -> Result<()> {
        let len = roster.len();
        {
            let mut guard = self.lock("roster").await?;
            let state = &mut *guard;
            state.roster = roster;
            state
                .knobs
                .iter_mut()
                .filter(|k| k.state() == KnobState::Selecting)
                .for_each(Knob::reset_roster_index);
        }
        tracing::info!(entries = len, "roster replaced");
        self.notify();
        Ok(())
    }

    /// Stores function labels for the locomotive a throttle owns.
    pub async fn on_function_labels(
        &self,
        throttle_id: u8,
        address: LocoAddress,
        labels: &[String],
    ) -> Result<bool> {
        let t = throttle_index(throttle_id)?;
        let applied = {
            let mut guard = self.lock("function_labels").await?;
            match guard.throttles[t].locomotive_mut() {
                Some(loco) if loco.address() == address => {
                    loco.set_function_labels(labels);
                    true
                }
                _ => false,
            }
        };
        if applied {
            self.notify();
        }
        Ok(applied)
    }

    /// Re-acquires every owned locomotive after the link came back.
    ///
    /// A fresh connection starts with no acquisitions on the server side,
    /// so without this the slots would keep their locomotives locally while
    /// every command to them is refused. Returns how many were requested.
    pub async fn on_link_restored(&self) -> Result<usize> {
        let owned: Vec<(u8, LocoAddress)> = {
            let guard = self.lock("link_restored").await?;
            guard
                .throttles
                .iter()
                .filter_map(|t| t.locomotive().map(|l| (t.id(), l.address())))
                .collect()
        };
        if owned.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = owned.len(), "re-acquiring locomotives");
        let outbound: Vec<Outbound> = owned
            .iter()
            .map(|&(id, address)| Outbound::Acquire(id, address))
            .collect();
        let failed = self.dispatch(outbound).await;
        Ok(owned.len() - failed)
    }

    /// Asks the server for speed and direction of every allocated throttle.
    ///
    /// Skipped while the link is down. Returns the number of throttles whose
    /// queries were both accepted by the link.
    pub async fn poll_throttle_states(&self) -> Result<usize> {
        if !self.link.is_connected() {
            tracing::trace!("poll skipped, link down");
            return Ok(0);
        }
        let allocated: Vec<u8> = {
            let guard = self.lock("poll").await?;
            guard
                .throttles
                .iter()
                .filter(|t| t.state().is_allocated())
                .map(Throttle::id)
                .collect()
        };
        let mut queried = 0;
        for id in allocated {
            let failed = self
                .dispatch(vec![Outbound::QuerySpeed(id), Outbound::QueryDirection(id)])
                .await;
            if failed == 0 {
                queried += 1;
            }
        }
        Ok(queried)
    }

    // ------------------------------------------------------------------------
    // Settings and snapshots
    // ------------------------------------------------------------------------

    /// Speed steps applied per detent click.
    pub async fn steps_per_click(&self) -> Result<u8> {
        Ok(self.lock("steps_per_click").await?.steps_per_click)
    }

    /// Changes the speed steps per click (clamped to `1..=20`).
    pub async fn set_steps_per_click(&self, steps: u8) -> Result<u8> {
        let steps = steps.clamp(
            *crate::config::STEPS_PER_CLICK_RANGE.start(),
            *crate::config::STEPS_PER_CLICK_RANGE.end(),
        );
        self.lock("set_steps_per_click").await?.steps_per_click = steps;
        self.notify();
        Ok(steps)
    }

    /// Copy of the current roster.
    pub async fn roster(&self) -> Result<Roster> {
        Ok(self.lock("roster_snapshot").await?.roster.clone())
    }

    /// Snapshot of one throttle.
    pub async fn throttle_snapshot(&self, throttle_id: u8) -> Result<ThrottleSnapshot> {
        let t = throttle_index(throttle_id)?;
        let guard = self.lock("throttle_snapshot").await?;
        Ok(ThrottleSnapshot::of(&guard.throttles[t]))
    }

    /// Snapshots of every throttle, in slot order.
    pub async fn throttle_snapshots(&self) -> Result<Vec<ThrottleSnapshot>> {
        let guard = self.lock("throttle_snapshots").await?;
        Ok(guard.throttles.iter().map(ThrottleSnapshot::of).collect())
    }

    /// Snapshots of every knob.
    pub async fn knob_snapshots(&self) -> Result<Vec<KnobSnapshot>> {
        let guard = self.lock("knob_snapshots").await?;
        Ok(guard
            .knobs
            .iter()
            .map(|k| KnobSnapshot {
                id: k.id(),
                state: k.state(),
                throttle: k.assigned_throttle(),
                roster_index: k.roster_index(),
            })
            .collect())
    }

    /// What the roster picker should show.
    pub async fn roster_selection_snapshot(&self) -> Result<RosterSelectionSnapshot> {
        let guard = self.lock("selection_snapshot").await?;
        let roster_len = guard.roster.len();
        let snapshot = guard
            .knobs
            .iter()
            .find(|k| k.state() == KnobState::Selecting)
            .map(|k| RosterSelectionSnapshot {
                active: true,
                throttle_id: k.assigned_throttle(),
                knob_id: Some(k.id()),
                roster_index: k.roster_index(),
                roster_len,
                entry: guard.roster.get(k.roster_index()).cloned(),
            })
            .unwrap_or(RosterSelectionSnapshot {
                roster_len,
                ..Default::default()
            });
        Ok(snapshot)
    }

    /// Function states of a throttle. Empty when unallocated.
    pub async fn function_snapshot(&self, throttle_id: u8) -> Result<Vec<FunctionSnapshot>> {
        let t = throttle_index(throttle_id)?;
        let guard = self.lock("function_snapshot").await?;
        Ok(guard.throttles[t]
            .locomotive()
            .map(|loco| {
                loco.functions()
                    .iter()
                    .enumerate()
                    .map(|(n, slot)| FunctionSnapshot {
                        number: n as u8,
                        on: slot.on,
                        label: slot.label.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn lock(&self, op: &'static str) -> Result<MutexGuard<'_, ControllerState>> {
        match tokio::time::timeout(self.lock_timeout, self.state.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                tracing::warn!(op, timeout_ms = self.lock_timeout.as_millis() as u64, "controller lock timed out");
                Err(Error::LockTimeout)
            }
        }
    }

    /// Sends queued commands in order. Returns how many the link refused.
    async fn dispatch(&self, outbound: Vec<Outbound>) -> usize {
        let mut failed = 0;
        for command in outbound {
            let result = match command {
                Outbound::Acquire(t, address) => self.link.acquire(t, address).await,
                Outbound::Release(t) => self.link.release(t).await,
                Outbound::Speed(t, speed) => self.link.set_speed(t, speed).await,
                Outbound::Direction(t, direction) => self.link.set_direction(t, direction).await,
                Outbound::Function(t, f, on) => self.link.set_function(t, f, on).await,
                Outbound::QuerySpeed(t) => self.link.query_speed(t).await,
                Outbound::QueryDirection(t) => self.link.query_direction(t).await,
            };
            if let Err(e) = result {
                tracing::warn!(?command, error = %e, "outbound command failed");
                failed += 1;
            }
        }
        failed
    }

    fn notify(&self) {
        self.changes.send_modify(|rev| *rev = rev.wrapping_add(1));
    }
}

fn throttle_index(id: u8) -> Result<usize> {
    let index = usize::from(id);
    if index < THROTTLE_COUNT {
        Ok(index)
    } else {
        Err(Error::InvalidParameter(format!("throttle id {id} out of range")))
    }
}

fn knob_index(id: u8) -> Result<usize> {
    let index = usize::from(id);
    if index < KNOB_COUNT {
        Ok(index)
    } else {
        Err(Error::InvalidParameter(format!("knob id {id} out of range")))
    }
}
