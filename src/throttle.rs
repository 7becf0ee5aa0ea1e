//! Throttle slot model.
//!
//! A [`Throttle`] is one of the fixed virtual control slots. It may own a
//! [`Locomotive`] and is driven by at most one knob at a time.
//!
//! # State machine
//!
//! ```text
//!                 assign_knob                 assign_locomotive
//!  UNALLOCATED ───────────────▶ SELECTING ──────────────────────▶ ALLOCATED_WITH_KNOB
//!       ▲        unassign_knob      │                                  │      ▲
//!       └───────────────────────────┘                     unassign_knob│      │assign_knob
//!       ▲                                                              ▼      │
//!       └──────────── release_locomotive ─────────────────── ALLOCATED_NO_KNOB
//! ```
//!
//! Invariant: a locomotive is present exactly when the state is one of the
//! two `Allocated*` states.

use serde::{Deserialize, Serialize};

use crate::locomotive::{Direction, Locomotive, MAX_SPEED};

/// Slot state of a throttle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleState {
    /// No locomotive and no knob.
    #[default]
    Unallocated,
    /// A knob is browsing the roster for this slot.
    Selecting,
    /// Owns a locomotive and a knob drives it.
    AllocatedWithKnob,
    /// Owns a locomotive but no knob is attached.
    AllocatedNoKnob,
}

impl ThrottleState {
    /// True for both allocated states.
    #[inline]
    pub const fn is_allocated(&self) -> bool {
        matches!(
            self,
            ThrottleState::AllocatedWithKnob | ThrottleState::AllocatedNoKnob
        )
    }

    /// Upper-case name, as shown on the handheld.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ThrottleState::Unallocated => "UNALLOCATED",
            ThrottleState::Selecting => "SELECTING",
            ThrottleState::AllocatedWithKnob => "ALLOCATED_WITH_KNOB",
            ThrottleState::AllocatedNoKnob => "ALLOCATED_NO_KNOB",
        }
    }
}

/// One virtual throttle slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Throttle {
    id: u8,
    state: ThrottleState,
    knob: Option<u8>,
    locomotive: Option<Locomotive>,
    speed: u8,
    direction: Direction,
}

impl Throttle {
    /// Creates an unallocated slot.
    pub fn new(id: u8) -> Self {
        Self {
            id,
            state: ThrottleState::Unallocated,
            knob: None,
            locomotive: None,
            speed: 0,
            direction: Direction::Forward,
        }
    }

    /// Slot id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Current slot state.
    pub fn state(&self) -> ThrottleState {
        self.state
    }

    /// Knob currently attached, if any.
    pub fn assigned_knob(&self) -> Option<u8> {
        self.knob
    }

    /// Owned locomotive, if allocated.
    pub fn locomotive(&self) -> Option<&Locomotive> {
        self.locomotive.as_ref()
    }

    /// Mutable access to the owned locomotive.
    pub fn locomotive_mut(&mut self) -> Option<&mut Locomotive> {
        self.locomotive.as_mut()
    }

    /// Speed mirror (0..=126).
    pub fn speed(&self) -> u8 {
        self.speed
    }

    /// Direction mirror.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Signed speed: positive forward, negative reverse.
    pub fn signed_speed(&self) -> i32 {
        i32::from(self.speed) * self.direction.sign()
    }

    /// Attaches a knob. An empty slot starts selecting; an allocated one
    /// becomes knob-driven.
    pub fn assign_knob(&mut self, knob: u8) {
        self.knob = Some(knob);
        self.state = if self.locomotive.is_some() {
            ThrottleState::AllocatedWithKnob
        } else {
            ThrottleState::Selecting
        };
    }

    /// Detaches the knob. Selection is abandoned; an owned locomotive is kept.
    pub fn unassign_knob(&mut self) {
        self.knob = None;
        self.state = match self.state {
            ThrottleState::Selecting => ThrottleState::Unallocated,
            ThrottleState::AllocatedWithKnob => ThrottleState::AllocatedNoKnob,
            other => other,
        };
    }

    /// Takes ownership of a locomotive. Only valid while selecting;
    /// returns `false` otherwise.
    pub fn assign_locomotive(&mut self, locomotive: Locomotive) -> bool {
        if self.state != ThrottleState::Selecting {
            return false;
        }
        self.speed = locomotive.speed();
        self.direction = locomotive.direction();
        self.locomotive = Some(locomotive);
        self.state = if self.knob.is_some() {
            ThrottleState::AllocatedWithKnob
        } else {
            ThrottleState::AllocatedNoKnob
        };
        true
    }

    /// Drops the locomotive and resets to a stopped, forward, unallocated
    /// slot with no knob. Returns the knob that was attached.
    pub fn release_locomotive(&mut self) -> Option<u8> {
        let knob = self.knob.take();
        self.locomotive = None;
        self.speed = 0;
        self.direction = Direction::Forward;
        self.state = ThrottleState::Unallocated;
        knob
    }

    /// Sets the speed mirror, clamping to `0..=126`.
    pub fn set_speed(&mut self, speed: i32) {
        self.speed = speed.clamp(0, i32::from(MAX_SPEED)) as u8;
        if let Some(loco) = self.locomotive.as_mut() {
            loco.set_speed(self.speed);
        }
    }

    /// Sets the direction mirror.
    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
        if let Some(loco) = self.locomotive.as_mut() {
            loco.set_direction(direction);
        }
    }

    /// Sets a function on the owned locomotive. Returns `false` when there
    /// is no locomotive or the number is out of range.
    pub fn set_function(&mut self, number: u8, on: bool) -> bool {
        self.locomotive
            .as_mut()
            .is_some_and(|loco| loco.set_function(number, on))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locomotive::LocoAddress;

    fn loco() -> Locomotive {
        Locomotive::new("LocoA", LocoAddress::short(3))
    }

    #[test]
    fn test_new_throttle() {
        let t = Throttle::new(2);
        assert_eq!(t.id(), 2);
        assert_eq!(t.state(), ThrottleState::Unallocated);
        assert!(t.assigned_knob().is_none());
        assert!(t.locomotive().is_none());
    }

    #[test]
    fn test_assign_and_unassign_knob_when_empty() {
        let mut t = Throttle::new(0);
        t.assign_knob(1);
        assert_eq!(t.state(), ThrottleState::Selecting);
        t.unassign_knob();
        assert_eq!(t.state(), ThrottleState::Unallocated);
        assert!(t.assigned_knob().is_none());
    }

    #[test]
    fn test_allocate_then_detach_keeps_loco() {
        let mut t = Throttle::new(0);
        t.assign_knob(0);
        assert!(t.assign_locomotive(loco()));
        assert_eq!(t.state(), ThrottleState::AllocatedWithKnob);
        t.unassign_knob();
        assert_eq!(t.state(), ThrottleState::AllocatedNoKnob);
        assert!(t.locomotive().is_some());
        t.assign_knob(1);
        assert_eq!(t.state(), ThrottleState::AllocatedWithKnob);
    }

    #[test]
    fn test_assign_locomotive_requires_selecting() {
        let mut t = Throttle::new(0);
        assert!(!t.assign_locomotive(loco()));
        assert!(t.locomotive().is_none());
    }

    #[test]
    fn test_speed_clamp() {
        let mut t = Throttle::new(0);
        t.set_speed(-5);
        assert_eq!(t.speed(), 0);
        t.set_speed(500);
        assert_eq!(t.speed(), 126);
        t.set_speed(i32::MIN);
        assert_eq!(t.speed(), 0);
        t.set_speed(i32::MAX);
        assert_eq!(t.speed(), 126);
    }

    #[test]
    fn test_release_resets() {
        let mut t = Throttle::new(0);
        t.assign_knob(1);
        t.assign_locomotive(loco());
        t.set_speed(40);
        t.set_direction(Direction::Reverse);
        assert!(t.set_function(2, true));

        assert_eq!(t.release_locomotive(), Some(1));
        assert_eq!(t.state(), ThrottleState::Unallocated);
        assert_eq!(t.speed(), 0);
        assert_eq!(t.direction(), Direction::Forward);
        assert!(t.locomotive().is_none());
        assert!(!t.set_function(2, true));
    }

    #[test]
    fn test_signed_speed() {
        let mut t = Throttle::new(0);
        t.set_speed(8);
        t.set_direction(Direction::Reverse);
        assert_eq!(t.signed_speed(), -8);
    }
}
