//! Physical knob model.
//!
//! A knob is either idle, browsing the roster on behalf of a throttle, or
//! driving that throttle's speed. A knob with no throttle is always idle.

use serde::{Deserialize, Serialize};

use crate::roster::Roster;

/// What a knob is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnobState {
    /// Not attached to any throttle.
    #[default]
    Idle,
    /// Browsing the roster for its throttle.
    Selecting,
    /// Driving its throttle's speed.
    Controlling,
}

/// One physical rotary knob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Knob {
    id: u8,
    state: KnobState,
    throttle: Option<u8>,
    roster_index: usize,
}

impl Knob {
    /// Creates an idle knob.
    pub fn new(id: u8) -> Self {
        Self {
            id,
            state: KnobState::Idle,
            throttle: None,
            roster_index: 0,
        }
    }

    /// Knob id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> KnobState {
        self.state
    }

    /// Throttle this knob is attached to.
    pub fn assigned_throttle(&self) -> Option<u8> {
        self.throttle
    }

    /// Roster browse index; only meaningful while selecting.
    pub fn roster_index(&self) -> usize {
        self.roster_index
    }

    /// Attaches to `throttle` and starts browsing from the top of the roster.
    pub fn assign(&mut self, throttle: u8) {
        self.reassign(throttle, KnobState::Selecting, true);
    }

    /// Attaches to `throttle` in the given state.
    pub fn reassign(&mut self, throttle: u8, state: KnobState, reset_index: bool) {
        self.throttle = Some(throttle);
        self.state = state;
        if reset_index {
            self.roster_index = 0;
        }
    }

    /// Switches from selecting to controlling. Returns `false` if the knob
    /// was not selecting.
    pub fn start_controlling(&mut self) -> bool {
        if self.state != KnobState::Selecting {
            return false;
        }
        self.state = KnobState::Controlling;
        true
    }

    /// Detaches from any throttle.
    pub fn release(&mut self) {
        self.throttle = None;
        self.state = KnobState::Idle;
        self.roster_index = 0;
    }

    /// Resets the browse index, e.g. after the roster was replaced.
    pub fn reset_roster_index(&mut self) {
        self.roster_index = 0;
    }

    /// Moves the browse index by `delta`, wrapping over `roster`.
    /// No-op (returns `None`) for an empty roster or a knob that is not selecting.
    pub fn handle_rotation(&mut self, delta: i32, roster: &Roster) -> Option<usize> {
        if self.state != KnobState::Selecting {
            return None;
        }
        let next = roster.wrap_index(self.roster_index, delta)?;
        self.roster_index = next;
        Some(next)
    }
}
