//! Raw knob input.
//!
//! The device layer that scans encoders and buttons is external. It hands
//! the controller [`KnobEvent`]s, either directly or through something that
//! implements [`EncoderInput`] and is polled by
//! [`PhysicalInputHandler`](crate::services::PhysicalInputHandler).
//!
//! # Example
//!
//! ```rust
//! use rs_knobcab::traits::EncoderInput;
//! use rs_knobcab::hal::MockEncoder;
//!
//! let mut encoder = MockEncoder::new();
//! encoder.queue_delta(3);
//! encoder.press_button();
//!
//! assert_eq!(encoder.read_delta(), 3);
//! assert!(encoder.button_just_pressed());
//! assert!(!encoder.button_just_pressed());
//! ```

use serde::{Deserialize, Serialize};

/// An event from one physical knob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KnobEvent {
    /// Detent clicks since the last event (positive = clockwise).
    Rotate {
        /// Knob id.
        knob: u8,
        /// Signed click count.
        delta: i32,
    },
    /// Push-button state change.
    Button {
        /// Knob id.
        knob: u8,
        /// True on press, false on release.
        pressed: bool,
    },
}

/// Rotary encoder with push button.
pub trait EncoderInput {
    /// Returns delta clicks since last call (positive = clockwise).
    ///
    /// This should reset the internal counter after reading.
    fn read_delta(&mut self) -> i32;

    /// Returns true if the encoder button is currently pressed.
    fn button_pressed(&self) -> bool;

    /// Returns true once per press.
    ///
    /// The default just reports the level; override for edge detection.
    fn button_just_pressed(&mut self) -> bool {
        self.button_pressed()
    }
}
