//! Physical input handler for encoder knobs.
//!
//! Polls one [`EncoderInput`] and forwards its rotation and press edges to the
//! controller as [`KnobEvent`]s for a fixed knob id.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_knobcab::config::ThrottleConfig;
//! use rs_knobcab::hal::{MockEncoder, MockLink};
//! use rs_knobcab::services::PhysicalInputHandler;
//! use rs_knobcab::ThrottleController;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let link = Arc::new(MockLink::new());
//! let controller = Arc::new(ThrottleController::new(link, &ThrottleConfig::default()));
//! let mut handler = PhysicalInputHandler::new(controller, 0, MockEncoder::new());
//!
//! // In your update loop:
//! assert!(!handler.poll().await.unwrap());
//! # });
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::controller::ThrottleController;
use crate::error::Result;
use crate::traits::{EncoderInput, KnobEvent, ThrottleLink};

/// Handler for one physical knob.
pub struct PhysicalInputHandler<L: ThrottleLink, E: EncoderInput> {
    controller: Arc<ThrottleController<L>>,
    knob: u8,
    encoder: E,
    /// Dead zone for filtering encoder noise (minimum delta to register)
    dead_zone: i32,
}

impl<L: ThrottleLink, E: EncoderInput> PhysicalInputHandler<L, E> {
    /// Create a handler that reports `encoder` as knob `knob`.
    pub fn new(controller: Arc<ThrottleController<L>>, knob: u8, encoder: E) -> Self {
        Self {
            controller,
            knob,
            encoder,
            dead_zone: 0,
        }
    }

    /// Set the dead zone (minimum delta to register a change).
    ///
    /// A value of 1 means single clicks are ignored, only 2+ click
    /// movements register.
    pub fn with_dead_zone(mut self, dead_zone: i32) -> Self {
        self.dead_zone = dead_zone;
        self
    }

    /// Poll the encoder once and forward anything that happened.
    ///
    /// A press is forwarded before rotation read in the same poll.
    /// Returns `true` if an event was forwarded.
    pub async fn poll(&mut self) -> Result<bool> {
        let mut forwarded = false;

        if self.encoder.button_just_pressed() {
            self.controller
                .on_input(KnobEvent::Button {
                    knob: self.knob,
                    pressed: true,
                })
                .await?;
            forwarded = true;
        }

        let delta = self.encoder.read_delta();
        if delta != 0 && delta.abs() > self.dead_zone {
            self.controller
                .on_input(KnobEvent::Rotate {
                    knob: self.knob,
                    delta,
                })
                .await?;
            forwarded = true;
        }

        Ok(forwarded)
    }

    /// Polls forever at `period`. Lock timeouts and other errors are logged
    /// and the loop keeps going.
    pub async fn run(mut self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = self.poll().await {
                tracing::warn!(knob = self.knob, error = %e, "knob input dropped");
            }
        }
    }

    /// Knob id this handler reports as.
    pub fn knob(&self) -> u8 {
        self.knob
    }

    /// Get a mutable reference to the encoder.
    pub fn encoder_mut(&mut self) -> &mut E {
        &mut self.encoder
    }

    /// Get the current dead zone.
    pub fn dead_zone(&self) -> i32 {
        self.dead_zone
    }
}
