//! Mock implementations for testing without a server or hardware.
//!
//! # Available Mocks
//!
//! | Mock | Trait | Purpose |
//! |------|-------|---------|
//! | [`MockLink`] | [`ThrottleLink`] | Records every outbound throttle command |
//! | [`MockEncoder`] | [`EncoderInput`] | Queued delta values and button state |
//! | [`MockConnection`] | [`ManagedConnection`] | Counts reconnect attempts |
//! | [`MockNetwork`] | [`NetworkMonitor`] | Switchable network reachability |
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rs_knobcab::{ThrottleController, config::ThrottleConfig};
//! use rs_knobcab::hal::{LinkCommand, MockLink};
//!
//! # tokio_test_block(async {
//! let link = Arc::new(MockLink::new());
//! let controller = ThrottleController::new(Arc::clone(&link), &ThrottleConfig::default());
//!
//! controller.on_throttle_release(0).await.unwrap();
//! assert!(link.commands().is_empty());
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```
//!
//! [`ThrottleLink`]: crate::traits::ThrottleLink
//! [`EncoderInput`]: crate::traits::EncoderInput
//! [`ManagedConnection`]: crate::traits::ManagedConnection
//! [`NetworkMonitor`]: crate::traits::NetworkMonitor

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::locomotive::{Direction, LocoAddress};
use crate::traits::{EncoderInput, ManagedConnection, NetworkMonitor, ThrottleLink};

// ============================================================================
// Link Mock
// ============================================================================

/// A command captured by [`MockLink`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkCommand {
    /// `acquire(throttle, address)`
    Acquire(u8, LocoAddress),
    /// `release(throttle)`
    Release(u8),
    /// `set_speed(throttle, speed)`
    Speed(u8, u8),
    /// `set_direction(throttle, direction)`
    Direction(u8, Direction),
    /// `set_function(throttle, function, on)`
    Function(u8, u8, bool),
    /// `query_speed(throttle)`
    QuerySpeed(u8),
    /// `query_direction(throttle)`
    QueryDirection(u8),
}

/// Mock throttle link for testing.
///
/// Starts connected. Commands are recorded even when `fail_sends` is set,
/// so tests can see what was attempted.
#[derive(Debug)]
pub struct MockLink {
    /// Whether `is_connected` reports true.
    pub connected: AtomicBool,
    /// Whether every command returns a transport error.
    pub fail_sends: AtomicBool,
    commands: Mutex<Vec<LinkCommand>>,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    /// Creates a connected link with no recorded commands.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Commands recorded so far.
    pub fn commands(&self) -> Vec<LinkCommand> {
        self.commands.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns and clears the recorded commands.
    pub fn take_commands(&self) -> Vec<LinkCommand> {
        core::mem::take(&mut *self.commands.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Sets the connected flag.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn record(&self, command: LinkCommand) -> Result<()> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command);
        if self.fail_sends.load(Ordering::SeqCst) {
            Err(Error::Transport("mock send failure".into()))
        } else {
            Ok(())
        }
    }
}

impl ThrottleLink for MockLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn acquire(&self, throttle: u8, address: LocoAddress) -> Result<()> {
        self.record(LinkCommand::Acquire(throttle, address))
    }

    async fn release(&self, throttle: u8) -> Result<()> {
        self.record(LinkCommand::Release(throttle))
    }

    async fn set_speed(&self, throttle: u8, speed: u8) -> Result<()> {
        self.record(LinkCommand::Speed(throttle, speed))
    }

    async fn set_direction(&self, throttle: u8, direction: Direction) -> Result<()> {
        self.record(LinkCommand::Direction(throttle, direction))
    }

    async fn set_function(&self, throttle: u8, function: u8, on: bool) -> Result<()> {
        self.record(LinkCommand::Function(throttle, function, on))
    }

    async fn query_speed(&self, throttle: u8) -> Result<()> {
        self.record(LinkCommand::QuerySpeed(throttle))
    }

    async fn query_direction(&self, throttle: u8) -> Result<()> {
        self.record(LinkCommand::QueryDirection(throttle))
    }
}

// ============================================================================
// Hardware Mocks
// ============================================================================

/// Mock encoder for testing.
///
/// Deltas are returned in the order they were queued.
#[derive(Debug, Default)]
pub struct MockEncoder {
    delta_queue: std::collections::VecDeque<i32>,
    button_state: bool,
    button_just_pressed_state: bool,
}

impl MockEncoder {
    /// Creates a new mock encoder with no pending deltas.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue up an encoder delta to be returned
    pub fn queue_delta(&mut self, delta: i32) {
        self.delta_queue.push_back(delta);
    }

    /// Queue up multiple deltas
    pub fn queue_deltas(&mut self, deltas: &[i32]) {
        self.delta_queue.extend(deltas.iter().copied());
    }

    /// Set the button level
    pub fn set_button(&mut self, pressed: bool) {
        self.button_state = pressed;
    }

    /// Simulate a button press (just_pressed will be true once)
    pub fn press_button(&mut self) {
        self.button_state = true;
        self.button_just_pressed_state = true;
    }
}

impl EncoderInput for MockEncoder {
    fn read_delta(&mut self) -> i32 {
        self.delta_queue.pop_front().unwrap_or(0)
    }

    fn button_pressed(&self) -> bool {
        self.button_state
    }

    fn button_just_pressed(&mut self) -> bool {
        let was_pressed = self.button_just_pressed_state;
        self.button_just_pressed_state = false;
        was_pressed
    }
}

// ============================================================================
// Supervision Mocks
// ============================================================================

/// Mock connection for supervisor tests.
#[derive(Debug)]
pub struct MockConnection {
    name: &'static str,
    /// Whether `is_connected` reports true.
    pub connected: AtomicBool,
    /// Whether the next reconnect succeeds.
    pub succeed: AtomicBool,
    attempts: AtomicUsize,
    last_server: Mutex<Option<ServerConfig>>,
}

impl MockConnection {
    /// Creates a mock that starts in the given state.
    pub fn new(name: &'static str, connected: bool) -> Self {
        Self {
            name,
            connected: AtomicBool::new(connected),
            succeed: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
            last_server: Mutex::new(None),
        }
    }

    /// Number of reconnect attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Server passed to the most recent reconnect.
    pub fn last_server(&self) -> Option<ServerConfig> {
        self.last_server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Sets the connected flag.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl ManagedConnection for MockConnection {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self, server: &ServerConfig) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_server.lock().unwrap_or_else(|e| e.into_inner()) = Some(server.clone());
        if self.succeed.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(Error::Transport("mock connect refused".into()))
        }
    }
}

/// Mock network monitor.
#[derive(Debug)]
pub struct MockNetwork {
    /// Whether the network reports up.
    pub up: AtomicBool,
}

impl MockNetwork {
    /// Creates a monitor in the given state.
    pub fn new(up: bool) -> Self {
        Self {
            up: AtomicBool::new(up),
        }
    }

    /// Switches reachability.
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

impl NetworkMonitor for MockNetwork {
    fn is_network_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}
