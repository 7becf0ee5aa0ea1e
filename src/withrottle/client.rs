//! Async WiThrottle client over TCP.
//!
//! One background task owns the read half of the socket, frames lines and
//! dispatches them. Everything the server tells us is cached on the client
//! and published as a [`WiThrottleEvent`] on a broadcast channel, so
//! consumers run on their own schedule instead of inside the read task.
//!
//! # Example
//!
//! ```ignore
//! use rs_knobcab::withrottle::{ClientOptions, WiThrottleClient, WiThrottleEvent};
//!
//! let client = WiThrottleClient::new(ClientOptions::default());
//! let mut events = client.subscribe();
//! client.connect("192.168.1.10", 12090).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let WiThrottleEvent::Roster(roster) = event {
//!         println!("{} locomotives", roster.len());
//!     }
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::codec::{self, Command, Inbound, LineBuffer, ThrottleUpdate, MAX_THROTTLE_ID};
use crate::config::ServerConfig;
use crate::connection::{ConnectionState, PowerState};
use crate::error::{Error, Result};
use crate::locomotive::{Direction, LocoAddress, FUNCTION_COUNT};
use crate::roster::Roster;
use crate::traits::{ManagedConnection, ThrottleLink};

const EVENT_CAPACITY: usize = 64;
const READ_CHUNK: usize = 1024;
const SLOTS: usize = MAX_THROTTLE_ID as usize + 1;

/// Connection options for [`WiThrottleClient`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Name announced with `N`.
    pub device_name: String,
    /// Hardware id announced with `HU`.
    pub hardware_id: String,
    /// Upper bound on TCP connect.
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            device_name: "rs-knobcab".to_owned(),
            hardware_id: "knobcab-0001".to_owned(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Logical track whose power state is tracked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    /// Main line.
    Main,
    /// Programming track.
    Prog,
}

impl Track {
    /// Lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Track::Main => "main",
            Track::Prog => "prog",
        }
    }
}

/// Something the server told us, or a connection change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WiThrottleEvent {
    /// Connection state changed.
    Connection(ConnectionState),
    /// The server announced its JSON/web port.
    WebPort(u16),
    /// Power changed on one track.
    TrackPower {
        /// Track that changed.
        track: Track,
        /// New state.
        state: PowerState,
    },
    /// A new roster replaced the old one.
    Roster(Roster),
    /// Speed, direction or function state for a throttle.
    ThrottleUpdate(ThrottleUpdate),
    /// The server confirmed an acquisition.
    Acquired {
        /// Throttle slot.
        throttle: u8,
        /// Acquired address.
        address: LocoAddress,
    },
    /// The server released a throttle.
    Released {
        /// Throttle slot.
        throttle: u8,
        /// Released address, `None` for a wildcard release.
        address: Option<LocoAddress>,
    },
    /// Function labels for an acquired locomotive.
    FunctionLabels {
        /// Throttle slot.
        throttle: u8,
        /// Address the labels belong to.
        address: LocoAddress,
        /// Labels in function-number order.
        labels: Vec<String>,
    },
    /// Server protocol version.
    ServerVersion(String),
}

#[derive(Clone, Copy, Debug)]
struct Acquisition {
    address: LocoAddress,
    acknowledged: bool,
}

#[derive(Debug, Default)]
struct Cache {
    state: ConnectionState,
    main_power: PowerState,
    prog_power: PowerState,
    roster: Roster,
    web_port: Option<u16>,
    server_version: Option<String>,
    acquisitions: [Option<Acquisition>; SLOTS],
}

#[derive(Debug)]
struct Shared {
    options: ClientOptions,
    cache: Mutex<Cache>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    events: broadcast::Sender<WiThrottleEvent>,
}

/// WiThrottle protocol client.
#[derive(Debug)]
pub struct WiThrottleClient {
    shared: Arc<Shared>,
    reader: AsyncMutex<Option<JoinHandle<()>>>,
}

impl WiThrottleClient {
    /// Creates a disconnected client.
    pub fn new(options: ClientOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                options,
                cache: Mutex::new(Cache::default()),
                writer: AsyncMutex::new(None),
                events,
            }),
            reader: AsyncMutex::new(None),
        }
    }

    /// Subscribes to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<WiThrottleEvent> {
        self.shared.events.subscribe()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connects, identifies the device and starts the receive task.
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        {
            let mut cache = self.shared.cache();
            if cache.state.is_active() {
                return Err(Error::InvalidState(format!(
                    "already {}",
                    cache.state.as_str()
                )));
            }
            cache.state = ConnectionState::Connecting;
            // A new session holds no locomotives until they are asked for again.
            cache.acquisitions = [None; SLOTS];
        }
        self.shared.emit(WiThrottleEvent::Connection(ConnectionState::Connecting));

        let addr = format!("{host}:{port}");
        info!(%addr, "connecting to WiThrottle server");
        let stream =
            match tokio::time::timeout(self.shared.options.connect_timeout, TcpStream::connect(&addr))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(%addr, error = %e, "WiThrottle connect failed");
                    self.shared.set_state(ConnectionState::Failed);
                    return Err(Error::Transport(e.to_string()));
                }
                Err(_) => {
                    warn!(%addr, "WiThrottle connect timed out");
                    self.shared.set_state(ConnectionState::Failed);
                    return Err(Error::Timeout);
                }
            };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }

        let (read, write) = stream.into_split();
        *self.shared.writer.lock().await = Some(write);

        let handle = tokio::spawn(read_loop(Arc::clone(&self.shared), read));
        *self.reader.lock().await = Some(handle);

        // Identify first so nothing reacting to Connected can write ahead of it.
        let options = &self.shared.options;
        self.shared
            .send(Command::DeviceName(options.device_name.clone()))
            .await?;
        self.shared
            .send(Command::HardwareId(options.hardware_id.clone()))
            .await?;
        self.shared.set_state(ConnectionState::Connected);
        info!(%addr, "connected to WiThrottle server");
        Ok(())
    }

    /// Stops the receive task, closes the socket and clears cached state.
    ///
    /// Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let changed = {
            let mut cache = self.shared.cache();
            let was = cache.state;
            *cache = Cache::default();
            was != ConnectionState::Disconnected
        };
        if changed {
            info!("disconnected from WiThrottle server");
            self.shared
                .emit(WiThrottleEvent::Connection(ConnectionState::Disconnected));
        }
    }

    // ========================================================================
    // Cached state
    // ========================================================================

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.cache().state
    }

    /// True while connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Last reported power for `track`.
    pub fn track_power(&self, track: Track) -> PowerState {
        let cache = self.shared.cache();
        match track {
            Track::Main => cache.main_power,
            Track::Prog => cache.prog_power,
        }
    }

    /// Most recent roster.
    pub fn roster(&self) -> Roster {
        self.shared.cache().roster.clone()
    }

    /// JSON/web port announced by the server.
    pub fn web_port(&self) -> Option<u16> {
        self.shared.cache().web_port
    }

    /// Protocol version announced by the server.
    pub fn server_version(&self) -> Option<String> {
        self.shared.cache().server_version.clone()
    }

    /// Address recorded for `throttle`, acknowledged or not.
    pub fn acquired_address(&self, throttle: u8) -> Option<LocoAddress> {
        self.shared.acquisition(throttle).map(|a| a.address)
    }

    /// True once the server confirmed the acquisition on `throttle`.
    pub fn is_acquired(&self, throttle: u8) -> bool {
        self.shared
            .acquisition(throttle)
            .is_some_and(|a| a.acknowledged)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Switches global track power.
    pub async fn set_track_power(&self, on: bool) -> Result<()> {
        self.require_connected()?;
        self.shared.send(Command::TrackPower(on)).await
    }

    /// Requests `address` on `throttle`. The acquisition is recorded as
    /// pending until the server confirms it.
    pub async fn acquire_locomotive(&self, throttle: u8, address: LocoAddress) -> Result<()> {
        self.require_connected()?;
        let slot = slot(throttle)?;
        self.shared.cache().acquisitions[slot] = Some(Acquisition {
            address,
            acknowledged: false,
        });
        self.shared.send(Command::Acquire { throttle, address }).await
    }

    /// Releases whatever `throttle` holds.
    pub async fn release_locomotive(&self, throttle: u8) -> Result<()> {
        self.require_connected()?;
        let slot = slot(throttle)?;
        self.shared.cache().acquisitions[slot] = None;
        self.shared.send(Command::Release { throttle }).await
    }

    /// Sets speed on an acquired throttle.
    pub async fn set_speed(&self, throttle: u8, speed: u8) -> Result<()> {
        let address = self.acknowledged(throttle)?;
        self.shared
            .send(Command::Speed {
                throttle,
                address,
                speed,
            })
            .await
    }

    /// Sets direction on an acquired throttle.
    pub async fn set_direction(&self, throttle: u8, direction: Direction) -> Result<()> {
        let address = self.acknowledged(throttle)?;
        self.shared
            .send(Command::Direction {
                throttle,
                address,
                direction,
            })
            .await
    }

    /// Sets a function on an acquired throttle.
    pub async fn set_function(&self, throttle: u8, function: u8, on: bool) -> Result<()> {
        if usize::from(function) >= FUNCTION_COUNT {
            return Err(Error::InvalidParameter(format!("function F{function}")));
        }
        let address = self.acknowledged(throttle)?;
        self.shared
            .send(Command::Function {
                throttle,
                address,
                function,
                on,
            })
            .await
    }

    /// Asks the server to report the throttle's speed.
    pub async fn query_speed(&self, throttle: u8) -> Result<()> {
        let address = self.recorded(throttle)?;
        self.shared
            .send(Command::QuerySpeed { throttle, address })
            .await
    }

    /// Asks the server to report the throttle's direction.
    pub async fn query_direction(&self, throttle: u8) -> Result<()> {
        let address = self.recorded(throttle)?;
        self.shared
            .send(Command::QueryDirection { throttle, address })
            .await
    }

    /// Sends a heartbeat if connected; does nothing otherwise.
    pub async fn send_heartbeat(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.shared.send(Command::Heartbeat).await
    }

    fn require_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn recorded(&self, throttle: u8) -> Result<LocoAddress> {
        self.require_connected()?;
        slot(throttle)?;
        self.shared
            .acquisition(throttle)
            .map(|a| a.address)
            .ok_or_else(|| Error::InvalidState(format!("throttle {throttle} has no locomotive")))
    }

    fn acknowledged(&self, throttle: u8) -> Result<LocoAddress> {
        self.require_connected()?;
        slot(throttle)?;
        match self.shared.acquisition(throttle) {
            Some(a) if a.acknowledged => Ok(a.address),
            Some(_) => Err(Error::InvalidState(format!(
                "throttle {throttle} acquisition not confirmed"
            ))),
            None => Err(Error::InvalidState(format!(
                "throttle {throttle} has no locomotive"
            ))),
        }
    }
}

fn slot(throttle: u8) -> Result<usize> {
    if throttle > MAX_THROTTLE_ID {
        return Err(Error::InvalidParameter(format!("throttle id {throttle}")));
    }
    Ok(usize::from(throttle))
}

impl Shared {
    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: WiThrottleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut cache = self.cache();
            let changed = cache.state != state;
            cache.state = state;
            changed
        };
        if changed {
            self.emit(WiThrottleEvent::Connection(state));
        }
    }

    fn acquisition(&self, throttle: u8) -> Option<Acquisition> {
        self.cache()
            .acquisitions
            .get(usize::from(throttle))
            .copied()
            .flatten()
    }

    async fn send(&self, command: Command) -> Result<()> {
        let line = command.encode();
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(Error::NotConnected);
        };
        trace!(%line, "tx");
        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        let written = stream.write_all(&bytes).await;
        if let Err(e) = written {
            warn!(error = %e, "WiThrottle send failed");
            writer.take();
            drop(writer);
            self.set_state(ConnectionState::Failed);
            return Err(Error::Transport(e.to_string()));
        }
        Ok(())
    }

    async fn connection_lost(&self, state: ConnectionState) {
        self.writer.lock().await.take();
        self.set_state(state);
    }

    async fn handle_line(&self, line: &str) {
        trace!(line, "rx");
        match codec::parse_line(line) {
            Ok(Some(message)) => self.apply(message).await,
            Ok(None) => debug!(line, "ignoring unrecognized message"),
            Err(e) => warn!(error = %e, line, "dropping malformed message"),
        }
    }

    async fn apply(&self, message: Inbound) {
        match message {
            Inbound::Heartbeat => {
                if let Err(e) = self.send(Command::Heartbeat).await {
                    warn!(error = %e, "heartbeat reply failed");
                }
            }
            Inbound::WebPort(port) => {
                info!(port, "server announced web port");
                self.cache().web_port = Some(port);
                self.emit(WiThrottleEvent::WebPort(port));
            }
            Inbound::TrackPower(state) => {
                let changed: Vec<Track> = {
                    let mut cache = self.cache();
                    let mut changed = Vec::new();
                    if cache.main_power != state {
                        cache.main_power = state;
                        changed.push(Track::Main);
                    }
                    if cache.prog_power != state {
                        cache.prog_power = state;
                        changed.push(Track::Prog);
                    }
                    changed
                };
                for track in changed {
                    debug!(track = track.as_str(), state = state.as_str(), "track power");
                    self.emit(WiThrottleEvent::TrackPower { track, state });
                }
            }
            Inbound::Roster(roster) => {
                info!(entries = roster.len(), "roster received");
                self.cache().roster = roster.clone();
                self.emit(WiThrottleEvent::Roster(roster));
            }
            Inbound::ThrottleUpdate(update) => {
                if let Some(Some(a)) = self.cache().acquisitions.get_mut(usize::from(update.throttle)) {
                    if a.address == update.address {
                        a.acknowledged = true;
                    }
                }
                self.emit(WiThrottleEvent::ThrottleUpdate(update));
            }
            Inbound::Acquired { throttle, address } => {
                debug!(throttle, %address, "acquisition confirmed");
                if let Some(entry) = self.cache().acquisitions.get_mut(usize::from(throttle)) {
                    *entry = Some(Acquisition {
                        address,
                        acknowledged: true,
                    });
                }
                self.emit(WiThrottleEvent::Acquired { throttle, address });
            }
            Inbound::Released { throttle, address } => {
                debug!(throttle, ?address, "released by server");
                if let Some(entry) = self.cache().acquisitions.get_mut(usize::from(throttle)) {
                    let matches = match (address, entry.as_ref()) {
                        (Some(released), Some(held)) => held.address == released,
                        _ => true,
                    };
                    if matches {
                        *entry = None;
                    }
                }
                self.emit(WiThrottleEvent::Released { throttle, address });
            }
            Inbound::FunctionLabels {
                throttle,
                address,
                labels,
            } => self.emit(WiThrottleEvent::FunctionLabels {
                throttle,
                address,
                labels,
            }),
            Inbound::ServerVersion(version) => {
                info!(%version, "WiThrottle protocol version");
                self.cache().server_version = Some(version.clone());
                self.emit(WiThrottleEvent::ServerVersion(version));
            }
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut read: OwnedReadHalf) {
    let mut chunk = [0u8; READ_CHUNK];
    let mut lines = LineBuffer::new();
    loop {
        match read.read(&mut chunk).await {
            Ok(0) => {
                info!("WiThrottle server closed the connection");
                shared.connection_lost(ConnectionState::Disconnected).await;
                break;
            }
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    shared.handle_line(&line).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "WiThrottle receive failed");
                shared.connection_lost(ConnectionState::Failed).await;
                break;
            }
        }
    }
}

impl ThrottleLink for WiThrottleClient {
    fn is_connected(&self) -> bool {
        WiThrottleClient::is_connected(self)
    }

    async fn acquire(&self, throttle: u8, address: LocoAddress) -> Result<()> {
        self.acquire_locomotive(throttle, address).await
    }

    async fn release(&self, throttle: u8) -> Result<()> {
        self.release_locomotive(throttle).await
    }

    async fn set_speed(&self, throttle: u8, speed: u8) -> Result<()> {
        WiThrottleClient::set_speed(self, throttle, speed).await
    }

    async fn set_direction(&self, throttle: u8, direction: Direction) -> Result<()> {
        WiThrottleClient::set_direction(self, throttle, direction).await
    }

    async fn set_function(&self, throttle: u8, function: u8, on: bool) -> Result<()> {
        WiThrottleClient::set_function(self, throttle, function, on).await
    }

    async fn query_speed(&self, throttle: u8) -> Result<()> {
        WiThrottleClient::query_speed(self, throttle).await
    }

    async fn query_direction(&self, throttle: u8) -> Result<()> {
        WiThrottleClient::query_direction(self, throttle).await
    }
}

impl ManagedConnection for WiThrottleClient {
    fn name(&self) -> &'static str {
        "withrottle"
    }

    fn is_connected(&self) -> bool {
        WiThrottleClient::is_connected(self)
    }

    async fn reconnect(&self, server: &ServerConfig) -> Result<()> {
        self.disconnect().await;
        self.connect(&server.host, server.withrottle_port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_require_connection() {
        let client = WiThrottleClient::new(ClientOptions::default());
        assert!(matches!(client.set_track_power(true).await, Err(Error::NotConnected)));
        assert!(matches!(
            client.acquire_locomotive(0, LocoAddress::short(3)).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(client.set_speed(0, 10).await, Err(Error::NotConnected)));
        assert!(client.send_heartbeat().await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let client = WiThrottleClient::new(ClientOptions::default());
        let mut events = client.subscribe();
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_track_power_emits_per_changed_track() {
        let client = WiThrottleClient::new(ClientOptions::default());
        let mut events = client.subscribe();
        client.shared.handle_line("PPA1").await;
        client.shared.handle_line("PPA1").await;

        assert_eq!(
            events.try_recv().unwrap(),
            WiThrottleEvent::TrackPower { track: Track::Main, state: PowerState::On }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            WiThrottleEvent::TrackPower { track: Track::Prog, state: PowerState::On }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(client.track_power(Track::Prog), PowerState::On);
    }

    #[tokio::test]
    async fn test_update_acknowledges_matching_acquisition() {
        let client = WiThrottleClient::new(ClientOptions::default());
        client.shared.cache().acquisitions[1] = Some(Acquisition {
            address: LocoAddress::long(40),
            acknowledged: false,
        });

        client.shared.handle_line("M1AS40<;>V3").await;
        assert!(!client.is_acquired(1));

        client.shared.handle_line("M1AL40<;>V3").await;
        assert!(client.is_acquired(1));
    }

    #[tokio::test]
    async fn test_malformed_line_is_dropped() {
        let client = WiThrottleClient::new(ClientOptions::default());
        let mut events = client.subscribe();
        client.shared.handle_line("PWnotaport").await;
        client.shared.handle_line("PW12080").await;
        assert_eq!(events.try_recv().unwrap(), WiThrottleEvent::WebPort(12080));
        assert_eq!(client.web_port(), Some(12080));
    }
}
