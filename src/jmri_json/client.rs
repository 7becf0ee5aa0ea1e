//! Async JMRI JSON client over WebSocket.
//!
//! The client waits for the server's `hello` before asking for the
//! configured power manager, keeps a name→state map of every power manager
//! it hears about, and publishes [`JsonEvent`]s only when the configured
//! manager actually changes.
//!
//! Sends are fire-and-forget: the WebSocket layer can report a failure for
//! a frame that was in fact delivered, so a failed send is logged and the
//! receive path stays the only source of truth about the connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::envelope::{kind, Envelope, PowerData};
use crate::config::ServerConfig;
use crate::connection::{ConnectionState, PowerState};
use crate::error::{Error, Result};
use crate::traits::ManagedConnection;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CAPACITY: usize = 32;

/// Connection options for [`JmriJsonClient`].
#[derive(Clone, Debug)]
pub struct JsonClientOptions {
    /// Upper bound on the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Interval between `ping` messages.
    pub heartbeat_interval: Duration,
}

impl Default for JsonClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Events published by [`JmriJsonClient`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JsonEvent {
    /// Connection state changed.
    Connection(ConnectionState),
    /// The server greeted us.
    Hello,
    /// The configured power manager changed state.
    Power {
        /// Power manager name.
        name: String,
        /// New state.
        state: PowerState,
    },
}

#[derive(Debug, Default)]
struct Cache {
    state: ConnectionState,
    power_name: String,
    powers: HashMap<String, PowerState>,
}

struct Shared {
    options: JsonClientOptions,
    cache: Mutex<Cache>,
    sink: AsyncMutex<Option<SplitSink<WsStream, Message>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<JsonEvent>,
}

/// JMRI JSON protocol client.
pub struct JmriJsonClient {
    shared: Arc<Shared>,
    reader: AsyncMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for JmriJsonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JmriJsonClient")
            .field("state", &self.state())
            .field("power_name", &self.configured_power_name())
            .finish_non_exhaustive()
    }
}

impl JmriJsonClient {
    /// Creates a disconnected client controlling `power_name`.
    pub fn new(options: JsonClientOptions, power_name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                options,
                cache: Mutex::new(Cache {
                    power_name: power_name.into(),
                    ..Cache::default()
                }),
                sink: AsyncMutex::new(None),
                heartbeat: Mutex::new(None),
                events,
            }),
            reader: AsyncMutex::new(None),
        }
    }

    /// Subscribes to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<JsonEvent> {
        self.shared.events.subscribe()
    }

    /// Opens `ws://host:port/json/` and starts the receive and heartbeat tasks.
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
        }
        self.shared
            .emit(JsonEvent::Connection(ConnectionState::Connecting));

        let url = format!("ws://{host}:{port}/json/");
        info!(%url, "connecting to JMRI JSON server");
        let connect = tokio_tungstenite::connect_async(url.as_str());
        let ws = match tokio::time::timeout(self.shared.options.connect_timeout, connect).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                warn!(%url, error = %e, "JSON connect failed");
                self.shared.set_state(ConnectionState::Failed);
                return Err(Error::Transport(e.to_string()));
            }
            Err(_) => {
                warn!(%url, "JSON connect timed out");
                self.shared.set_state(ConnectionState::Failed);
                return Err(Error::Timeout);
            }
        };

        let (sink, stream) = ws.split();
        *self.shared.sink.lock().await = Some(sink);
        self.shared.set_state(ConnectionState::Connected);
        Shared::start_heartbeat(&self.shared);

        let handle = tokio::spawn(read_loop(Arc::clone(&self.shared), stream));
        *self.reader.lock().await = Some(handle);
        info!(%url, "connected to JMRI JSON server");
        Ok(())
    }

    /// Stops both tasks, closes the socket and forgets cached power states.
    ///
    /// Safe to call repeatedly.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.shared.stop_heartbeat().await;
        if let Some(mut sink) = self.shared.sink.lock().await.take() {
            let _ = sink.close().await;
        }

        let changed = {
            let mut cache = self.shared.cache();
            cache.powers.clear();
            let changed = cache.state != ConnectionState::Disconnected;
            cache.state = ConnectionState::Disconnected;
            changed
        };
        if changed {
            info!("disconnected from JMRI JSON server");
            self.shared
                .emit(JsonEvent::Connection(ConnectionState::Disconnected));
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.cache().state
    }

    /// True while connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Selects which power manager this client controls and reports.
    pub fn set_configured_power_name(&self, name: impl Into<String>) {
        self.shared.cache().power_name = name.into();
    }

    /// Power manager this client controls.
    pub fn configured_power_name(&self) -> String {
        self.shared.cache().power_name.clone()
    }

    /// Last known state of the configured power manager.
    pub fn power_state(&self) -> PowerState {
        let cache = self.shared.cache();
        cache
            .powers
            .get(&cache.power_name)
            .copied()
            .unwrap_or_default()
    }

    /// Last known state of any power manager.
    pub fn power_state_of(&self, name: &str) -> PowerState {
        self.shared
            .cache()
            .powers
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Every power manager heard from since connecting.
    pub fn power_states(&self) -> HashMap<String, PowerState> {
        self.shared.cache().powers.clone()
    }

    /// Switches the configured power manager on or off.
    pub async fn set_power(&self, on: bool) -> Result<()> {
        self.require_connected()?;
        let name = self.configured_power_name();
        if name.is_empty() {
            return Err(Error::InvalidState("no power manager configured".into()));
        }
        self.shared.send(Envelope::set_power(&name, on)).await
    }

    /// Asks the server for every power manager.
    pub async fn request_power_list(&self) -> Result<()> {
        self.require_connected()?;
        self.shared.send(Envelope::list_power()).await
    }

    /// Sends one `ping` now.
    pub async fn send_heartbeat(&self) -> Result<()> {
        self.require_connected()?;
        self.shared.send(Envelope::ping()).await
    }

    fn require_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

impl Shared {
    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: JsonEvent) {
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
            self.emit(JsonEvent::Connection(state));
        }
    }

    fn start_heartbeat(shared: &Arc<Shared>) {
        let period = shared.options.heartbeat_interval;
        let task = Arc::clone(shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if task.cache().state != ConnectionState::Connected {
                    break;
                }
                trace!("JSON heartbeat");
                let _ = task.send(Envelope::ping()).await;
            }
        });
        let previous = shared
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn stop_heartbeat(&self) {
        let handle = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        let text = envelope.to_json()?;
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(Error::NotConnected);
        };
        trace!(%text, "tx");
        let sent = sink.send(Message::Text(text.into())).await;
        if let Err(e) = sent {
            // Delivery is judged by the receive path, not by this result.
            warn!(error = %e, "JSON send reported failure");
        }
        Ok(())
    }

    async fn connection_lost(&self, state: ConnectionState) {
        self.stop_heartbeat().await;
        self.sink.lock().await.take();
        self.set_state(state);
    }

    async fn handle_text(&self, text: &str) {
        trace!(text, "rx");
        let envelopes = match Envelope::parse_frame(text) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!(error = %e, "dropping malformed JSON message");
                return;
            }
        };
        for envelope in envelopes {
            self.dispatch(envelope).await;
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        match envelope.kind.as_str() {
            kind::HELLO => {
                info!("JMRI greeting received");
                self.emit(JsonEvent::Hello);
                let name = self.cache().power_name.clone();
                if !name.is_empty() {
                    let _ = self.send(Envelope::get_power(&name)).await;
                }
            }
            kind::POWER => match PowerData::from_envelope(&envelope) {
                Ok(power) => self.apply_power(power),
                Err(e) => warn!(error = %e, "dropping malformed power message"),
            },
            kind::PONG => trace!("pong"),
            kind::ERROR => warn!(data = ?envelope.data, "JMRI reported an error"),
            other => debug!(kind = other, "ignoring JSON message"),
        }
    }

    fn apply_power(&self, power: PowerData) {
        let state = power.power_state();
        let notify = {
            let mut cache = self.cache();
            let changed = cache.powers.get(&power.name) != Some(&state);
            if changed {
                cache.powers.insert(power.name.clone(), state);
            }
            changed && power.name == cache.power_name
        };
        debug!(name = %power.name, state = state.as_str(), "power state");
        if notify {
            self.emit(JsonEvent::Power {
                name: power.name,
                state,
            });
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut stream: SplitStream<WsStream>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => shared.handle_text(text.as_str()).await,
            Ok(Message::Close(frame)) => {
                info!(?frame, "JMRI closed the connection");
                shared.connection_lost(ConnectionState::Disconnected).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "JSON receive failed");
                shared.connection_lost(ConnectionState::Failed).await;
                return;
            }
        }
    }
    shared.connection_lost(ConnectionState::Disconnected).await;
}

impl ManagedConnection for JmriJsonClient {
    fn name(&self) -> &'static str {
        "jmri-json"
    }

    fn is_connected(&self) -> bool {
        JmriJsonClient::is_connected(self)
    }

    async fn reconnect(&self, server: &ServerConfig) -> Result<()> {
        self.disconnect().await;
        self.set_configured_power_name(server.power_manager.as_str());
        self.connect(&server.host, server.json_port).await
    }
}
