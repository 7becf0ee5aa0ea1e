//! Application context.
//!
//! [`AppContext`] is built once at startup and owns both protocol clients,
//! the controller, the reconnect supervisor and the settings store. Nothing
//! in the crate reaches for process-wide state; whatever needs a service is
//! handed an `Arc` from here.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rs_knobcab::config::{Config, MemoryConfigStore, ServerConfig};
//! use rs_knobcab::AppContext;
//!
//! # async fn run() -> rs_knobcab::Result<()> {
//! let config = Config::default().with_server(ServerConfig::default().with_host("192.168.1.10"));
//! let ctx = Arc::new(AppContext::new(config, Arc::new(MemoryConfigStore::new())));
//!
//! ctx.connect().await?;
//! ctx.start();
//! // ...
//! ctx.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigStore, ServerConfig};
use crate::controller::ThrottleController;
use crate::error::{Error, Result};
use crate::jmri_json::{JmriJsonClient, JsonClientOptions};
use crate::services::{spawn_heartbeat, spawn_poll_loop, spawn_withrottle_bridge};
use crate::supervisor::ReconnectSupervisor;
use crate::traits::{AlwaysUp, NetworkMonitor};
use crate::withrottle::{ClientOptions, WiThrottleClient, WiThrottleEvent};

/// Controller type used by the application.
pub type AppController = ThrottleController<WiThrottleClient>;

/// Supervisor type used by the application.
pub type AppSupervisor<N> = ReconnectSupervisor<WiThrottleClient, JmriJsonClient, N>;

/// Everything the running application owns.
pub struct AppContext<N: NetworkMonitor + 'static = AlwaysUp> {
    config: Mutex<Config>,
    store: Arc<dyn ConfigStore>,
    withrottle: Arc<WiThrottleClient>,
    json: Arc<JmriJsonClient>,
    controller: Arc<AppController>,
    supervisor: Arc<AppSupervisor<N>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppContext<AlwaysUp> {
    /// Builds the context for a host whose network is always considered up.
    pub fn new(config: Config, store: Arc<dyn ConfigStore>) -> Self {
        Self::with_network(config, store, Arc::new(AlwaysUp))
    }

    /// Builds the context from whatever `store` holds.
    pub fn from_store(store: Arc<dyn ConfigStore>) -> Self {
        let config = Config::load_from(store.as_ref());
        Self::new(config, store)
    }
}

impl<N: NetworkMonitor + 'static> AppContext<N> {
    /// Builds the context with a custom network monitor.
    pub fn with_network(config: Config, store: Arc<dyn ConfigStore>, network: Arc<N>) -> Self {
        let withrottle = Arc::new(WiThrottleClient::new(ClientOptions {
            device_name: config.device.name.to_string(),
            hardware_id: config.device.hardware_id.to_string(),
            ..ClientOptions::default()
        }));
        let json = Arc::new(JmriJsonClient::new(
            JsonClientOptions::default(),
            config.server.power_manager.as_str(),
        ));
        let controller = Arc::new(ThrottleController::new(
            Arc::clone(&withrottle),
            &config.throttle,
        ));
        let supervisor = Arc::new(ReconnectSupervisor::new(
            Arc::clone(&withrottle),
            Arc::clone(&json),
            network,
            config.reconnect.clone(),
        ));
        if config.server.is_configured() {
            supervisor.set_target(config.server.clone());
        }

        Self {
            config: Mutex::new(config),
            store,
            withrottle,
            json,
            controller,
            supervisor,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current settings.
    pub fn config(&self) -> Config {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The WiThrottle client.
    pub fn withrottle(&self) -> &Arc<WiThrottleClient> {
        &self.withrottle
    }

    /// The JMRI JSON client.
    pub fn json(&self) -> &Arc<JmriJsonClient> {
        &self.json
    }

    /// The throttle controller.
    pub fn controller(&self) -> &Arc<AppController> {
        &self.controller
    }

    /// The reconnect supervisor.
    pub fn supervisor(&self) -> &Arc<AppSupervisor<N>> {
        &self.supervisor
    }

    /// Replaces the server settings, persists them and points the
    /// supervisor at the new server.
    pub fn update_server(&self, server: ServerConfig) -> Result<()> {
        let config = {
            let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
            config.server = server.clone();
            config.clone()
        };
        config.save_to(self.store.as_ref())?;
        self.json
            .set_configured_power_name(server.power_manager.as_str());
        self.supervisor.set_target(server);
        Ok(())
    }

    /// Connects the WiThrottle client to the configured server.
    ///
    /// The JSON client follows once the server announces its web port.
    pub async fn connect(&self) -> Result<()> {
        let server = self.config().server;
        if !server.is_configured() {
            return Err(Error::Config("no server host configured".into()));
        }
        self.supervisor.set_target(server.clone());
        self.withrottle
            .connect(&server.host, server.withrottle_port)
            .await
    }

    /// Persists an announced web port and connects the JSON client there.
    pub async fn on_web_port(&self, port: u16) -> Result<()> {
        let (server, changed) = {
            let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
            let changed = config.server.json_port != port;
            config.server.json_port = port;
            (config.server.clone(), changed)
        };
        if changed {
            tracing::info!(port, "server announced web port");
            self.config().save_to(self.store.as_ref())?;
            self.supervisor.set_target(server.clone());
        }
        if changed || !self.json.is_connected() {
            self.json.disconnect().await;
            self.json.connect(&server.host, port).await?;
        }
        Ok(())
    }

    /// Spawns the background tasks: event bridge, web-port watcher,
    /// heartbeat, throttle polling and reconnect supervision.
    pub fn start(self: &Arc<Self>) {
        let throttle = self.config().throttle;
        let mut tasks = vec![
            spawn_withrottle_bridge(self.withrottle.subscribe(), Arc::clone(&self.controller)),
            self.spawn_web_port_watcher(),
            spawn_heartbeat(Arc::clone(&self.withrottle), throttle.heartbeat_interval()),
            spawn_poll_loop(Arc::clone(&self.controller), throttle.poll_interval()),
            tokio::spawn(Arc::clone(&self.supervisor).run()),
        ];
        let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        guard.append(&mut tasks);
        tracing::info!(tasks = guard.len(), "background tasks started");
    }

    fn spawn_web_port_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let ctx = Arc::clone(self);
        let mut events = self.withrottle.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(WiThrottleEvent::WebPort(port)) => {
                        if let Err(e) = ctx.on_web_port(port).await {
                            tracing::warn!(port, error = %e, "JSON connection not established");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "web-port watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stops the background tasks and disconnects both clients.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.withrottle.disconnect().await;
        self.json.disconnect().await;
        tracing::info!("shut down");
    }
}
