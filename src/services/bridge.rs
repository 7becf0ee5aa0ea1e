//! Feeds WiThrottle client events into the controller.
//!
//! The client's receive task only publishes events; this bridge consumes them
//! on its own task, so the controller lock is never taken from the socket
//! reader.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::connection::ConnectionState;
use crate::controller::ThrottleController;
use crate::error::Result;
use crate::traits::ThrottleLink;
use crate::withrottle::WiThrottleEvent;

/// Applies one client event to the controller.
pub async fn apply_event<L: ThrottleLink>(
    controller: &ThrottleController<L>,
    event: WiThrottleEvent,
) -> Result<()> {
    match event {
        WiThrottleEvent::Roster(roster) => controller.on_roster(roster).await,
        WiThrottleEvent::ThrottleUpdate(update) => {
            controller.on_protocol_update(&update).await.map(drop)
        }
        WiThrottleEvent::FunctionLabels {
            throttle,
            address,
            labels,
        } => controller
            .on_function_labels(throttle, address, &labels)
            .await
            .map(drop),
        WiThrottleEvent::Released { throttle, address } => {
            controller.on_server_release(throttle, address).await.map(drop)
        }
        WiThrottleEvent::Connection(ConnectionState::Connected) => {
            controller.on_link_restored().await.map(drop)
        }
        other => {
            tracing::trace!(event = ?other, "event not routed to controller");
            Ok(())
        }
    }
}

/// Spawns a task that applies every event from `events` until the client
/// is dropped.
pub fn spawn_withrottle_bridge<L>(
    mut events: broadcast::Receiver<WiThrottleEvent>,
    controller: Arc<ThrottleController<L>>,
) -> JoinHandle<()>
where
    L: ThrottleLink + 'static,
{
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = apply_event(&controller, event).await {
                        tracing::warn!(error = %e, "controller rejected client event");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "bridge lagged behind client events");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("withrottle bridge stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThrottleConfig;
    use crate::hal::{LinkCommand, MockLink};
    use crate::locomotive::{AddressType, LocoAddress};
    use crate::roster::{Roster, RosterEntry};
    use crate::throttle::ThrottleState;

    #[tokio::test]
    async fn test_bridge_applies_roster_and_release() {
        let controller = Arc::new(ThrottleController::new(
            Arc::new(MockLink::new()),
            &ThrottleConfig::default(),
        ));
        let (tx, rx) = broadcast::channel(8);
        let handle = spawn_withrottle_bridge(rx, Arc::clone(&controller));

        let (roster, _) = Roster::from_entries([RosterEntry::new("A", 3, AddressType::Short)]);
        tx.send(WiThrottleEvent::Roster(roster)).unwrap();
        tx.send(WiThrottleEvent::ServerVersion("2.0".into())).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(controller.roster().await.unwrap().len(), 1);

        controller.on_knob_touch(0, 0).await.unwrap();
        controller.on_knob_press(0).await.unwrap();
        apply_event(&controller, WiThrottleEvent::Released { throttle: 0, address: None })
            .await
            .unwrap();
        assert_eq!(
            controller.throttle_snapshot(0).await.unwrap().state,
            ThrottleState::Unallocated
        );
    }

    #[tokio::test]
    async fn test_bridge_reacquires_on_reconnect() {
        let link = Arc::new(MockLink::new());
        let controller = ThrottleController::new(Arc::clone(&link), &ThrottleConfig::default());
        let (roster, _) = Roster::from_entries([RosterEntry::new("A", 3, AddressType::Short)]);
        controller.on_roster(roster).await.unwrap();
        controller.on_knob_touch(2, 0).await.unwrap();
        controller.on_knob_press(0).await.unwrap();
        link.take_commands();

        apply_event(&controller, WiThrottleEvent::Connection(ConnectionState::Disconnected))
            .await
            .unwrap();
        assert!(link.commands().is_empty());

        apply_event(&controller, WiThrottleEvent::Connection(ConnectionState::Connected))
            .await
            .unwrap();
        assert_eq!(
            link.take_commands(),
            vec![LinkCommand::Acquire(2, LocoAddress::short(3))]
        );
    }
}
