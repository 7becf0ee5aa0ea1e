//! Periodic background triggers: WiThrottle heartbeat and throttle polling.
//!
//! Both run independently of knob input and rely on the controller's lock
//! discipline for safety.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::controller::ThrottleController;
use crate::traits::ThrottleLink;
use crate::withrottle::WiThrottleClient;

/// Sends `*` to the server every `period` while connected.
pub fn spawn_heartbeat(client: Arc<WiThrottleClient>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            if !client.is_connected() {
                continue;
            }
            if let Err(e) = client.send_heartbeat().await {
                tracing::debug!(error = %e, "heartbeat not sent");
            }
        }
    })
}

/// Reconciles allocated throttles with the server every `period`.
pub fn spawn_poll_loop<L>(controller: Arc<ThrottleController<L>>, period: Duration) -> JoinHandle<()>
where
    L: ThrottleLink + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            match controller.poll_throttle_states().await {
                Ok(0) => {}
                Ok(polled) => tracing::trace!(polled, "throttle states polled"),
                Err(e) => tracing::warn!(error = %e, "throttle poll abandoned"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThrottleConfig;
    use crate::hal::{LinkCommand, MockLink};
    use crate::locomotive::AddressType;
    use crate::roster::{Roster, RosterEntry};

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_queries_on_period() {
        let link = Arc::new(MockLink::new());
        let controller = Arc::new(ThrottleController::new(
            Arc::clone(&link),
            &ThrottleConfig::default(),
        ));
        let (roster, _) = Roster::from_entries([RosterEntry::new("A", 3, AddressType::Short)]);
        controller.on_roster(roster).await.unwrap();
        controller.on_knob_touch(0, 0).await.unwrap();
        controller.on_knob_press(0).await.unwrap();
        link.take_commands();

        let handle = spawn_poll_loop(Arc::clone(&controller), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(link.commands().is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            link.take_commands(),
            vec![LinkCommand::QuerySpeed(0), LinkCommand::QueryDirection(0)]
        );
        handle.abort();
    }
}
