//! WiThrottle client tests against a scripted TCP server on localhost.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use rs_knobcab::config::ThrottleConfig;
use rs_knobcab::services::{apply_event, spawn_withrottle_bridge};
use rs_knobcab::withrottle::{ClientOptions, Track};
use rs_knobcab::{
    AddressType, ConnectionState, Error, LocoAddress, PowerState, Roster, RosterEntry,
    ThrottleController, ThrottleState, WiThrottleClient, WiThrottleEvent,
};

const WAIT: Duration = Duration::from_secs(2);

struct Server {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Server {
    async fn expect_line(&mut self) -> String {
        tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("client closed the connection")
    }

    async fn send(&mut self, line: &str) {
        self.write.write_all(line.as_bytes()).await.unwrap();
        self.write.write_all(b"\n").await.unwrap();
    }
}

fn options() -> ClientOptions {
    ClientOptions {
        device_name: "Test Cab".to_owned(),
        hardware_id: "abc123".to_owned(),
        ..ClientOptions::default()
    }
}

/// Connects a fresh client to a fresh listener and consumes the handshake.
async fn connect_pair() -> (Arc<WiThrottleClient>, broadcast::Receiver<WiThrottleEvent>, Server) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = Arc::new(WiThrottleClient::new(options()));
    let events = client.subscribe();

    let (connected, accepted) = tokio::join!(client.connect("127.0.0.1", port), listener.accept());
    connected.unwrap();
    let (socket, _) = accepted.unwrap();
    let (read, write) = socket.into_split();
    let mut server = Server {
        lines: BufReader::new(read).lines(),
        write,
    };

    assert_eq!(server.expect_line().await, "NTest Cab");
    assert_eq!(server.expect_line().await, "HUabc123");
    (client, events, server)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<WiThrottleEvent>, mut matches: F) -> WiThrottleEvent
where
    F: FnMut(&WiThrottleEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

#[tokio::test]
async fn handshake_announces_name_and_hardware_id() {
    let (client, mut events, _server) = connect_pair().await;

    assert!(client.is_connected());
    let event = wait_for(&mut events, |e| matches!(e, WiThrottleEvent::Connection(_))).await;
    assert_eq!(event, WiThrottleEvent::Connection(ConnectionState::Connecting));
    let event = wait_for(&mut events, |e| matches!(e, WiThrottleEvent::Connection(_))).await;
    assert_eq!(event, WiThrottleEvent::Connection(ConnectionState::Connected));
}

#[tokio::test]
async fn connect_while_connected_is_rejected() {
    let (client, _events, _server) = connect_pair().await;
    let again = client.connect("127.0.0.1", 1).await;
    assert!(matches!(again, Err(Error::InvalidState(_))));
    assert!(client.is_connected());
}

#[tokio::test]
async fn roster_line_becomes_event_and_cache() {
    let (client, mut events, mut server) = connect_pair().await;

    server.send(r"RL2]\[Big Boy}|{4014}|{L]\[Switcher}|{3}|{S").await;
    let event = wait_for(&mut events, |e| matches!(e, WiThrottleEvent::Roster(_))).await;

    let WiThrottleEvent::Roster(roster) = event else { unreachable!() };
    assert_eq!(roster.len(), 2);
    assert_eq!(roster.get(0).unwrap().name.as_str(), "Big Boy");
    assert_eq!(roster.get(1).unwrap().address, LocoAddress::short(3));
    assert_eq!(client.roster(), roster);
}

#[tokio::test]
async fn speed_requires_acknowledged_acquisition() {
    let (client, mut events, mut server) = connect_pair().await;
    let address = LocoAddress::short(3);

    client.acquire_locomotive(0, address).await.unwrap();
    assert_eq!(server.expect_line().await, "M0+S3<;>S3");
    assert_eq!(client.acquired_address(0), Some(address));
    assert!(!client.is_acquired(0));
    assert!(matches!(client.set_speed(0, 10).await, Err(Error::InvalidState(_))));

    server.send("M0+S3<;>").await;
    wait_for(&mut events, |e| matches!(e, WiThrottleEvent::Acquired { .. })).await;
    assert!(client.is_acquired(0));

    client.set_speed(0, 10).await.unwrap();
    assert_eq!(server.expect_line().await, "M0AS3<;>V10");
    client.set_direction(0, rs_knobcab::Direction::Reverse).await.unwrap();
    assert_eq!(server.expect_line().await, "M0AS3<;>R0");
    client.set_function(0, 5, true).await.unwrap();
    assert_eq!(server.expect_line().await, "M0AS3<;>F15");

    client.release_locomotive(0).await.unwrap();
    assert_eq!(server.expect_line().await, "M0-*<;>r");
    assert_eq!(client.acquired_address(0), None);
}

#[tokio::test]
async fn throttle_update_acknowledges_matching_acquisition() {
    let (client, mut events, mut server) = connect_pair().await;
    client
        .acquire_locomotive(1, LocoAddress::long(40))
        .await
        .unwrap();
    assert_eq!(server.expect_line().await, "M1+L40<;>L40");

    server.send("M1AL40<;>V25").await;
    let event = wait_for(&mut events, |e| matches!(e, WiThrottleEvent::ThrottleUpdate(_))).await;
    let WiThrottleEvent::ThrottleUpdate(update) = event else { unreachable!() };
    assert_eq!(update.throttle, 1);
    assert_eq!(update.speed, Some(25));
    assert!(client.is_acquired(1));
}

#[tokio::test]
async fn query_needs_recorded_acquisition() {
    let (client, _events, mut server) = connect_pair().await;
    assert!(matches!(client.query_speed(2).await, Err(Error::InvalidState(_))));

    client.acquire_locomotive(2, LocoAddress::short(7)).await.unwrap();
    assert_eq!(server.expect_line().await, "M2+S7<;>S7");
    client.query_speed(2).await.unwrap();
    assert_eq!(server.expect_line().await, "M2AS7<;>qV");
    client.query_direction(2).await.unwrap();
    assert_eq!(server.expect_line().await, "M2AS7<;>qR");
}

#[tokio::test]
async fn throttle_id_out_of_range_is_invalid() {
    let (client, _events, _server) = connect_pair().await;
    let result = client.acquire_locomotive(10, LocoAddress::short(3)).await;
    assert!(matches!(result, Err(Error::InvalidParameter(_))));
}

#[tokio::test]
async fn server_heartbeat_is_answered() {
    let (_client, _events, mut server) = connect_pair().await;
    server.send("*").await;
    assert_eq!(server.expect_line().await, "*");
}

#[tokio::test]
async fn web_port_and_track_power_are_reported() {
    let (client, mut events, mut server) = connect_pair().await;

    server.send("PW12080").await;
    let event = wait_for(&mut events, |e| matches!(e, WiThrottleEvent::WebPort(_))).await;
    assert_eq!(event, WiThrottleEvent::WebPort(12080));
    assert_eq!(client.web_port(), Some(12080));

    server.send("PPA1").await;
    wait_for(&mut events, |e| matches!(e, WiThrottleEvent::TrackPower { track: Track::Prog, .. })).await;
    assert_eq!(client.track_power(Track::Main), PowerState::On);
    assert_eq!(client.track_power(Track::Prog), PowerState::On);

    client.set_track_power(false).await.unwrap();
    assert_eq!(server.expect_line().await, "PPA0");
}

#[tokio::test]
async fn malformed_lines_are_dropped() {
    let (client, mut events, mut server) = connect_pair().await;
    server.send("PWnot-a-port").await;
    server.send("Xwhatever").await;
    server.send("VN2.0").await;

    let event = wait_for(&mut events, |e| matches!(e, WiThrottleEvent::ServerVersion(_))).await;
    assert_eq!(event, WiThrottleEvent::ServerVersion("2.0".into()));
    assert!(client.is_connected());
    assert_eq!(client.web_port(), None);
}

#[tokio::test]
async fn server_close_disconnects() {
    let (client, mut events, server) = connect_pair().await;
    drop(server);

    wait_for(&mut events, |e| {
        *e == WiThrottleEvent::Connection(ConnectionState::Disconnected)
    })
    .await;
    assert!(!client.is_connected());
    assert!(matches!(client.set_track_power(true).await, Err(Error::NotConnected)));
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (client, _events, _server) = connect_pair().await;
    client.disconnect().await;
    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    // Heartbeats on a closed client are silently skipped.
    client.send_heartbeat().await.unwrap();
}

#[tokio::test]
async fn controller_drives_the_real_client() {
    let (client, mut events, mut server) = connect_pair().await;
    let controller = ThrottleController::new(Arc::clone(&client), &ThrottleConfig::default());

    server.send(r"RL1]\[Switcher}|{3}|{S").await;
    let WiThrottleEvent::Roster(roster) =
        wait_for(&mut events, |e| matches!(e, WiThrottleEvent::Roster(_))).await
    else {
        unreachable!()
    };
    controller.on_roster(roster).await.unwrap();

    controller.on_knob_touch(0, 1).await.unwrap();
    controller.on_knob_press(1).await.unwrap();
    assert_eq!(server.expect_line().await, "M0+S3<;>S3");

    server.send("M0+S3<;>").await;
    wait_for(&mut events, |e| matches!(e, WiThrottleEvent::Acquired { .. })).await;

    controller.on_knob_rotate(1, 2).await.unwrap();
    assert_eq!(server.expect_line().await, "M0AS3<;>V8");
}

async fn accept_handshake(listener: &TcpListener) -> Server {
    let (socket, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("timed out waiting for the client")
        .unwrap();
    let (read, write) = socket.into_split();
    let mut server = Server {
        lines: BufReader::new(read).lines(),
        write,
    };
    assert_eq!(server.expect_line().await, "NTest Cab");
    assert_eq!(server.expect_line().await, "HUabc123");
    server
}

fn two_locos() -> Roster {
    Roster::from_entries([
        RosterEntry::new("Switcher", 3, AddressType::Short),
        RosterEntry::new("Mikado", 40, AddressType::Long),
    ])
    .0
}

#[tokio::test]
async fn reconnect_reacquires_owned_locomotives() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = Arc::new(WiThrottleClient::new(options()));
    let mut events = client.subscribe();
    let controller = Arc::new(ThrottleController::new(
        Arc::clone(&client),
        &ThrottleConfig::default(),
    ));
    controller.on_roster(two_locos()).await.unwrap();

    let (connected, mut server) =
        tokio::join!(client.connect("127.0.0.1", port), accept_handshake(&listener));
    connected.unwrap();
    // Subscribed after the first Connected so only the reconnect is routed.
    let bridge = spawn_withrottle_bridge(client.subscribe(), Arc::clone(&controller));

    controller.on_knob_touch(0, 1).await.unwrap();
    controller.on_knob_press(1).await.unwrap();
    assert_eq!(server.expect_line().await, "M0+S3<;>S3");
    server.send("M0+S3<;>").await;
    wait_for(&mut events, |e| matches!(e, WiThrottleEvent::Acquired { .. })).await;
    controller.on_knob_rotate(1, 2).await.unwrap();
    assert_eq!(server.expect_line().await, "M0AS3<;>V8");

    drop(server);
    wait_for(&mut events, |e| {
        *e == WiThrottleEvent::Connection(ConnectionState::Disconnected)
    })
    .await;

    let (connected, mut server) =
        tokio::join!(client.connect("127.0.0.1", port), accept_handshake(&listener));
    connected.unwrap();
    assert_eq!(server.expect_line().await, "M0+S3<;>S3");
    assert!(!client.is_acquired(0));

    server.send("M0+S3<;>").await;
    wait_for(&mut events, |e| matches!(e, WiThrottleEvent::Acquired { .. })).await;
    controller.on_knob_rotate(1, 2).await.unwrap();
    assert_eq!(server.expect_line().await, "M0AS3<;>V16");

    bridge.abort();
}

#[tokio::test]
async fn stale_release_echo_keeps_the_new_locomotive() {
    let (client, mut events, mut server) = connect_pair().await;
    let controller = ThrottleController::new(Arc::clone(&client), &ThrottleConfig::default());
    controller.on_roster(two_locos()).await.unwrap();

    controller.on_knob_touch(0, 1).await.unwrap();
    controller.on_knob_press(1).await.unwrap();
    assert_eq!(server.expect_line().await, "M0+S3<;>S3");
    server.send("M0+S3<;>").await;
    wait_for(&mut events, |e| matches!(e, WiThrottleEvent::Acquired { .. })).await;

    controller.on_throttle_release(0).await.unwrap();
    assert_eq!(server.expect_line().await, "M0-*<;>r");
    controller.on_knob_touch(0, 1).await.unwrap();
    controller.on_knob_rotate(1, 1).await.unwrap();
    controller.on_knob_press(1).await.unwrap();
    assert_eq!(server.expect_line().await, "M0+L40<;>L40");

    // The server's answer to the first release arrives late.
    server.send("M0-S3<;>").await;
    let echo = wait_for(&mut events, |e| matches!(e, WiThrottleEvent::Released { .. })).await;
    assert_eq!(
        echo,
        WiThrottleEvent::Released {
            throttle: 0,
            address: Some(LocoAddress::short(3))
        }
    );
    apply_event(&controller, echo).await.unwrap();

    assert_eq!(client.acquired_address(0), Some(LocoAddress::long(40)));
    let snap = controller.throttle_snapshot(0).await.unwrap();
    assert_eq!(snap.state, ThrottleState::Allocated);
    assert_eq!(snap.loco_address, Some(LocoAddress::long(40)));

    server.send("M0-L40<;>").await;
    let release = wait_for(&mut events, |e| matches!(e, WiThrottleEvent::Released { .. })).await;
    apply_event(&controller, release).await.unwrap();
    assert_eq!(client.acquired_address(0), None);
    assert_eq!(
        controller.throttle_snapshot(0).await.unwrap().state,
        ThrottleState::Unallocated
    );
}
