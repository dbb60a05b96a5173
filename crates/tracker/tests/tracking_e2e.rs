use std::net::SocketAddr;
use std::time::Duration;

use relay::{AppState, RelayConfig};
use shared::{BookingId, Encoding, Location, DEFAULT_ACK_MESSAGE};
use tokio::net::TcpListener;
use tracker::{
    DispatchStatus, Phase, ReconnectPolicy, SessionConfig, SessionHandle, SimulatedRoute,
};

async fn start_relay_on(listener: TcpListener) -> AppState {
    let app = AppState::new(&RelayConfig::default());
    tokio::spawn(relay::server::serve(
        listener,
        app.clone(),
        std::future::pending(),
    ));
    app
}

async fn start_relay() -> (SocketAddr, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, start_relay_on(listener).await)
}

fn config(addr: SocketAddr, booking: &str) -> SessionConfig {
    let mut config = SessionConfig::new(format!("ws://{addr}/ws"), BookingId::new(booking).unwrap());
    config.reconnect = ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        jitter: Duration::ZERO,
        max_attempts: None,
    };
    config
}

fn route() -> Vec<Location> {
    (0..6)
        .map(|i| Location::new(12.9716 + i as f64 * 0.001, 77.5946).unwrap())
        .collect()
}

async fn wait_for_members(app: &AppState, booking: &str, expected: usize) {
    let booking = BookingId::new(booking).unwrap();
    for _ in 0..300 {
        if app.relay.member_count(&booking) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room {booking} never reached {expected} members");
}

async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

async fn watch_only(addr: SocketAddr, booking: &str) -> SessionHandle {
    tracker::spawn(config(addr, booking), None)
}

#[tokio::test]
async fn patient_follows_a_simulated_route_to_the_end() {
    let (addr, app) = start_relay().await;
    let patient = watch_only(addr, "B123").await;
    within(patient.wait_for(|s| s.phase == Phase::Joined)).await.unwrap();
    wait_for_members(&app, "B123", 1).await;

    let waypoints = route();
    let last = *waypoints.last().unwrap();
    let driver = tracker::spawn(
        config(addr, "B123"),
        Some(Box::new(SimulatedRoute::new(waypoints, Duration::from_millis(30)))),
    );

    let done = within(driver.wait_for(|s| s.phase == Phase::Idle)).await.unwrap();
    assert_eq!(done.sent, 6);
    assert_eq!(done.remote_location, None);

    let seen = within(patient.wait_for(|s| s.remote_location == Some(last)))
        .await
        .unwrap();
    assert_eq!(seen.phase, Phase::Joined);
    assert_eq!(seen.sent, 0);

    driver.close().await.unwrap();
    patient.close().await.unwrap();
    wait_for_members(&app, "B123", 0).await;
}

#[tokio::test]
async fn dispatcher_acknowledgement_flips_every_session() {
    let (addr, app) = start_relay().await;
    let patient = watch_only(addr, "B123").await;
    let dispatcher = watch_only(addr, "B123").await;
    let bystander = watch_only(addr, "B999").await;
    wait_for_members(&app, "B123", 2).await;
    wait_for_members(&app, "B999", 1).await;

    assert_eq!(patient.snapshot().dispatch, DispatchStatus::AwaitingDispatch);
    dispatcher.acknowledge(None).await.unwrap();

    let expected = DispatchStatus::Acknowledged {
        message: DEFAULT_ACK_MESSAGE.to_string(),
    };
    for session in [&patient, &dispatcher] {
        let snapshot = within(session.wait_for(|s| s.dispatch != DispatchStatus::AwaitingDispatch))
            .await
            .unwrap();
        assert_eq!(snapshot.dispatch, expected);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bystander.snapshot().dispatch, DispatchStatus::AwaitingDispatch);
}

#[tokio::test]
async fn msgpack_sessions_interoperate_with_json_sessions() {
    let (addr, app) = start_relay().await;
    let mut binary = config(addr, "B42");
    binary.encoding = Encoding::MessagePack;
    let patient = tracker::spawn(binary, None);
    wait_for_members(&app, "B42", 1).await;

    let point = Location::new(12.9716, 77.5946).unwrap();
    let driver = tracker::spawn(
        config(addr, "B42"),
        Some(Box::new(SimulatedRoute::new(vec![point], Duration::from_millis(10)))),
    );

    let seen = within(patient.wait_for(|s| s.remote_location.is_some()))
        .await
        .unwrap();
    assert_eq!(seen.remote_location, Some(point));
    driver.close().await.unwrap();
}

#[tokio::test]
async fn session_rejoins_once_the_relay_comes_back() {
    // reserve a port, then leave it closed for a while
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let patient = watch_only(addr, "B7").await;
    let reconnecting = within(patient.wait_for(|s| matches!(s.phase, Phase::Reconnecting { .. })))
        .await
        .unwrap();
    assert_eq!(reconnecting.remote_location, None);

    let app = start_relay_on(TcpListener::bind(addr).await.unwrap()).await;
    within(patient.wait_for(|s| s.phase == Phase::Joined)).await.unwrap();
    wait_for_members(&app, "B7", 1).await;

    patient.close().await.unwrap();
    wait_for_members(&app, "B7", 0).await;
}

#[tokio::test]
async fn closing_a_session_releases_the_room_promptly() {
    let (addr, app) = start_relay().await;
    let session = watch_only(addr, "B5").await;
    wait_for_members(&app, "B5", 1).await;

    let mut updates = session.subscribe();
    session.close().await.unwrap();

    assert_eq!(updates.borrow_and_update().phase, Phase::Disconnected);
    wait_for_members(&app, "B5", 0).await;
    assert_eq!(app.relay.room_count(), 0);
}

#[tokio::test]
async fn dropping_the_handle_releases_the_room() {
    let (addr, app) = start_relay().await;
    let session = watch_only(addr, "B1").await;
    within(session.wait_for(|s| s.phase == Phase::Joined)).await.unwrap();
    wait_for_members(&app, "B1", 1).await;

    drop(session);

    wait_for_members(&app, "B1", 0).await;
    for _ in 0..300 {
        if app.relay.peer_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("dropped session kept its connection open");
}

#[tokio::test]
async fn two_drivers_on_one_booking_both_broadcast_and_the_last_fix_wins() {
    let (addr, app) = start_relay().await;
    let patient = watch_only(addr, "B77").await;
    wait_for_members(&app, "B77", 1).await;

    let first = Location::new(12.9716, 77.5946).unwrap();
    let second = Location::new(12.9352, 77.6245).unwrap();

    let driver_a = tracker::spawn(
        config(addr, "B77"),
        Some(Box::new(SimulatedRoute::new(vec![first], Duration::from_millis(10)))),
    );
    within(patient.wait_for(|s| s.remote_location == Some(first)))
        .await
        .unwrap();
    within(driver_a.wait_for(|s| s.phase == Phase::Idle)).await.unwrap();

    let driver_b = tracker::spawn(
        config(addr, "B77"),
        Some(Box::new(SimulatedRoute::new(vec![second], Duration::from_millis(10)))),
    );
    let seen = within(patient.wait_for(|s| s.remote_location == Some(second)))
        .await
        .unwrap();
    assert_eq!(seen.sent, 0);

    // the drivers hear each other too
    let a = within(driver_a.wait_for(|s| s.remote_location == Some(second)))
        .await
        .unwrap();
    assert_eq!(a.sent, 1);
    assert_eq!(app.relay.member_count(&BookingId::new("B77").unwrap()), 3);

    driver_a.close().await.unwrap();
    driver_b.close().await.unwrap();
    patient.close().await.unwrap();
}
