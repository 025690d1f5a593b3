//! Routed calls across a fleet of connected peers.
//!
//! The multi-client server reads one identity message per connection,
//! keeps an engine pair per peer, and resolves each routed operation to
//! the peer a caller-supplied router names -- waiting for that peer if it
//! has not connected yet.  Connections are isolated from each other.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use wiremux::{ClientConnectEvent, MuxServer, Peer, RemoteChannel, Router};
use wiremux_protocol::Body;
use wiremux_test_utils::{MockChannel, transport_pair};

/// Routes every call and event to one fixed peer.
struct StaticRouter(&'static str);

impl Router for StaticRouter {
    fn route_call(&self, _command: &str, _arg: &Body) -> String {
        self.0.to_owned()
    }

    fn route_event(&self, _event: &str, _arg: &Body) -> String {
        self.0.to_owned()
    }
}

/// Connect a peer named `id` that offers the mock channel as `ping`.
/// Returns the peer, its mock, and the trigger for its disconnect future.
fn connect_peer(
    mux: &MuxServer,
    id: &'static str,
) -> (Peer, Arc<MockChannel>, oneshot::Sender<()>) {
    let (server_side, peer_side) = transport_pair();
    let (disconnect_tx, disconnect_rx) = oneshot::channel();
    mux.accept(ClientConnectEvent {
        io: server_side,
        disconnected: disconnect_rx,
    });

    let peer = Peer::connect(peer_side, id);
    let (mock, _cancels) = MockChannel::named(id);
    peer.register_channel("ping", mock.clone());
    (peer, mock, disconnect_tx)
}

/// Block until the mux has registered `count` peers.
async fn wait_for_peers(added: &mut tokio::sync::broadcast::Receiver<String>, count: usize) {
    tokio::time::timeout(Duration::from_millis(500), async {
        for _ in 0..count {
            added.recv().await.expect("mux dropped the added signal");
        }
    })
    .await
    .expect("peers never finished connecting");
}

#[tokio::test]
async fn calls_route_to_the_selected_peer() {
    let mux = MuxServer::new();
    let mut added = mux.on_client_added();
    let (_alpha, _alpha_mock, _alpha_disc) = connect_peer(&mux, "alpha");
    let (_beta, _beta_mock, _beta_disc) = connect_peer(&mux, "beta");
    wait_for_peers(&mut added, 2).await;

    // Alpha would answer too; the router insists on beta.
    let channel = mux.get_channel("ping", Arc::new(StaticRouter("beta")));
    let who = channel
        .call("whoami", Body::None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(who, Body::text("beta"));
}

#[tokio::test]
async fn routed_call_waits_for_a_late_peer() {
    let mux = MuxServer::new();
    let channel = mux.get_channel("ping", Arc::new(StaticRouter("gamma")));

    let call = tokio::spawn(async move {
        channel
            .call("whoami", Body::None, CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let (_gamma, _mock, _disc) = connect_peer(&mux, "gamma");
    let who = tokio::time::timeout(Duration::from_millis(500), call)
        .await
        .expect("call never saw the late peer")
        .unwrap()
        .unwrap();
    assert_eq!(who, Body::text("gamma"));
}

#[tokio::test]
async fn waiting_call_honors_cancellation() {
    let mux = MuxServer::new();
    let channel = mux.get_channel("ping", Arc::new(StaticRouter("nobody")));

    let cancel = CancellationToken::new();
    let call = tokio::spawn({
        let cancel = cancel.clone();
        async move { channel.call("whoami", Body::None, cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_millis(500), call)
        .await
        .expect("cancelled wait never settled")
        .unwrap();
    assert!(matches!(result, Err(wiremux::RpcError::Cancelled)));
}

#[tokio::test]
async fn disconnecting_one_peer_leaves_the_other_untouched() {
    let mux = MuxServer::new();
    let mut added = mux.on_client_added();
    let (_alpha, _alpha_mock, alpha_disc) = connect_peer(&mux, "alpha");
    let (_beta, _beta_mock, _beta_disc) = connect_peer(&mux, "beta");
    wait_for_peers(&mut added, 2).await;

    let channel = mux.get_channel("ping", Arc::new(StaticRouter("beta")));
    let slow_call = tokio::spawn({
        let channel = mux.get_channel("ping", Arc::new(StaticRouter("beta")));
        async move {
            channel
                .call("sleep", Body::None, CancellationToken::new())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Alpha goes away mid-flight.
    alpha_disc.send(()).unwrap();

    let done = tokio::time::timeout(Duration::from_millis(500), slow_call)
        .await
        .expect("beta's in-flight call was disturbed")
        .unwrap()
        .unwrap();
    assert_eq!(done, Body::text("done"));

    // And beta keeps answering afterwards.
    let reply = channel
        .call("marco", Body::None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply, Body::text("polo"));
}

#[tokio::test]
async fn routed_events_follow_the_router() {
    let mux = MuxServer::new();
    let mut added = mux.on_client_added();
    let (_alpha, alpha_mock, _alpha_disc) = connect_peer(&mux, "alpha");
    let (_beta, beta_mock, _beta_disc) = connect_peer(&mux, "beta");
    wait_for_peers(&mut added, 2).await;

    let channel = mux.get_channel("ping", Arc::new(StaticRouter("beta")));
    let mut sub = channel.listen("pong", Body::None);

    tokio::time::timeout(Duration::from_millis(500), async {
        while beta_mock.listener_count() != 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("subscription never reached beta");
    assert_eq!(alpha_mock.listener_count(), 0);

    beta_mock.fire(Body::text("from beta"));
    alpha_mock.fire(Body::text("from alpha"));

    assert_eq!(
        tokio::time::timeout(Duration::from_millis(500), sub.recv())
            .await
            .unwrap(),
        Some(Body::text("from beta"))
    );
    // Alpha's fire had no listener to reach.
    assert!(
        tokio::time::timeout(Duration::from_millis(50), sub.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn mux_channels_are_offered_to_every_peer() {
    let mux = MuxServer::new();
    let mut added = mux.on_client_added();

    // Registered before the first connection...
    let (sys, _cancels) = MockChannel::named("mux");
    mux.register_channel("sys", sys);

    let (peer, _mock, _disc) = connect_peer(&mux, "alpha");
    wait_for_peers(&mut added, 1).await;

    let who = peer
        .get_channel("sys")
        .call("whoami", Body::None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(who, Body::text("mux"));

    // ...and registration after connect applies to live peers immediately.
    let (extra, _extra_cancels) = MockChannel::named("extra");
    mux.register_channel("extra", extra);
    let who = peer
        .get_channel("extra")
        .call("whoami", Body::None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(who, Body::text("extra"));
}
