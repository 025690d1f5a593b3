//! Initialization gating: requests issued before the peer's initialize
//! marker buffer locally and flush in issue order once it arrives.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wiremux::{ChannelClient, ChannelServer, RemoteChannel};
use wiremux_protocol::{Body, Message, Request};
use wiremux_test_utils::{MockChannel, recording_pair};

#[tokio::test]
async fn early_calls_flush_in_issue_order_and_resolve() {
    let (client_io, server_io, client_to_server) = recording_pair();
    let client = ChannelClient::new(client_io);
    let channel = client.get_channel("echo");

    // Three calls issued synchronously, well before any server exists.
    let first = channel.call("echo", Body::text("one"), CancellationToken::new());
    let second = channel.call("echo", Body::text("two"), CancellationToken::new());
    let third = channel.call("echo", Body::text("three"), CancellationToken::new());

    let serve = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let server = ChannelServer::new(server_io);
        let (mock, _cancels) = MockChannel::new();
        server.register_channel("echo", mock);
        server
    };

    let ((r1, r2, r3), _server) = tokio::join!(
        async { tokio::join!(first, second, third) },
        serve
    );
    assert_eq!(r1.unwrap(), Body::text("one"));
    assert_eq!(r2.unwrap(), Body::text("two"));
    assert_eq!(r3.unwrap(), Body::text("three"));

    // Exactly three request frames went out, in issue order.
    let sent: Vec<(u64, Body)> = client_to_server
        .messages()
        .into_iter()
        .filter_map(|m| match m {
            Message::Request(Request::Promise { id, arg, .. }) => Some((id, arg)),
            _ => None,
        })
        .collect();
    assert_eq!(
        sent,
        vec![
            (0, Body::text("one")),
            (1, Body::text("two")),
            (2, Body::text("three")),
        ]
    );
}

#[tokio::test]
async fn listen_waits_for_initialization_before_subscribing() {
    let (client_io, server_io, client_to_server) = recording_pair();
    let client = ChannelClient::new(client_io);
    let mut sub = client.get_channel("pulse").listen("pong", Body::None);

    // Nothing may go out while uninitialized.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(client_to_server.messages().is_empty());

    let server = ChannelServer::new(server_io);
    let (mock, _cancels) = MockChannel::new();
    server.register_channel("pulse", mock.clone());

    tokio::time::timeout(Duration::from_millis(500), async {
        while mock.listener_count() != 1 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("subscription never reached the server");

    mock.fire(Body::text("late but delivered"));
    assert_eq!(
        tokio::time::timeout(Duration::from_millis(500), sub.recv())
            .await
            .unwrap(),
        Some(Body::text("late but delivered"))
    );
}

#[tokio::test]
async fn listen_dropped_before_initialization_never_sends() {
    let (client_io, server_io, client_to_server) = recording_pair();
    let client = ChannelClient::new(client_io);

    let sub = client.get_channel("pulse").listen("pong", Body::None);
    tokio::time::sleep(Duration::from_millis(5)).await;
    drop(sub);
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Initialization arrives after the subscriber already went away.
    let _server = ChannelServer::new(server_io);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let sent = client_to_server.messages();
    assert!(
        sent.iter().all(|m| !matches!(
            m,
            Message::Request(Request::EventListen { .. })
                | Message::Request(Request::EventDispose { .. })
        )),
        "a listen withdrawn before init must leave no wire trace, got {sent:?}"
    );
}
