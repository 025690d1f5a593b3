//! End-to-end call/response over an in-process transport pair.
//!
//! Covers the request/response happy path, both rejection shapes, the
//! not-implemented normalization for unknown channels and commands, and
//! interleaving of concurrent calls.

use tokio_util::sync::CancellationToken;
use wiremux::{ChannelClient, ChannelServer, RemoteChannel, RpcError};
use wiremux_protocol::{Body, NOT_IMPLEMENTED};
use wiremux_test_utils::{MockChannel, transport_pair};

/// A server offering the mock channel as `echo`, joined to a client.
fn echo_pair() -> (ChannelServer, ChannelClient) {
    let (server_io, client_io) = transport_pair();
    let server = ChannelServer::new(server_io);
    let (mock, _cancels) = MockChannel::new();
    server.register_channel("echo", mock);
    let client = ChannelClient::new(client_io);
    (server, client)
}

#[tokio::test]
async fn marco_polo() {
    let (_server, client) = echo_pair();
    let reply = client
        .get_channel("echo")
        .call("marco", Body::None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply, Body::text("polo"));
}

#[tokio::test]
async fn echo_round_trips_every_body_class() {
    let (_server, client) = echo_pair();
    let channel = client.get_channel("echo");

    for body in [
        Body::None,
        Body::text("plain text"),
        Body::Bytes(vec![0, 1, 2, 255]),
        Body::Value(serde_json::json!({"k": [1, 2], "nested": {"ok": true}})),
    ] {
        let reply = channel
            .call("echo", body.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply, body);
    }
}

#[tokio::test]
async fn structured_error_preserves_message_name_and_stack() {
    let (_server, client) = echo_pair();
    let result = client
        .get_channel("echo")
        .call("fail", Body::text("nice error"), CancellationToken::new())
        .await;

    match result {
        Err(RpcError::Remote(e)) => {
            assert_eq!(e.message, "nice error");
            assert_eq!(e.name, "Error");
            assert!(!e.stack.is_empty(), "stack should survive the wire");
        }
        other => panic!("expected a structured remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn value_rejection_is_delivered_verbatim() {
    let (_server, client) = echo_pair();
    let result = client
        .get_channel("echo")
        .call(
            "fail-value",
            Body::Value(serde_json::json!(42)),
            CancellationToken::new(),
        )
        .await;

    match result {
        Err(RpcError::RemoteValue(value)) => {
            assert_eq!(value, Body::Value(serde_json::json!(42)));
        }
        other => panic!("expected a value rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_channel_rejects_as_not_implemented() {
    let (_server, client) = echo_pair();
    let result = client
        .get_channel("no-such-channel")
        .call("marco", Body::None, CancellationToken::new())
        .await;

    match result {
        Err(RpcError::Remote(e)) => assert_eq!(e.name, NOT_IMPLEMENTED),
        other => panic!("expected not-implemented, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_command_rejects_as_not_implemented() {
    let (_server, client) = echo_pair();
    let result = client
        .get_channel("echo")
        .call("bogus", Body::None, CancellationToken::new())
        .await;

    match result {
        Err(RpcError::Remote(e)) => assert_eq!(e.name, NOT_IMPLEMENTED),
        other => panic!("expected not-implemented, got {other:?}"),
    }
}

/// Concurrent calls may interleave on the wire, but each caller sees only
/// its own response.
#[tokio::test]
async fn concurrent_calls_settle_independently() {
    let (_server, client) = echo_pair();
    let channel = client.get_channel("echo");

    let calls = (0..8).map(|i| {
        let channel = channel.clone();
        async move {
            let payload = Body::text(format!("payload-{i}"));
            let reply = channel
                .call("echo", payload.clone(), CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(reply, payload);
        }
    });
    futures_util::future::join_all(calls).await;
}
