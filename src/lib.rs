//! wiremux: a bidirectional request/response + event-subscription
//! multiplexer over any reliable, in-order, message-framed transport.
//!
//! Two peers expose named channels (collections of remotely invokable
//! commands and subscribable events) to each other, issue concurrent
//! cancellable requests, and stream long-lived event subscriptions.  A
//! [`MuxServer`] accepts a fleet of peers and routes calls between them
//! through a caller-supplied [`Router`].
//!
//! The transport is a contract, not an implementation: anything that can
//! send one opaque frame and deliver inbound frames in order (a pipe to a
//! child process, a named socket, a WebSocket) plugs in via [`MessageIo`].
//! Wire-level types live in the `wiremux-protocol` crate, re-exported
//! here as [`protocol`].

pub mod channel;
pub mod client;
pub mod delayed;
pub mod error;
pub mod mux;
pub mod peer;
pub mod server;
pub mod transport;
mod util;

pub use channel::{CallFault, RemoteChannel, ServerChannel, Subscription};
pub use client::{ChannelClient, ClientChannel};
pub use delayed::{DelayedChannel, NextTickChannel};
pub use error::RpcError;
pub use mux::{ClientConnectEvent, MuxServer, RoutedChannel, Router};
pub use peer::Peer;
pub use server::ChannelServer;
pub use transport::MessageIo;

pub use tokio_util::sync::CancellationToken;
pub use wiremux_protocol as protocol;
