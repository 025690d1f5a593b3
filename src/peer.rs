//! A peer endpoint: one client engine and one server engine co-hosted on
//! a single transport, so each side can both offer and consume channels.
//!
//! # Connect sequence
//! 1. The connecting side writes its identity: one transport message whose
//!    bytes are the raw UTF-8 id string.  This is not a protocol frame;
//!    the accepting side ([`crate::MuxServer`]) consumes exactly this one
//!    message before constructing its engines.
//! 2. Both sides then speak protocol frames.  A shared routing loop feeds
//!    request frames to the server engine and response frames to the
//!    client engine.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::ServerChannel;
use crate::client::{ChannelClient, ClientChannel};
use crate::server::ChannelServer;
use crate::transport::{FrameSink, MessageIo, spawn_route_loop};

/// One endpoint of a transport, hosting both engine halves.
pub struct Peer {
    // Declaration order doubles as disposal order: client before server.
    client: ChannelClient,
    server: ChannelServer,
    route: JoinHandle<()>,
}

impl Peer {
    /// Connect as the initiating side, announcing `id` before anything
    /// else goes onto the transport.
    pub fn connect(io: MessageIo, id: &str) -> Self {
        let _ = io.tx.send(id.as_bytes().to_vec());
        Self::attach(io)
    }

    /// Build the engine pair on a transport whose identity exchange (if
    /// any) has already happened.
    pub(crate) fn attach(io: MessageIo) -> Self {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let route = spawn_route_loop(io.rx, req_tx, resp_tx);
        let sink = FrameSink::new(io.tx);
        let server = ChannelServer::attach(sink.clone(), req_rx);
        let client = ChannelClient::attach(sink, resp_rx);
        Peer {
            client,
            server,
            route,
        }
    }

    /// A handle onto a channel offered by the remote side.
    pub fn get_channel(&self, name: impl Into<String>) -> ClientChannel {
        self.client.get_channel(name)
    }

    /// Offer a channel to the remote side.
    pub fn register_channel(&self, name: impl Into<String>, channel: std::sync::Arc<dyn ServerChannel>) {
        self.server.register_channel(name, channel);
    }

    pub fn client(&self) -> &ChannelClient {
        &self.client
    }

    pub fn server(&self) -> &ChannelServer {
        &self.server
    }

    /// Tear down both halves, client first.
    pub fn dispose(&mut self) {
        self.route.abort();
        self.client.dispose();
        self.server.dispose();
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.route.abort();
    }
}
