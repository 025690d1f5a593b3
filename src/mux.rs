//! Multi-client server: accepts many peer connections and routes outgoing
//! calls to a specific connected peer via a caller-supplied router.
//!
//! # Connection lifecycle
//! 1. A connect event arrives carrying a fresh transport and a
//!    disconnect future.
//! 2. Exactly one inbound transport message is read; its raw bytes are the
//!    peer's UTF-8 id.
//! 3. An engine pair is built on the transport, every currently offered
//!    channel is registered on its server half, and the pair is stored in
//!    the registry under the peer id.
//! 4. When the disconnect future fires, the pair is disposed (client half
//!    first) and removed.
//!
//! Connections are isolated: disposing one peer's transport never touches
//! another peer's outstanding work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wiremux_protocol::Body;

use crate::channel::{RemoteChannel, ServerChannel, Subscription};
use crate::client::ClientChannel;
use crate::delayed::DelayedChannel;
use crate::error::RpcError;
use crate::peer::Peer;
use crate::transport::MessageIo;
use crate::util::lock;

/// A new client connection, as produced by whatever accept loop feeds the
/// server: the transport plus a future that fires on disconnect.
pub struct ClientConnectEvent {
    pub io: MessageIo,
    pub disconnected: oneshot::Receiver<()>,
}

/// Picks the peer that should serve a given command or event.
pub trait Router: Send + Sync + 'static {
    fn route_call(&self, command: &str, arg: &Body) -> String;
    fn route_event(&self, event: &str, arg: &Body) -> String;
}

struct MuxShared {
    channels: Mutex<HashMap<String, Arc<dyn ServerChannel>>>,
    /// Peer id -> (connection generation, engine pair).  The generation
    /// guards against a stale disconnect removing a replacement connection.
    connections: Mutex<HashMap<String, (u64, Peer)>>,
    added_tx: broadcast::Sender<String>,
    seq: AtomicU64,
}

/// A server hosting one engine pair per connected peer.
pub struct MuxServer {
    shared: Arc<MuxShared>,
}

impl MuxServer {
    pub fn new() -> Self {
        let (added_tx, _) = broadcast::channel(64);
        MuxServer {
            shared: Arc::new(MuxShared {
                channels: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                added_tx,
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Offer a channel to every peer: future connections pick it up at
    /// accept time, live connections immediately.
    pub fn register_channel(&self, name: impl Into<String>, channel: Arc<dyn ServerChannel>) {
        let name = name.into();
        lock(&self.shared.channels).insert(name.clone(), Arc::clone(&channel));
        for (_, peer) in lock(&self.shared.connections).values() {
            peer.register_channel(name.clone(), Arc::clone(&channel));
        }
    }

    /// Take ownership of a new client connection.
    pub fn accept(&self, event: ClientConnectEvent) {
        tokio::spawn(handle_connection(Arc::clone(&self.shared), event));
    }

    /// Signal stream carrying the id of each newly connected peer.
    pub fn on_client_added(&self) -> broadcast::Receiver<String> {
        self.shared.added_tx.subscribe()
    }

    /// A facade for the named channel whose per-operation target peer is
    /// chosen by `router`.  Operations aimed at a peer that has not
    /// connected yet wait for it, subject to the caller's cancellation.
    pub fn get_channel(&self, name: impl Into<String>, router: Arc<dyn Router>) -> RoutedChannel {
        RoutedChannel {
            shared: Arc::clone(&self.shared),
            name: name.into(),
            router,
        }
    }

    /// Dispose every connection and forget them.
    pub fn dispose(&mut self) {
        for (_, (_, mut peer)) in lock(&self.shared.connections).drain() {
            peer.dispose();
        }
    }
}

impl Default for MuxServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_connection(shared: Arc<MuxShared>, event: ClientConnectEvent) {
    let ClientConnectEvent {
        mut io,
        disconnected,
    } = event;

    // The first transport message is the peer id, raw UTF-8 bytes.
    let Some(first) = io.rx.recv().await else {
        return;
    };
    let peer_id = match String::from_utf8(first) {
        Ok(id) => id,
        Err(_) => {
            warn!("dropping connection announcing a non-UTF-8 peer id");
            return;
        }
    };

    let peer = Peer::attach(io);
    for (name, channel) in lock(&shared.channels).iter() {
        peer.register_channel(name.clone(), Arc::clone(channel));
    }

    let generation = shared.seq.fetch_add(1, Ordering::Relaxed);
    let replaced = lock(&shared.connections).insert(peer_id.clone(), (generation, peer));
    if let Some((_, mut old)) = replaced {
        debug!(peer = %peer_id, "replacing existing connection for peer id");
        old.dispose();
    }
    info!(peer = %peer_id, "peer connected");
    let _ = shared.added_tx.send(peer_id.clone());

    // Fires on disconnect; an error means the producing side dropped the
    // sender, which is treated the same way.
    let _ = disconnected.await;

    let removed = {
        let mut connections = lock(&shared.connections);
        let same_generation = connections
            .get(&peer_id)
            .is_some_and(|(current, _)| *current == generation);
        if same_generation {
            connections.remove(&peer_id)
        } else {
            // A replacement connection took the id over; leave it alone.
            None
        }
    };
    if let Some((_, mut peer)) = removed {
        peer.dispose();
        info!(peer = %peer_id, "peer disconnected");
    }
}

/// The facade returned by [`MuxServer::get_channel`].
pub struct RoutedChannel {
    shared: Arc<MuxShared>,
    name: String,
    router: Arc<dyn Router>,
}

impl RoutedChannel {
    /// A delayed channel that resolves once `peer_id` is connected.
    fn channel_on(&self, peer_id: String) -> DelayedChannel<ClientChannel> {
        let shared = Arc::clone(&self.shared);
        let name = self.name.clone();
        DelayedChannel::new(client_channel_for(shared, peer_id, name))
    }
}

impl RemoteChannel for RoutedChannel {
    fn call(
        &self,
        command: &str,
        arg: Body,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, RpcError>> {
        let target = self.router.route_call(command, &arg);
        self.channel_on(target).call(command, arg, cancel)
    }

    fn listen(&self, event: &str, arg: Body) -> Subscription {
        let target = self.router.route_event(event, &arg);
        self.channel_on(target).listen(event, arg)
    }
}

async fn client_channel_for(
    shared: Arc<MuxShared>,
    peer_id: String,
    name: String,
) -> Result<ClientChannel, RpcError> {
    // Subscribe before checking the registry so a connect landing in
    // between is not missed.
    let mut added = shared.added_tx.subscribe();
    if let Some((_, peer)) = lock(&shared.connections).get(&peer_id) {
        return Ok(peer.get_channel(name.as_str()));
    }
    loop {
        match added.recv().await {
            Ok(id) if id == peer_id => {
                if let Some((_, peer)) = lock(&shared.connections).get(&peer_id) {
                    return Ok(peer.get_channel(name.as_str()));
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {
                if let Some((_, peer)) = lock(&shared.connections).get(&peer_id) {
                    return Ok(peer.get_channel(name.as_str()));
                }
            }
            Err(broadcast::error::RecvError::Closed) => return Err(RpcError::Disposed),
        }
    }
}
