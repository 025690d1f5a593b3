//! Channel-server engine: dispatches incoming requests to registered
//! channels and streams responses back.
//!
//! The engine's first act on a connection is sending the `Initialize`
//! marker; that is what unblocks the remote client's buffered queue.
//! Every in-flight command and subscription holds a cancel token under its
//! request id.  Once a cancel arrives for an id, no terminal response is
//! emitted for it, even if the handler completes afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use wiremux_protocol::{Body, Message, RemoteError, Request, Response};

use crate::channel::{CallFault, ServerChannel};
use crate::transport::{FrameSink, MessageIo, spawn_route_loop};
use crate::util::lock;

struct ServerShared {
    sink: FrameSink,
    channels: Mutex<HashMap<String, Arc<dyn ServerChannel>>>,
    active: Mutex<HashMap<u64, CancellationToken>>,
}

/// The answering half of one connection.
pub struct ChannelServer {
    shared: Arc<ServerShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelServer {
    /// Bind a server engine directly to a transport.  Response frames
    /// arriving on this transport are ignored; co-host a client with
    /// [`crate::Peer`] when both directions are needed.
    pub fn new(io: MessageIo) -> Self {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, _resp_rx) = mpsc::unbounded_channel();
        let route = spawn_route_loop(io.rx, req_tx, resp_tx);
        let mut server = Self::attach(FrameSink::new(io.tx), req_rx);
        server.tasks.push(route);
        server
    }

    pub(crate) fn attach(sink: FrameSink, requests: mpsc::UnboundedReceiver<Request>) -> Self {
        // The initialize marker precedes every response frame, exactly once.
        sink.send(&Message::Response(Response::Initialize));
        let shared = Arc::new(ServerShared {
            sink,
            channels: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        });
        let reader = tokio::spawn(request_loop(Arc::clone(&shared), requests));
        ChannelServer {
            shared,
            tasks: vec![reader],
        }
    }

    /// Expose a channel under `name`.  Safe to call while frames are in
    /// flight; subsequent requests see the new channel.
    pub fn register_channel(&self, name: impl Into<String>, channel: Arc<dyn ServerChannel>) {
        lock(&self.shared.channels).insert(name.into(), channel);
    }

    /// Tear the engine down: cancel everything in flight and stop
    /// listening to the transport.
    pub fn dispose(&mut self) {
        for (_, token) in lock(&self.shared.active).drain() {
            token.cancel();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn request_loop(shared: Arc<ServerShared>, mut requests: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = requests.recv().await {
        match request {
            Request::Promise {
                id,
                channel,
                name,
                arg,
            } => handle_call(&shared, id, &channel, name, arg),
            Request::EventListen {
                id,
                channel,
                name,
                arg,
            } => handle_listen(&shared, id, &channel, name, arg),
            // Both are idempotent: an unknown id is a no-op.
            Request::PromiseCancel { id } | Request::EventDispose { id } => {
                if let Some(token) = lock(&shared.active).remove(&id) {
                    token.cancel();
                }
            }
        }
    }
    // Transport gone: cancel whatever is still running.
    for (_, token) in lock(&shared.active).drain() {
        token.cancel();
    }
}

fn handle_call(shared: &Arc<ServerShared>, id: u64, channel_name: &str, name: String, arg: Body) {
    let Some(channel) = lock(&shared.channels).get(channel_name).cloned() else {
        warn!(channel = channel_name, command = %name, "call for unknown channel");
        shared.sink.send(&Message::Response(Response::PromiseError {
            id,
            error: RemoteError::not_implemented(format!("unknown channel '{channel_name}'")),
        }));
        return;
    };

    let token = CancellationToken::new();
    lock(&shared.active).insert(id, token.clone());

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            result = channel.call(&name, arg, token.clone()) => Some(result),
        };
        // A cancel that raced the completion still suppresses the
        // terminal response.
        if let Some(result) = outcome {
            if !token.is_cancelled() {
                let response = match result {
                    Ok(data) => Response::PromiseSuccess { id, data },
                    Err(CallFault::Error(error)) => Response::PromiseError { id, error },
                    Err(CallFault::Value(data)) => Response::PromiseErrorObj { id, data },
                };
                shared.sink.send(&Message::Response(response));
            }
        }
        lock(&shared.active).remove(&id);
    });
}

fn handle_listen(shared: &Arc<ServerShared>, id: u64, channel_name: &str, name: String, arg: Body) {
    let Some(channel) = lock(&shared.channels).get(channel_name).cloned() else {
        warn!(channel = channel_name, event = %name, "listen for unknown channel");
        return;
    };
    let mut stream = match channel.listen(&name, arg) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(channel = channel_name, event = %name, error = %error, "listen rejected");
            return;
        }
    };

    let token = CancellationToken::new();
    lock(&shared.active).insert(id, token.clone());

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                item = stream.next() => match item {
                    Some(data) => shared
                        .sink
                        .send(&Message::Response(Response::EventFire { id, data })),
                    None => break,
                }
            }
        }
        lock(&shared.active).remove(&id);
    });
}
