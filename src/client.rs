//! Channel-client engine: issues requests, correlates responses by id.
//!
//! # Lifecycle
//! 1. The engine starts uninitialized; calls issued now are buffered.
//! 2. The peer's `Initialize` frame flips it to idle and flushes the
//!    buffer in issue order, then wakes any listen waiting to subscribe.
//! 3. Terminal responses settle their call and drop the handler; event
//!    fires feed their subscription until it is disposed.
//! 4. Disposal (explicit or transport loss) settles outstanding calls as
//!    cancelled; calls issued afterwards fail as disposed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wiremux_protocol::{Body, Message, Request, Response};

use crate::channel::{RemoteChannel, Subscription};
use crate::error::RpcError;
use crate::transport::{FrameSink, MessageIo, spawn_route_loop};
use crate::util::lock;

enum Pending {
    Call(oneshot::Sender<Result<Body, RpcError>>),
    Event(mpsc::UnboundedSender<Body>),
}

/// A request issued before the peer's initialize marker arrived.
struct BufferedRequest {
    id: u64,
    message: Message,
}

enum Phase {
    Uninitialized { buffered: Vec<BufferedRequest> },
    Idle,
    Disposed,
}

struct ClientState {
    phase: Phase,
    next_id: u64,
    pending: HashMap<u64, Pending>,
}

struct ClientShared {
    sink: FrameSink,
    state: Mutex<ClientState>,
    init_tx: watch::Sender<bool>,
}

/// The requesting half of one connection.
pub struct ChannelClient {
    shared: Arc<ClientShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelClient {
    /// Bind a client engine directly to a transport.  Request frames
    /// arriving on this transport are ignored; co-host a server with
    /// [`crate::Peer`] when both directions are needed.
    pub fn new(io: MessageIo) -> Self {
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let route = spawn_route_loop(io.rx, req_tx, resp_tx);
        let mut client = Self::attach(FrameSink::new(io.tx), resp_rx);
        client.tasks.push(route);
        client
    }

    pub(crate) fn attach(sink: FrameSink, responses: mpsc::UnboundedReceiver<Response>) -> Self {
        let (init_tx, _) = watch::channel(false);
        let shared = Arc::new(ClientShared {
            sink,
            state: Mutex::new(ClientState {
                phase: Phase::Uninitialized {
                    buffered: Vec::new(),
                },
                next_id: 0,
                pending: HashMap::new(),
            }),
            init_tx,
        });
        let reader = tokio::spawn(response_loop(Arc::clone(&shared), responses));
        ChannelClient {
            shared,
            tasks: vec![reader],
        }
    }

    /// A handle onto the named channel offered by the remote peer.
    pub fn get_channel(&self, name: impl Into<String>) -> ClientChannel {
        ClientChannel {
            shared: Arc::clone(&self.shared),
            name: name.into(),
        }
    }

    /// Tear the engine down: outstanding calls settle cancelled, live
    /// subscriptions end, later calls fail as disposed.
    pub fn dispose(&mut self) {
        teardown(&self.shared);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A named remote channel reached through a [`ChannelClient`].
#[derive(Clone)]
pub struct ClientChannel {
    shared: Arc<ClientShared>,
    name: String,
}

impl ClientChannel {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl RemoteChannel for ClientChannel {
    fn call(
        &self,
        command: &str,
        arg: Body,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, RpcError>> {
        let shared = Arc::clone(&self.shared);
        let channel = self.name.clone();
        let command = command.to_owned();
        call_inner(shared, channel, command, arg, cancel).boxed()
    }

    fn listen(&self, event: &str, arg: Body) -> Subscription {
        listen_inner(
            Arc::clone(&self.shared),
            self.name.clone(),
            event.to_owned(),
            arg,
        )
    }
}

async fn call_inner(
    shared: Arc<ClientShared>,
    channel: String,
    command: String,
    arg: Body,
    cancel: CancellationToken,
) -> Result<Body, RpcError> {
    let (reply_tx, reply_rx) = oneshot::channel();

    let id = {
        let mut st = lock(&shared.state);
        if matches!(st.phase, Phase::Disposed) {
            return Err(RpcError::Disposed);
        }
        let id = st.next_id;
        st.next_id += 1;
        st.pending.insert(id, Pending::Call(reply_tx));

        let message = Message::Request(Request::Promise {
            id,
            channel,
            name: command,
            arg,
        });
        if let Phase::Uninitialized { buffered } = &mut st.phase {
            buffered.push(BufferedRequest { id, message });
        } else {
            shared.sink.send(&message);
        }
        id
    };

    tokio::select! {
        // A response that raced the cancellation wins.
        biased;
        reply = reply_rx => reply.unwrap_or(Err(RpcError::Cancelled)),
        _ = cancel.cancelled() => {
            cancel_call(&shared, id);
            Err(RpcError::Cancelled)
        }
    }
}

/// Withdraw a pending call.  A request that never left the buffer is
/// removed without touching the wire; a sent one produces one
/// `PromiseCancel`.  Either way any late terminal response is dropped.
fn cancel_call(shared: &ClientShared, id: u64) {
    let mut st = lock(&shared.state);
    if st.pending.remove(&id).is_none() {
        return;
    }
    match &mut st.phase {
        Phase::Uninitialized { buffered } => buffered.retain(|b| b.id != id),
        Phase::Idle => shared
            .sink
            .send(&Message::Request(Request::PromiseCancel { id })),
        Phase::Disposed => {}
    }
}

fn listen_inner(
    shared: Arc<ClientShared>,
    channel: String,
    event: String,
    arg: Body,
) -> Subscription {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let teardown = CancellationToken::new();
    let token = teardown.clone();
    let mut init = shared.init_tx.subscribe();

    tokio::spawn(async move {
        // Subscribe only once the connection is initialized.  A subscriber
        // that goes away first cancels the wait; nothing is ever sent.
        tokio::select! {
            _ = token.cancelled() => return,
            changed = init.wait_for(|ready| *ready) => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let id = {
            let mut st = lock(&shared.state);
            if !matches!(st.phase, Phase::Idle) {
                return;
            }
            let id = st.next_id;
            st.next_id += 1;
            st.pending.insert(id, Pending::Event(event_tx));
            shared.sink.send(&Message::Request(Request::EventListen {
                id,
                channel,
                name: event,
                arg,
            }));
            id
        };

        token.cancelled().await;
        let mut st = lock(&shared.state);
        if st.pending.remove(&id).is_some() && !matches!(st.phase, Phase::Disposed) {
            shared
                .sink
                .send(&Message::Request(Request::EventDispose { id }));
        }
    });

    Subscription::new(event_rx, teardown)
}

async fn response_loop(
    shared: Arc<ClientShared>,
    mut responses: mpsc::UnboundedReceiver<Response>,
) {
    while let Some(response) = responses.recv().await {
        match response {
            Response::Initialize => initialize(&shared),
            Response::PromiseSuccess { id, data } => settle(&shared, id, Ok(data)),
            Response::PromiseError { id, error } => {
                settle(&shared, id, Err(RpcError::Remote(error)));
            }
            Response::PromiseErrorObj { id, data } => {
                settle(&shared, id, Err(RpcError::RemoteValue(data)));
            }
            Response::EventFire { id, data } => fire(&shared, id, data),
        }
    }
    // Transport gone: the connection is destroyed.
    teardown(&shared);
}

fn initialize(shared: &ClientShared) {
    {
        let mut st = lock(&shared.state);
        match &mut st.phase {
            Phase::Uninitialized { buffered } => {
                // Flush under the lock so no concurrent call can slip a
                // frame in front of the backlog.
                let backlog = std::mem::take(buffered);
                st.phase = Phase::Idle;
                for request in backlog {
                    shared.sink.send(&request.message);
                }
            }
            Phase::Idle => debug!("ignoring duplicate initialize marker"),
            Phase::Disposed => return,
        }
    }
    let _ = shared.init_tx.send(true);
}

fn settle(shared: &ClientShared, id: u64, result: Result<Body, RpcError>) {
    let handler = lock(&shared.state).pending.remove(&id);
    match handler {
        Some(Pending::Call(reply)) => {
            let _ = reply.send(result);
        }
        Some(Pending::Event(event_tx)) => {
            // A terminal response must not destroy a subscription id.
            lock(&shared.state)
                .pending
                .insert(id, Pending::Event(event_tx));
            debug!(id, "dropping terminal response aimed at a subscription id");
        }
        // Cancelled locally; the response still arrived.
        None => debug!(id, "dropping response for unknown request id"),
    }
}

fn fire(shared: &ClientShared, id: u64, data: Body) {
    let st = lock(&shared.state);
    match st.pending.get(&id) {
        Some(Pending::Event(event_tx)) => {
            let _ = event_tx.send(data);
        }
        _ => debug!(id, "dropping event for unknown subscription id"),
    }
}

fn teardown(shared: &ClientShared) {
    let drained: Vec<Pending> = {
        let mut st = lock(&shared.state);
        st.phase = Phase::Disposed;
        st.pending.drain().map(|(_, pending)| pending).collect()
    };
    for pending in drained {
        if let Pending::Call(reply) = pending {
            let _ = reply.send(Err(RpcError::Cancelled));
        }
        // Event senders drop here; their subscription streams end.
    }
}
