//! Channel capabilities on both sides of the wire.
//!
//! A channel is a named collection of commands (each returning one eventual
//! value) and events (each a stream).  [`ServerChannel`] is what a host
//! registers and exposes; [`RemoteChannel`] is the client-side view of a
//! channel living on the other peer, and is also implemented by the
//! delayed/next-tick adapters and the routed facade so callers never care
//! which one they hold.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremux_protocol::{Body, RemoteError};

use crate::error::RpcError;

/// A channel exposed by this side to the remote peer.
///
/// `cancel` fires when the remote caller cancels the in-flight command;
/// handlers observe it cooperatively.  Whether or not a handler honors the
/// token, the engine guarantees no terminal response is emitted for a
/// cancelled call.
pub trait ServerChannel: Send + Sync + 'static {
    fn call(
        &self,
        command: &str,
        arg: Body,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, CallFault>>;

    /// Open the event stream for `event`.  Unknown events are rejected;
    /// the engine logs the rejection and registers nothing.
    fn listen(&self, event: &str, arg: Body) -> Result<BoxStream<'static, Body>, RemoteError>;
}

/// A rejection raised by a channel command.
#[derive(Debug, Clone)]
pub enum CallFault {
    /// A structured error; travels as `PromiseError`.
    Error(RemoteError),
    /// An arbitrary rejection value; travels as `PromiseErrorObj`.
    Value(Body),
}

impl From<RemoteError> for CallFault {
    fn from(e: RemoteError) -> Self {
        CallFault::Error(e)
    }
}

/// The client-side view of a channel on the remote peer.
pub trait RemoteChannel: Send + Sync + 'static {
    /// Invoke a command.  Cancelling the token settles the call as
    /// [`RpcError::Cancelled`] and, if the request already went out,
    /// sends a cancel frame so the remote side can stop working.
    fn call(
        &self,
        command: &str,
        arg: Body,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, RpcError>>;

    /// Subscribe to an event.  The subscription drives the wire traffic:
    /// it is announced to the peer once the connection is initialized and
    /// withdrawn when dropped.
    fn listen(&self, event: &str, arg: Body) -> Subscription;
}

impl<T: RemoteChannel + ?Sized> RemoteChannel for std::sync::Arc<T> {
    fn call(
        &self,
        command: &str,
        arg: Body,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, RpcError>> {
        (**self).call(command, arg, cancel)
    }

    fn listen(&self, event: &str, arg: Body) -> Subscription {
        (**self).listen(event, arg)
    }
}

/// An active event subscription.
///
/// Yields each delivery in arrival order.  Dropping (or explicitly
/// disposing) the subscription tears it down: a listen that was already
/// announced sends exactly one dispose frame, one still waiting for
/// initialization is withdrawn without ever touching the wire.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Body>,
    teardown: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Body>, teardown: CancellationToken) -> Self {
        Subscription { rx, teardown }
    }

    /// The next event delivery; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Body> {
        self.rx.recv().await
    }

    /// Tear the subscription down now instead of at drop time.
    pub fn dispose(self) {}
}

impl Stream for Subscription {
    type Item = Body;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Body>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.teardown.cancel();
    }
}
