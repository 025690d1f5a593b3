//! Channel adapters for channels that are not usable quite yet.
//!
//! A [`DelayedChannel`] fronts a channel that is still being resolved (a
//! peer that has not connected, an engine still being built): calls wait
//! for the resolution, listens relay through a subscription handed out
//! immediately.  A [`NextTickChannel`] defers the first operation by one
//! scheduler tick to break synchronous re-entrancy when the underlying
//! channel was built inside a reactive callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wiremux_protocol::Body;

use crate::channel::{RemoteChannel, Subscription};
use crate::error::RpcError;

/// A channel facade over a future that will yield the real channel.
#[derive(Clone)]
pub struct DelayedChannel<C: RemoteChannel + Clone> {
    inner: Shared<BoxFuture<'static, Result<C, RpcError>>>,
}

impl<C: RemoteChannel + Clone> DelayedChannel<C> {
    pub fn new(resolve: impl Future<Output = Result<C, RpcError>> + Send + 'static) -> Self {
        DelayedChannel {
            inner: resolve.boxed().shared(),
        }
    }
}

impl<C: RemoteChannel + Clone> RemoteChannel for DelayedChannel<C> {
    fn call(
        &self,
        command: &str,
        arg: Body,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, RpcError>> {
        let inner = self.inner.clone();
        let command = command.to_owned();
        async move {
            // The caller's token covers the wait as well as the call.
            let channel = tokio::select! {
                resolved = inner => resolved?,
                _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            };
            channel.call(&command, arg, cancel).await
        }
        .boxed()
    }

    fn listen(&self, event: &str, arg: Body) -> Subscription {
        let inner = self.inner.clone();
        let event = event.to_owned();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let teardown = CancellationToken::new();
        let token = teardown.clone();

        tokio::spawn(async move {
            let channel = tokio::select! {
                _ = token.cancelled() => return,
                resolved = inner => match resolved {
                    Ok(channel) => channel,
                    Err(e) => {
                        debug!(error = %e, "delayed channel never resolved");
                        return;
                    }
                }
            };
            let mut subscription = channel.listen(&event, arg);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = subscription.recv() => match item {
                        Some(data) => {
                            if relay_tx.send(data).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            // The inner subscription drops here, carrying the dispose
            // through to the wire.
        });

        Subscription::new(relay_rx, teardown)
    }
}

/// Defers the first call or listen by one scheduler tick; subsequent
/// operations go straight through.
pub struct NextTickChannel<C: RemoteChannel> {
    inner: Arc<C>,
    did_tick: Arc<AtomicBool>,
}

impl<C: RemoteChannel> NextTickChannel<C> {
    pub fn new(inner: C) -> Self {
        NextTickChannel {
            inner: Arc::new(inner),
            did_tick: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<C: RemoteChannel> Clone for NextTickChannel<C> {
    fn clone(&self) -> Self {
        NextTickChannel {
            inner: Arc::clone(&self.inner),
            did_tick: Arc::clone(&self.did_tick),
        }
    }
}

impl<C: RemoteChannel> RemoteChannel for NextTickChannel<C> {
    fn call(
        &self,
        command: &str,
        arg: Body,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, RpcError>> {
        let inner = Arc::clone(&self.inner);
        let did_tick = Arc::clone(&self.did_tick);
        let command = command.to_owned();
        async move {
            if !did_tick.swap(true, Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
            inner.call(&command, arg, cancel).await
        }
        .boxed()
    }

    fn listen(&self, event: &str, arg: Body) -> Subscription {
        if self.did_tick.swap(true, Ordering::SeqCst) {
            return self.inner.listen(event, arg);
        }

        // First operation: relay one tick behind.
        let inner = Arc::clone(&self.inner);
        let event = event.to_owned();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let teardown = CancellationToken::new();
        let token = teardown.clone();

        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if token.is_cancelled() {
                return;
            }
            let mut subscription = inner.listen(&event, arg);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = subscription.recv() => match item {
                        Some(data) => {
                            if relay_tx.send(data).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        Subscription::new(relay_rx, teardown)
    }
}
