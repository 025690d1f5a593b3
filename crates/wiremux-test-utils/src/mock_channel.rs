// mock_channel: A scriptable server channel for engine tests.
//
// Commands:
//   "marco"      -> resolves with text "polo"
//   "echo"       -> resolves with the argument, verbatim
//   "whoami"     -> resolves with the channel's tag (see `named`)
//   "sleep"      -> resolves with text "done" after 50 ms of wall time
//   "fail"       -> rejects with a structured error; the message is the
//                   text argument (or "nice error" when absent)
//   "fail-value" -> rejects with the argument as an arbitrary value
//   "never"      -> never completes; reports observed cancellation
//   anything else -> rejects as not-implemented
//
// Events "pong" and "tick" deliver whatever `fire` is given, to every
// live subscription.  Other events are rejected as not-implemented.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use wiremux::{CallFault, ServerChannel};
use wiremux_protocol::{Body, RemoteError};

pub struct MockChannel {
    tag: String,
    listeners: Mutex<Vec<mpsc::UnboundedSender<Body>>>,
    cancel_seen: mpsc::UnboundedSender<String>,
}

impl MockChannel {
    /// An untagged channel plus a receiver observing server-side
    /// cancellations (one command name per observed cancel).
    pub fn new() -> (Arc<MockChannel>, mpsc::UnboundedReceiver<String>) {
        Self::named("")
    }

    /// A channel whose `whoami` command answers `tag`.
    pub fn named(tag: &str) -> (Arc<MockChannel>, mpsc::UnboundedReceiver<String>) {
        let (cancel_seen, cancel_rx) = mpsc::unbounded_channel();
        (
            Arc::new(MockChannel {
                tag: tag.to_owned(),
                listeners: Mutex::new(Vec::new()),
                cancel_seen,
            }),
            cancel_rx,
        )
    }

    /// Deliver `data` to every live subscription.
    pub fn fire(&self, data: Body) {
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .retain(|tx| tx.send(data.clone()).is_ok());
    }

    /// Number of subscriptions currently wired up server-side.  Lets a
    /// test wait until a listen request has actually landed.
    pub fn listener_count(&self) -> usize {
        let mut listeners = self.listeners.lock().expect("listener list poisoned");
        listeners.retain(|tx| !tx.is_closed());
        listeners.len()
    }
}

impl ServerChannel for MockChannel {
    fn call(
        &self,
        command: &str,
        arg: Body,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, CallFault>> {
        let command = command.to_owned();
        let tag = self.tag.clone();
        let cancel_seen = self.cancel_seen.clone();
        async move {
            match command.as_str() {
                "marco" => Ok(Body::text("polo")),
                "echo" => Ok(arg),
                "whoami" => Ok(Body::text(tag)),
                "sleep" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Body::text("done"))
                }
                "fail" => {
                    let message = match arg {
                        Body::Text(text) => text,
                        _ => "nice error".to_owned(),
                    };
                    Err(CallFault::Error(RemoteError {
                        message,
                        name: "Error".to_owned(),
                        stack: vec!["at fail (mock_channel.rs:1:1)".to_owned()],
                    }))
                }
                "fail-value" => Err(CallFault::Value(arg)),
                "never" => {
                    // The engine drops this future on cancel, so the
                    // observation has to outlive it.
                    let watcher = cancel.clone();
                    tokio::spawn(async move {
                        watcher.cancelled().await;
                        let _ = cancel_seen.send("never".to_owned());
                    });
                    futures_util::future::pending().await
                }
                other => Err(CallFault::Error(RemoteError::not_implemented(format!(
                    "unknown command '{other}'"
                )))),
            }
        }
        .boxed()
    }

    fn listen(&self, event: &str, _arg: Body) -> Result<BoxStream<'static, Body>, RemoteError> {
        match event {
            "pong" | "tick" => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.listeners
                    .lock()
                    .expect("listener list poisoned")
                    .push(tx);
                Ok(UnboundedReceiverStream::new(rx).boxed())
            }
            other => Err(RemoteError::not_implemented(format!(
                "unknown event '{other}'"
            ))),
        }
    }
}
