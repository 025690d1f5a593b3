//! The transport contract the engines consume.
//!
//! A transport is anything that can carry opaque message frames, reliably
//! and in order: a pipe to a child process, a named socket, a WebSocket.
//! The engine needs exactly two capabilities from it -- send one frame,
//! observe inbound frames in delivery order -- which map onto an unbounded
//! sender/receiver pair.  A concrete bridge (socket accept loop, stdio
//! tunnel) pumps bytes between its medium and these channels.
//!
//! Send failures are swallowed: the transport is assumed self-healing and
//! reports disconnection through its own signal, at which point the
//! engines tear down pending work.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wiremux_protocol::{Message, Request, Response};

pub type FrameSender = mpsc::UnboundedSender<Vec<u8>>;
pub type FrameReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// One endpoint of a reliable, in-order, message-framed transport.
#[derive(Debug)]
pub struct MessageIo {
    /// Send one opaque frame to the remote side.  Best-effort.
    pub tx: FrameSender,
    /// Inbound frames, in delivery order.
    pub rx: FrameReceiver,
}

impl MessageIo {
    /// Two connected in-process endpoints.
    pub fn pair() -> (MessageIo, MessageIo) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MessageIo { tx: a_tx, rx: a_rx },
            MessageIo { tx: b_tx, rx: b_rx },
        )
    }
}

/// Encode-and-send half shared by the engines on one connection.
#[derive(Clone)]
pub(crate) struct FrameSink {
    tx: FrameSender,
}

impl FrameSink {
    pub(crate) fn new(tx: FrameSender) -> Self {
        FrameSink { tx }
    }

    pub(crate) fn send(&self, message: &Message) {
        match message.encode() {
            Ok(frame) => self.send_raw(frame),
            Err(e) => debug!(error = %e, "failed to encode outbound frame"),
        }
    }

    pub(crate) fn send_raw(&self, frame: Vec<u8>) {
        if self.tx.send(frame).is_err() {
            debug!("transport closed, dropping outbound frame");
        }
    }
}

/// Decode inbound frames and fan them out by kind: request frames to the
/// server engine, response frames to the client engine.
///
/// Malformed frames are dropped with a warning and the connection lives
/// on; frames with an unknown type tag are dropped silently.  The loop
/// ends when the transport closes its inbound stream.
pub(crate) fn spawn_route_loop(
    mut rx: FrameReceiver,
    requests: mpsc::UnboundedSender<Request>,
    responses: mpsc::UnboundedSender<Response>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match Message::decode(&frame) {
                Ok(Some(Message::Request(request))) => {
                    let _ = requests.send(request);
                }
                Ok(Some(Message::Response(response))) => {
                    let _ = responses.send(response);
                }
                Ok(None) => debug!("dropping frame with unknown type tag"),
                Err(e) => warn!(error = %e, "dropping malformed frame"),
            }
        }
    })
}
