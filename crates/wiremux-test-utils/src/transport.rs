// In-memory transports for exercising the engines without a real socket.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use wiremux::MessageIo;
use wiremux_protocol::Message;

/// Two connected in-memory endpoints.
pub fn transport_pair() -> (MessageIo, MessageIo) {
    MessageIo::pair()
}

/// Frames recorded off one direction of a transport, in send order.
#[derive(Clone, Default)]
pub struct FrameLog {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FrameLog {
    fn push(&self, frame: Vec<u8>) {
        self.frames.lock().expect("frame log poisoned").push(frame);
    }

    /// Every recorded frame, raw.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().expect("frame log poisoned").clone()
    }

    /// Every recorded frame that decodes as a protocol message.  Frames
    /// with unknown tags (and the raw identity message a peer sends
    /// first) are skipped.
    pub fn messages(&self) -> Vec<Message> {
        self.frames()
            .iter()
            .filter_map(|frame| Message::decode(frame).ok().flatten())
            .collect()
    }
}

/// A connected pair where every frame travelling `left -> right` is
/// recorded.  Must be called from within a tokio runtime.
pub fn recording_pair() -> (MessageIo, MessageIo, FrameLog) {
    let log = FrameLog::default();

    // left.tx -> relay (records) -> right.rx; right.tx -> left.rx direct.
    let (left_tx, mut relay_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (relay_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();

    let relay_log = log.clone();
    tokio::spawn(async move {
        while let Some(frame) = relay_rx.recv().await {
            relay_log.push(frame.clone());
            if relay_tx.send(frame).is_err() {
                break;
            }
        }
    });

    (
        MessageIo {
            tx: left_tx,
            rx: left_rx,
        },
        MessageIo {
            tx: right_tx,
            rx: right_rx,
        },
        log,
    )
}
