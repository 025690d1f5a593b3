//! Engine-level error taxonomy.
//!
//! Wire-level failures (`FrameError`) live in `wiremux-protocol` and never
//! reach callers: malformed inbound frames are dropped and logged, and
//! outbound send failures are swallowed (the transport signals disconnect
//! separately).  Everything here surfaces on a specific pending call or
//! subscription.

use thiserror::Error;
use wiremux_protocol::{Body, RemoteError};

/// Failure of a remote call as seen by the local caller.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The remote command rejected with a structured error; `message`,
    /// `name`, and `stack` survive the wire intact.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The remote command rejected with an arbitrary value, delivered
    /// verbatim.
    #[error("remote command rejected with a value")]
    RemoteValue(Body),

    /// The caller cancelled, the connection went away before completion,
    /// or the subscription was torn down.
    #[error("operation was cancelled")]
    Cancelled,

    /// The call was made after the local engine was disposed.
    #[error("engine has been disposed")]
    Disposed,
}

impl RpcError {
    /// The structured remote error, if that is what this is.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            RpcError::Remote(e) => Some(e),
            _ => None,
        }
    }
}
