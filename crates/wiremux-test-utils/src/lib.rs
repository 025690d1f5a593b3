// wiremux-test-utils: Shared test harness for the multiplexer suite.
//
// Provides in-memory transports (plain and frame-recording) and a
// scriptable mock channel for exercising the client/server engines,
// peers, and the multi-client server.

pub mod mock_channel;
pub mod transport;

pub use mock_channel::MockChannel;
pub use transport::{FrameLog, recording_pair, transport_pair};
