//! Pushbridge core
//!
//! Mirrors Pushbullet SMS threads and pushes into host conversation channels,
//! relays typed text back through the HTTP API, and keeps the realtime event
//! stream connected.

pub mod api;
pub mod bridge;
pub mod dispatcher;
pub mod host;
pub mod payload;
pub mod registry;
pub mod relay;
pub mod session;
pub mod stream;
pub mod sync;

mod error;

pub use api::{ApiClient, HttpMethod, PushbulletApi, RequestDescriptor, ThreadSummary};
pub use bridge::{Bridge, BridgeConfig};
pub use dispatcher::{
    Completion, DispatchStatus, Dispatcher, NetDispatcher, Operation, OperationKind,
    PendingRequest,
};
pub use error::{ProtocolError, Result};
pub use host::{BridgeCommand, ChannelHandle, Host, HostEvent};
pub use payload::{Direction, Message};
pub use registry::{ConversationChannel, ConversationRegistry, AGGREGATE_KEY};
pub use relay::OutboundRelay;
pub use session::Session;
pub use stream::{ReconnectionStrategy, StreamMonitor, StreamPhase, StreamState};
pub use sync::SyncCoordinator;

#[cfg(test)]
pub mod test_utils;
