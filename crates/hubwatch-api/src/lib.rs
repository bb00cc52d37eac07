// hubwatch-api: Async client for a smart-home hub's real-time WebSocket API

pub mod error;
pub mod protocol;
pub mod reconnect;
pub mod websocket;

pub use error::Error;
pub use protocol::{
    Command, HubEvent, STATE_CHANGED, ServerFrame, ServiceCall, ServiceTarget, StateChange,
};
pub use reconnect::{ReconnectConfig, calculate_backoff};
pub use websocket::{
    ClientConfig, CommandAck, Credentials, EventSink, EventStreamClient, Handshake, HubInfo,
};
