//! Abstract peer transport.
//!
//! The discovery/advertising/connection machinery is an external
//! collaborator: something that finds a named endpoint, negotiates a
//! connection, and delivers opaque byte payloads to it. Delivery is
//! best-effort per call, with order preserved within one endpoint's
//! connection episode. Everything a transport does comes back on a single
//! event stream, consumed by one dispatch loop per connection manager.

pub mod loopback;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("endpoint {0} is not connected")]
    NotConnected(String),
    #[error("transport is stopped")]
    Stopped,
}

/// An endpoint seen during discovery, not yet connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    pub endpoint_id: String,
    pub name: String,
}

/// A live peer. Created by the transport on a successful connection result;
/// the id is unique for the session but not stable across reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPeer {
    pub endpoint_id: String,
    pub display_name: String,
    /// Unix millis at connection time
    pub connected_at: i64,
}

/// Everything the transport can tell us, in per-source order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    AdvertisingStarted,
    DiscoveryStarted,
    EndpointFound(DiscoveredEndpoint),
    EndpointLost { endpoint_id: String },
    ConnectionRequested(DiscoveredEndpoint),
    Connected(ConnectedPeer),
    Disconnected { endpoint_id: String },
    PayloadReceived { endpoint_id: String, bytes: Vec<u8> },
    Error { message: String },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Narrow interface to the connection machinery. Failures of the async
/// operations (advertising, discovery, connection attempts) surface as
/// [`TransportEvent::Error`] on the event stream; only payload sends report
/// failure synchronously, per call.
pub trait Transport: Send + Sync {
    fn start_advertising(&self, name: &str);
    fn start_discovery(&self);
    fn request_connection(&self, local_name: &str, endpoint_id: &str);
    fn accept_connection(&self, endpoint_id: &str);
    fn reject_connection(&self, endpoint_id: &str);
    fn send_payload(&self, endpoint_id: &str, bytes: Vec<u8>) -> Result<(), SendError>;
    fn disconnect(&self, endpoint_id: &str);
    fn stop_all(&self);
}
