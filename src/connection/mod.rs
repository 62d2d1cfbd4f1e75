//! Connection lifecycle, peer registry and link quality.
//!
//! One `ConnectionManager` owns the connected-peer set, the pairing state
//! machine and the latency tracker. Transport events arrive on a single
//! stream and are applied by one dispatch loop; everything downstream
//! observes the results through `watch`/`broadcast` channels and never
//! mutates them directly.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::protocol::{self, Message};
use crate::transport::{ConnectedPeer, EventReceiver, Transport, TransportEvent};

/// Buffer for fan-in of decoded inbound messages. Slow subscribers lose the
/// oldest entries rather than stalling the dispatch loop.
const INCOMING_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Advertising,
    Discovering,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Most recent round-trip measurement to any peer. A single process-wide
/// value: the two-device use case has no need for per-peer tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionQuality {
    pub latency_ms: i64,
    pub last_updated: i64,
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            last_updated: protocol::now_millis(),
        }
    }
}

impl ConnectionQuality {
    pub fn level(&self) -> QualityLevel {
        match self.latency_ms {
            ms if ms < 100 => QualityLevel::Excellent,
            ms if ms < 300 => QualityLevel::Good,
            ms if ms < 600 => QualityLevel::Fair,
            _ => QualityLevel::Poor,
        }
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    device_name: String,
    peers_tx: watch::Sender<Vec<ConnectedPeer>>,
    state_tx: watch::Sender<ConnectionState>,
    quality_tx: watch::Sender<ConnectionQuality>,
    incoming_tx: broadcast::Sender<(String, Message)>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, device_name: impl Into<String>) -> Arc<Self> {
        let (peers_tx, _) = watch::channel(Vec::new());
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (quality_tx, _) = watch::channel(ConnectionQuality::default());
        let (incoming_tx, _) = broadcast::channel(INCOMING_BUFFER);
        Arc::new(Self {
            transport,
            device_name: device_name.into(),
            peers_tx,
            state_tx,
            quality_tx,
            incoming_tx,
        })
    }

    /// Consume the transport's event stream until it closes.
    pub fn spawn_event_loop(self: &Arc<Self>, mut events: EventReceiver) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.on_event(event);
            }
            debug!("transport event stream ended");
        })
    }

    pub fn start_as_camera(&self) {
        info!(name = %self.device_name, "starting as camera (advertiser)");
        self.transport.start_advertising(&self.device_name);
    }

    pub fn start_as_remote(&self) {
        info!(name = %self.device_name, "starting as remote (discoverer)");
        self.transport.start_discovery();
    }

    pub fn watch_peers(&self) -> watch::Receiver<Vec<ConnectedPeer>> {
        self.peers_tx.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn watch_quality(&self) -> watch::Receiver<ConnectionQuality> {
        self.quality_tx.subscribe()
    }

    /// Decoded inbound messages, paired with the sending endpoint. Ping/Pong
    /// never appear here; they are consumed by the liveness loop.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, Message)> {
        self.incoming_tx.subscribe()
    }

    /// Ordered snapshot of the connected peers.
    pub fn peers(&self) -> Vec<ConnectedPeer> {
        self.peers_tx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn quality(&self) -> ConnectionQuality {
        *self.quality_tx.borrow()
    }

    pub fn send_to_all(&self, message: &Message) {
        let bytes = match protocol::encode(message) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(kind = message.kind(), %err, "dropping unencodable message");
                return;
            }
        };
        let peers = self.peers();
        if !matches!(
            message,
            Message::PreviewFrame { .. } | Message::Ping { .. } | Message::Pong { .. }
        ) {
            debug!(kind = message.kind(), peers = peers.len(), "broadcasting");
        }
        for peer in &peers {
            // One peer failing must not block delivery to the others.
            if let Err(err) = self.transport.send_payload(&peer.endpoint_id, bytes.clone()) {
                warn!(endpoint = %peer.endpoint_id, %err, "send failed");
            }
        }
    }

    pub fn send_to(&self, endpoint_id: &str, message: &Message) {
        let bytes = match protocol::encode(message) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(kind = message.kind(), %err, "dropping unencodable message");
                return;
            }
        };
        if let Err(err) = self.transport.send_payload(endpoint_id, bytes) {
            warn!(endpoint = %endpoint_id, %err, "send failed");
        }
    }

    pub fn send_ping(&self) {
        self.send_to_all(&Message::ping());
    }

    pub fn disconnect(&self, endpoint_id: &str) {
        debug!(endpoint = %endpoint_id, "disconnecting");
        self.transport.disconnect(endpoint_id);
        self.on_disconnected(endpoint_id);
    }

    pub fn disconnect_all(&self) {
        debug!("disconnecting all endpoints");
        self.transport.stop_all();
        self.peers_tx.send_replace(Vec::new());
        self.state_tx.send_replace(ConnectionState::Idle);
    }

    fn on_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::AdvertisingStarted => {
                info!("state -> ADVERTISING");
                self.state_tx.send_replace(ConnectionState::Advertising);
            }
            TransportEvent::DiscoveryStarted => {
                info!("state -> DISCOVERING");
                self.state_tx.send_replace(ConnectionState::Discovering);
            }
            TransportEvent::EndpointFound(endpoint) => {
                // Two-device pairing: connect to whatever shows up first,
                // no selection step.
                info!(endpoint = %endpoint.endpoint_id, name = %endpoint.name, "endpoint found, auto-connecting");
                self.state_tx.send_replace(ConnectionState::Connecting);
                self.transport
                    .request_connection(&self.device_name, &endpoint.endpoint_id);
            }
            TransportEvent::EndpointLost { endpoint_id } => {
                debug!(endpoint = %endpoint_id, "endpoint lost");
            }
            TransportEvent::ConnectionRequested(endpoint) => {
                // No confirmation gate: every incoming request is accepted.
                info!(endpoint = %endpoint.endpoint_id, name = %endpoint.name, "connection requested, auto-accepting");
                self.state_tx.send_replace(ConnectionState::Connecting);
                self.transport.accept_connection(&endpoint.endpoint_id);
            }
            TransportEvent::Connected(peer) => {
                self.on_connected(peer);
            }
            TransportEvent::Disconnected { endpoint_id } => {
                info!(endpoint = %endpoint_id, "disconnected");
                self.on_disconnected(&endpoint_id);
            }
            TransportEvent::PayloadReceived { endpoint_id, bytes } => {
                self.on_payload(&endpoint_id, &bytes);
            }
            TransportEvent::Error { message } => {
                error!(%message, "transport error, state -> ERROR");
                self.state_tx.send_replace(ConnectionState::Error);
            }
        }
    }

    /// Idempotent: a peer already present by endpoint id is left alone.
    fn on_connected(&self, peer: ConnectedPeer) {
        info!(endpoint = %peer.endpoint_id, name = %peer.display_name, "connected");
        self.peers_tx.send_if_modified(|peers| {
            if peers.iter().any(|p| p.endpoint_id == peer.endpoint_id) {
                return false;
            }
            peers.push(peer);
            true
        });
        let count = self.peers_tx.borrow().len();
        info!(peers = count, "state -> CONNECTED");
        self.state_tx.send_replace(ConnectionState::Connected);
    }

    fn on_disconnected(&self, endpoint_id: &str) {
        self.peers_tx
            .send_if_modified(|peers| match peers.iter().position(|p| p.endpoint_id == endpoint_id) {
                Some(index) => {
                    peers.remove(index);
                    true
                }
                None => false,
            });
        if self.peers_tx.borrow().is_empty() && self.state() == ConnectionState::Connected {
            info!("state -> IDLE (no peers connected)");
            self.state_tx.send_replace(ConnectionState::Idle);
        }
    }

    fn on_payload(&self, endpoint_id: &str, bytes: &[u8]) {
        trace!(endpoint = %endpoint_id, len = bytes.len(), "payload received");
        let Some(message) = protocol::decode(bytes) else {
            warn!(endpoint = %endpoint_id, "failed to decode payload, dropping");
            return;
        };
        match message {
            Message::Ping { timestamp } => {
                trace!(endpoint = %endpoint_id, "ping");
                self.send_to(endpoint_id, &Message::pong(timestamp));
            }
            Message::Pong {
                original_timestamp, ..
            } => {
                self.on_pong(original_timestamp);
            }
            other => {
                // No subscribers yet is fine; the message is simply unobserved.
                let _ = self.incoming_tx.send((endpoint_id.to_string(), other));
            }
        }
    }

    /// Round trip is wall-clock `now - original`; clock skew can make it
    /// negative or implausibly large and no clamping is applied.
    fn on_pong(&self, original_timestamp: i64) {
        let now = protocol::now_millis();
        let latency_ms = now - original_timestamp;
        trace!(latency_ms, "pong");
        self.quality_tx.send_replace(ConnectionQuality {
            latency_ms,
            last_updated: now,
        });
    }
}
