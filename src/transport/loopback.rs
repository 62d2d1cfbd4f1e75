//! In-memory transport linking two application instances in one process.
//!
//! Used by the demo binary and the session tests. Semantics mirror a real
//! point-to-point transport: discovery only sees an advertising peer, a
//! connection completes when the advertiser accepts, payloads are delivered
//! in order while connected and fail synchronously otherwise.

use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::sync::mpsc;

use super::{
    ConnectedPeer, DiscoveredEndpoint, EventReceiver, EventSender, SendError, Transport,
    TransportEvent,
};
use crate::protocol::now_millis;

fn generate_endpoint_id() -> String {
    let bytes: Vec<u8> = (0..4).map(|_| rand::thread_rng().gen()).collect();
    hex::encode(bytes)
}

struct SideState {
    endpoint_id: String,
    /// Name the side last advertised or connected under
    name: String,
    events: EventSender,
    advertising: bool,
    discovering: bool,
    connected: bool,
    stopped: bool,
}

impl SideState {
    fn emit(&self, event: TransportEvent) {
        // Receiver dropped means that side is gone; nothing to deliver to.
        let _ = self.events.send(event);
    }

    fn as_endpoint(&self) -> DiscoveredEndpoint {
        DiscoveredEndpoint {
            endpoint_id: self.endpoint_id.clone(),
            name: self.name.clone(),
        }
    }

    fn as_peer(&self) -> ConnectedPeer {
        ConnectedPeer {
            endpoint_id: self.endpoint_id.clone(),
            display_name: self.name.clone(),
            connected_at: now_millis(),
        }
    }
}

struct Link {
    sides: [SideState; 2],
}

/// One side of an in-memory pair.
#[derive(Clone)]
pub struct LoopbackTransport {
    link: Arc<Mutex<Link>>,
    side: usize,
}

impl LoopbackTransport {
    /// Build both sides of a link. Each half comes with its event stream.
    pub fn pair() -> ((Self, EventReceiver), (Self, EventReceiver)) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let link = Arc::new(Mutex::new(Link {
            sides: [
                SideState {
                    endpoint_id: generate_endpoint_id(),
                    name: String::new(),
                    events: tx_a,
                    advertising: false,
                    discovering: false,
                    connected: false,
                    stopped: false,
                },
                SideState {
                    endpoint_id: generate_endpoint_id(),
                    name: String::new(),
                    events: tx_b,
                    advertising: false,
                    discovering: false,
                    connected: false,
                    stopped: false,
                },
            ],
        }));
        let a = LoopbackTransport {
            link: link.clone(),
            side: 0,
        };
        let b = LoopbackTransport { link, side: 1 };
        ((a, rx_a), (b, rx_b))
    }

    fn other(&self) -> usize {
        1 - self.side
    }
}

impl Transport for LoopbackTransport {
    fn start_advertising(&self, name: &str) {
        let mut link = self.link.lock().expect("loopback link poisoned");
        let (me, other) = (self.side, self.other());
        link.sides[me].name = name.to_string();
        link.sides[me].advertising = true;
        link.sides[me].stopped = false;
        link.sides[me].emit(TransportEvent::AdvertisingStarted);
        if link.sides[other].discovering {
            let found = link.sides[me].as_endpoint();
            link.sides[other].emit(TransportEvent::EndpointFound(found));
        }
    }

    fn start_discovery(&self) {
        let mut link = self.link.lock().expect("loopback link poisoned");
        let (me, other) = (self.side, self.other());
        link.sides[me].discovering = true;
        link.sides[me].stopped = false;
        link.sides[me].emit(TransportEvent::DiscoveryStarted);
        if link.sides[other].advertising {
            let found = link.sides[other].as_endpoint();
            link.sides[me].emit(TransportEvent::EndpointFound(found));
        }
    }

    fn request_connection(&self, local_name: &str, endpoint_id: &str) {
        let mut link = self.link.lock().expect("loopback link poisoned");
        let (me, other) = (self.side, self.other());
        if link.sides[other].endpoint_id != endpoint_id {
            link.sides[me].emit(TransportEvent::Error {
                message: format!("unknown endpoint {endpoint_id}"),
            });
            return;
        }
        link.sides[me].name = local_name.to_string();
        let requester = link.sides[me].as_endpoint();
        link.sides[other].emit(TransportEvent::ConnectionRequested(requester));
    }

    fn accept_connection(&self, endpoint_id: &str) {
        let mut link = self.link.lock().expect("loopback link poisoned");
        let (me, other) = (self.side, self.other());
        if link.sides[other].endpoint_id != endpoint_id {
            link.sides[me].emit(TransportEvent::Error {
                message: format!("unknown endpoint {endpoint_id}"),
            });
            return;
        }
        link.sides[me].connected = true;
        link.sides[other].connected = true;
        let peer_of_me = link.sides[other].as_peer();
        let peer_of_other = link.sides[me].as_peer();
        link.sides[me].emit(TransportEvent::Connected(peer_of_me));
        link.sides[other].emit(TransportEvent::Connected(peer_of_other));
    }

    fn reject_connection(&self, endpoint_id: &str) {
        let link = self.link.lock().expect("loopback link poisoned");
        let other = self.other();
        if link.sides[other].endpoint_id == endpoint_id {
            link.sides[other].emit(TransportEvent::Error {
                message: "connection rejected".to_string(),
            });
        }
    }

    fn send_payload(&self, endpoint_id: &str, bytes: Vec<u8>) -> Result<(), SendError> {
        let link = self.link.lock().expect("loopback link poisoned");
        let (me, other) = (self.side, self.other());
        if link.sides[me].stopped {
            return Err(SendError::Stopped);
        }
        if !link.sides[me].connected || link.sides[other].endpoint_id != endpoint_id {
            return Err(SendError::NotConnected(endpoint_id.to_string()));
        }
        let from = link.sides[me].endpoint_id.clone();
        link.sides[other].emit(TransportEvent::PayloadReceived {
            endpoint_id: from,
            bytes,
        });
        Ok(())
    }

    fn disconnect(&self, endpoint_id: &str) {
        let mut link = self.link.lock().expect("loopback link poisoned");
        let (me, other) = (self.side, self.other());
        if link.sides[other].endpoint_id != endpoint_id || !link.sides[me].connected {
            return;
        }
        link.sides[me].connected = false;
        link.sides[other].connected = false;
        let my_id = link.sides[me].endpoint_id.clone();
        link.sides[other].emit(TransportEvent::Disconnected { endpoint_id: my_id });
        link.sides[me].emit(TransportEvent::Disconnected {
            endpoint_id: endpoint_id.to_string(),
        });
    }

    fn stop_all(&self) {
        let mut link = self.link.lock().expect("loopback link poisoned");
        let (me, other) = (self.side, self.other());
        link.sides[me].advertising = false;
        link.sides[me].discovering = false;
        link.sides[me].stopped = true;
        if link.sides[me].connected {
            link.sides[me].connected = false;
            link.sides[other].connected = false;
            let my_id = link.sides[me].endpoint_id.clone();
            let other_id = link.sides[other].endpoint_id.clone();
            link.sides[other].emit(TransportEvent::Disconnected { endpoint_id: my_id });
            link.sides[me].emit(TransportEvent::Disconnected {
                endpoint_id: other_id,
            });
        }
    }
}
