use std::net::SocketAddr;
use std::sync::Arc;

use log::debug;
use tokio::net::UdpSocket;

/// Largest datagram the receive loops will accept.
pub(crate) const MAX_DATAGRAM_SIZE: usize = 65535;

/// The UDP endpoint a connection sends through. Fire-and-forget: a datagram
/// that cannot be placed on the socket right now is dropped and left to the
/// retransmission layer.
pub(crate) trait Transport: Send + Sync + 'static {
    fn send(&self, data: &[u8]);
    fn local_addr(&self) -> SocketAddr;
    fn peer_addr(&self) -> SocketAddr;
}

/// A (possibly shared) UDP socket pinned to one remote address. Clients own
/// their socket; server-side connections share the listening socket.
pub(crate) struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl UdpTransport {
    pub(crate) fn new(socket: Arc<UdpSocket>, local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            socket,
            local_addr,
            peer_addr,
        }
    }
}

impl Transport for UdpTransport {
    fn send(&self, data: &[u8]) {
        if let Err(err) = self.socket.try_send_to(data, self.peer_addr) {
            debug!(
                "dropped a {} byte datagram to {}: {err}",
                data.len(),
                self.peer_addr
            );
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}
