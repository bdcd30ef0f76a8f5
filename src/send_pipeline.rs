use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

#[cfg(test)] use mockall::automock;

/// The seam between channel logic and the actual socket, so the former is testable without
///  real network I/O.
///
/// Sending is fire-and-forget by contract: datagrams are unreliable anyway, so a packet that
///  cannot be sent right now is treated exactly like a packet lost in transit - the reliable
///  machinery above recovers either way.
#[cfg_attr(test, automock)]
pub trait SendSocket: Send + Sync + 'static {
    fn do_send_packet(&self, to: SocketAddr, packet: &[u8]);
}

impl SendSocket for UdpSocket {
    fn do_send_packet(&self, to: SocketAddr, packet: &[u8]) {
        match self.try_send_to(packet, to) {
            Ok(n) if n == packet.len() => {}
            Ok(n) => error!("short send to {}: {} of {} bytes", to, n, packet.len()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // full send buffer - drop, like the network would
                debug!("send buffer full, dropping packet to {}", to);
            }
            Err(e) => error!("error sending packet to {}: {}", to, e),
        }
    }
}

/// Shared send-side handle: every outgoing packet of an interface funnels through this.
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    local_addr: SocketAddr,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, local_addr: SocketAddr) -> SendPipeline {
        SendPipeline { socket, local_addr }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn send_packet(&self, to: SocketAddr, packet: &[u8]) {
        trace!("sending packet {} -> {}: {} bytes", self.local_addr, to, packet.len());
        self.socket.do_send_packet(to, packet);
    }
}
