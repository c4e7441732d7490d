use crate::error::{MessageError, NetworkError};
use crate::network::messages::{Datagram, MAX_DATAGRAM_SIZE};
use log::{trace, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Unacknowledged datagram transport. Every message is one UDP packet sent
/// from the node's listening socket; reliability, where it exists, comes from
/// request/response pairs and timeouts in the protocol above.
#[derive(Clone, Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

/// What came off the socket: a command, or bytes that did not decode
pub enum Inbound {
    Datagram(Datagram),
    Malformed { from: SocketAddr, error: MessageError },
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetworkError> {
        let socket = UdpSocket::bind(addr).await.map_err(|source| NetworkError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::InvalidAddress(e.to_string()))?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send(&self, to: SocketAddr, datagram: &Datagram) -> Result<(), NetworkError> {
        let bytes = datagram.to_bytes().map_err(|e| NetworkError::SendFailed {
            addr: to.to_string(),
            reason: e.to_string(),
        })?;
        trace!("-> {} {}", to, String::from_utf8_lossy(&bytes));
        self.socket
            .send_to(&bytes, to)
            .await
            .map_err(|e| NetworkError::SendFailed {
                addr: to.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Fire and forget: failures are logged and the datagram is dropped
    pub async fn send_or_log(&self, to: SocketAddr, datagram: &Datagram) {
        if let Err(e) = self.send(to, datagram).await {
            warn!("Dropping {} for {}: {}", datagram.command.tag(), to, e);
        }
    }

    /// Waits for the next datagram. Cancel safe, so it can sit in a `select!`.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<Inbound, NetworkError> {
        let (len, from) = self
            .socket
            .recv_from(buf)
            .await
            .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
        let bytes = &buf[..len];
        trace!("<- {} {}", from, String::from_utf8_lossy(bytes));

        Ok(match Datagram::from_bytes(bytes) {
            Ok(datagram) => Inbound::Datagram(datagram),
            Err(error) => {
                let preview = &bytes[..len.min(16)];
                warn!(
                    "Undecodable datagram from {} ({} bytes, starts {}): {}",
                    from,
                    len,
                    hex::encode(preview),
                    error
                );
                Inbound::Malformed { from, error }
            }
        })
    }
}

pub fn receive_buffer() -> Vec<u8> {
    vec![0u8; MAX_DATAGRAM_SIZE]
}
