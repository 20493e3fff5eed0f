use crate::tftp;
use async_io::Async;
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::timeout;

/// How many random local ports to try before giving up on binding.
const BIND_ATTEMPTS: usize = 16;

/// Largest datagram a TFTP peer can send: the biggest block plus header.
const MAX_DATAGRAM: usize = tftp::HEADER_SIZE + u16::MAX as usize;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from a datagram transport
#[derive(Debug)]
pub enum TransportError {
    IO(io::Error),
    Timeout(Duration),
}

impl error::Error for TransportError {}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            TransportError::Timeout(d) => write!(f, "No datagram received within {:?}", d),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::IO(e)
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// The datagram service a read session runs over.
///
/// A transport talks to exactly one peer and is owned by one session at a time.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Sends one datagram, returning the number of bytes sent.
    async fn send(&mut self, buf: &[u8]) -> TransportResult<usize>;

    /// Waits for the next datagram and returns it whole, whatever its length.
    /// With `ttl` of None the wait is unbounded.
    async fn recv(&mut self, ttl: Option<Duration>) -> TransportResult<Vec<u8>>;
}

///////////////////////////////////////////////////////////////
/// UDP transport following the RFC 1350 transfer identifier rules: requests go to the server's
/// well-known port, and the source of the first reply becomes the peer for the rest of the
/// session.
pub struct TftpSocket {
    sock: Async<UdpSocket>,

    /// Where datagrams are sent.
    peer: SocketAddr,

    /// Whether `peer` is the server's transfer identifier rather than its well-known port.
    peer_latched: bool,
}

/// Attempts to bind to a random UDP port until one succeeds.
fn bind_random_socket(server: SocketAddr) -> TransportResult<Async<UdpSocket>> {
    let unspecified = match server {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };

    let mut rng = rand::thread_rng();
    let mut last_err = None;
    for _ in 0..BIND_ATTEMPTS {
        let local = SocketAddr::new(unspecified, rng.gen_range(1024..65535));
        match Async::<UdpSocket>::bind(local) {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::warn!("Couldn't bind socket to {}: {}", local, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no local port available"))
        .into())
}

impl TftpSocket {
    pub fn connect(server: SocketAddr) -> TransportResult<TftpSocket> {
        let sock = bind_random_socket(server)?;
        log::info!("Bound local transfer port {}", sock.get_ref().local_addr()?);
        Ok(TftpSocket { sock, peer: server, peer_latched: false })
    }

    async fn reject_stranger(&self, src: SocketAddr) {
        log::warn!("Ignoring datagram from unknown transfer ID {} (expected {})", src, self.peer);
        let packet = tftp::Packet::Error {
            code: tftp::ErrorCode::UnknownTid,
            message: "Unknown transfer ID".to_string(),
        };
        if let Err(e) = self.sock.send_to(&packet.to_bytes(), src).await {
            log::debug!("Unable to send unknown transfer ID error to {}: {}", src, e);
        }
    }

    async fn recv_from_peer(&mut self) -> TransportResult<Vec<u8>> {
        let mut buf = vec![0; MAX_DATAGRAM];
        loop {
            let (total_written, src) = self.sock.recv_from(&mut buf).await?;
            if !self.peer_latched {
                if src.ip() != self.peer.ip() {
                    self.reject_stranger(src).await;
                    continue;
                }
                self.peer = src;
                self.peer_latched = true;
            } else if src != self.peer {
                self.reject_stranger(src).await;
                continue;
            }
            buf.truncate(total_written);
            return Ok(buf);
        }
    }
}

impl Transport for TftpSocket {
    async fn send(&mut self, buf: &[u8]) -> TransportResult<usize> {
        Ok(self.sock.send_to(buf, self.peer).await?)
    }

    async fn recv(&mut self, ttl: Option<Duration>) -> TransportResult<Vec<u8>> {
        match ttl {
            Some(ttl) => timeout(ttl, self.recv_from_peer())
                .await
                .map_err(|_| TransportError::Timeout(ttl))?,
            None => self.recv_from_peer().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_server() -> UdpSocket {
        UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap()
    }

    #[tokio::test]
    async fn test_latches_onto_reply_port() {
        let well_known = loopback_server();
        let transfer = loopback_server();
        let mut sock = TftpSocket::connect(well_known.local_addr().unwrap()).unwrap();

        sock.send(b"request").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, client) = well_known.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"request");

        transfer.send_to(b"reply", client).unwrap();
        assert_eq!(sock.recv(Some(Duration::from_secs(5))).await.unwrap(), b"reply".to_vec());

        // Further sends go to the port that replied.
        sock.send(b"ack").await.unwrap();
        let (n, _) = transfer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ack");
    }

    #[tokio::test]
    async fn test_stranger_gets_unknown_tid_error() {
        let server = loopback_server();
        let transfer = loopback_server();
        let stranger = loopback_server();
        let mut sock = TftpSocket::connect(server.local_addr().unwrap()).unwrap();

        sock.send(b"request").await.unwrap();
        let mut buf = [0u8; 64];
        let (_, client) = server.recv_from(&mut buf).unwrap();

        transfer.send_to(b"first", client).unwrap();
        assert_eq!(sock.recv(Some(Duration::from_secs(5))).await.unwrap(), b"first".to_vec());

        stranger.send_to(b"intruder", client).unwrap();
        transfer.send_to(b"second", client).unwrap();
        assert_eq!(sock.recv(Some(Duration::from_secs(5))).await.unwrap(), b"second".to_vec());

        let (n, _) = stranger.recv_from(&mut buf).unwrap();
        assert_eq!(
            tftp::Packet::parse_from_buf(&buf[..n]).unwrap(),
            tftp::Packet::Error {
                code: tftp::ErrorCode::UnknownTid,
                message: "Unknown transfer ID".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let server = loopback_server();
        let mut sock = TftpSocket::connect(server.local_addr().unwrap()).unwrap();
        let res = sock.recv(Some(Duration::from_millis(50))).await;
        assert!(matches!(res, Err(TransportError::Timeout(d)) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_returns_large_datagrams_whole() {
        let server = loopback_server();
        let mut sock = TftpSocket::connect(server.local_addr().unwrap()).unwrap();
        sock.send(b"hi").await.unwrap();
        let mut buf = [0u8; 4];
        let (_, client) = server.recv_from(&mut buf).unwrap();

        let big = vec![0x5A; 9000];
        server.send_to(&big, client).unwrap();
        assert_eq!(sock.recv(Some(Duration::from_secs(5))).await.unwrap(), big);
    }
}
