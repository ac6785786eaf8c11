use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Largest datagram we are prepared to receive. Senders are expected to stay well below
///  the path MTU for game traffic, but the protocol does not forbid big datagrams.
pub const MAX_DATAGRAM_LEN: usize = 65536;

const RECEIVE_QUEUE_LEN: usize = 1024;

/// The sending half of a bound socket, as a trait so connection and manager logic can be
///  tested without real sockets. Sends never block: a send the OS cannot take right now
///  is dropped, and the ARQ layer recovers the loss.
#[cfg_attr(test, automock)]
pub trait SendSocket: Send + Sync + 'static {
    fn send_datagram(&self, datagram: &[u8], to: SocketAddr) -> anyhow::Result<()>;
}

impl SendSocket for Arc<UdpSocket> {
    fn send_datagram(&self, datagram: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        match self.try_send_to(datagram, to) {
            Ok(len) if len == datagram.len() => Ok(()),
            Ok(len) => bail!("partial send to {}: {} of {} bytes", to, len, datagram.len()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                trace!("socket send buffer full, dropping datagram to {}", to);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// One bound UDP socket with its receive loop. The loop runs on its own task and hands
///  datagrams over through a bounded queue; the manager drains that queue synchronously
///  from its pump.
pub struct Peer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    received: mpsc::Receiver<(SocketAddr, Bytes)>,
    receive_task: JoinHandle<()>,
}

impl Peer {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Peer> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        debug!("bound peer socket on {}", local_addr);

        let (sender, received) = mpsc::channel(RECEIVE_QUEUE_LEN);
        let receive_socket = socket.clone();
        let receive_task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_LEN];
            loop {
                match receive_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        trace!("received {} bytes from {}", len, from);
                        let datagram = Bytes::copy_from_slice(&buf[..len]);
                        if sender.send((from, datagram)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // e.g. ICMP port unreachable surfacing on some platforms
                        warn!("receive error on {}: {} - continuing", local_addr, e);
                    }
                }
            }
        });

        Ok(Peer {
            socket,
            local_addr,
            received,
            receive_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A cloneable sending handle for this socket.
    pub fn send_socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Moves up to `max` queued datagrams into `out` without blocking.
    pub fn drain(&mut self, max: usize, out: &mut Vec<(SocketAddr, Bytes)>) {
        for _ in 0..max {
            match self.received.try_recv() {
                Ok(received) => out.push(received),
                Err(_) => break,
            }
        }
    }

    /// Waits for the next datagram. Test and tooling convenience; the manager uses
    ///  [Peer::drain].
    pub async fn recv(&mut self) -> Option<(SocketAddr, Bytes)> {
        self.received.recv().await
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn loopback_peer() -> Peer {
        Peer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_datagram_crosses_between_two_peers() {
        let a = loopback_peer().await;
        let mut b = loopback_peer().await;

        a.send_socket()
            .send_datagram(b"hello", b.local_addr())
            .unwrap();

        let (from, datagram) = b.recv().await.unwrap();
        assert_eq!(from, a.local_addr());
        assert_eq!(datagram, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_drain_is_non_blocking_and_bounded() {
        let a = loopback_peer().await;
        let mut b = loopback_peer().await;

        let mut out = Vec::new();
        b.drain(16, &mut out);
        assert!(out.is_empty());

        for i in 0..3u8 {
            a.send_socket().send_datagram(&[i], b.local_addr()).unwrap();
        }
        // the receive task needs a moment to queue the datagrams
        tokio::time::sleep(Duration::from_millis(50)).await;

        b.drain(2, &mut out);
        assert_eq!(out.len(), 2);
        b.drain(16, &mut out);
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn test_bound_port_is_reported() {
        let peer = loopback_peer().await;
        assert_ne!(peer.local_addr().port(), 0);
    }
}
