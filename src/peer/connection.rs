//! Socket-owning peer connection
//!
//! Drives one TCP stream through `Connecting → Handshaking →
//! Operational → Closed`. Choke and unchoke messages are only ever
//! queued by the choking engine; the connection itself never decides
//! them.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::peer::state::{ConnectionState, DisconnectReason};
use crate::protocol::{EncryptionPolicy, Handshake, Message, Wire};

/// Outbound TCP connect budget
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote capabilities learned during the handshake
#[derive(Debug, Clone, Copy)]
pub struct RemoteCaps {
    pub peer_id: [u8; 20],
    pub encryption: bool,
    pub extensions: bool,
    pub dht: bool,
}

/// One live peer socket
#[derive(Debug)]
pub struct PeerConnection {
    stream: TcpStream,
    wire: Wire,
    /// Remote address
    pub addr: SocketAddr,
    /// Connection lifecycle
    pub state: ConnectionState,
    /// Set once the handshake completes
    pub remote: Option<RemoteCaps>,
}

impl PeerConnection {
    /// Dial a peer and complete the handshake
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        policy: EncryptionPolicy,
    ) -> Result<Self> {
        debug!(peer = %addr, "dialing peer");
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                warn!(peer = %addr, "connect timed out");
                EngineError::network_with_addr("Connect timed out", addr.to_string())
            })?
            .map_err(|e| {
                EngineError::network_full("Connect failed", addr.to_string(), e.to_string())
            })?;

        let mut conn = Self {
            stream,
            wire: Wire,
            addr,
            state: ConnectionState::Connecting,
            remote: None,
        };
        conn.handshake_initiate(info_hash, our_peer_id, policy).await?;
        Ok(conn)
    }

    /// Adopt an accepted socket for a known torrent
    pub async fn accept(
        stream: TcpStream,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        policy: EncryptionPolicy,
    ) -> Result<Self> {
        let (_, conn) = Self::accept_matched(stream, our_peer_id, policy, move |hash| {
            (*hash == info_hash).then_some(0)
        })
        .await?;
        Ok(conn)
    }

    /// Adopt an accepted socket, resolving the torrent from the
    /// remote handshake
    ///
    /// The acceptor reads first: `resolve` maps the claimed info hash
    /// to a torrent id, or `None` to reject the peer. Our reply echoes
    /// the matched hash.
    pub async fn accept_matched<F>(
        stream: TcpStream,
        our_peer_id: [u8; 20],
        policy: EncryptionPolicy,
        resolve: F,
    ) -> Result<(u64, Self)>
    where
        F: FnOnce(&[u8; 20]) -> Option<u64>,
    {
        let addr = stream.peer_addr().map_err(|e| {
            EngineError::network_with_addr(format!("no peer address: {}", e), "unknown")
        })?;
        let mut conn = Self {
            stream,
            wire: Wire,
            addr,
            state: ConnectionState::Handshaking,
            remote: None,
        };

        let theirs = conn.wire.read_handshake(&mut conn.stream).await?;
        let Some(torrent) = resolve(&theirs.info_hash) else {
            conn.state = ConnectionState::Closed;
            return Err(conn.rejected(DisconnectReason::InfoHashMismatch));
        };
        if !policy.permits(theirs.supports_encryption()) {
            conn.state = ConnectionState::Closed;
            return Err(conn.rejected(DisconnectReason::EncryptionRequired));
        }
        let ours = Handshake::new(theirs.info_hash, our_peer_id, policy);
        conn.wire.write_handshake(&mut conn.stream, &ours).await?;

        conn.complete(&theirs);
        Ok((torrent, conn))
    }

    /// Initiator side: write our handshake, then check the reply
    async fn handshake_initiate(
        &mut self,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        policy: EncryptionPolicy,
    ) -> Result<()> {
        self.state = ConnectionState::Handshaking;
        let ours = Handshake::new(info_hash, our_peer_id, policy);
        self.wire.write_handshake(&mut self.stream, &ours).await?;
        let theirs = self.wire.read_handshake(&mut self.stream).await?;

        if !theirs.matches_torrent(&info_hash) {
            self.state = ConnectionState::Closed;
            return Err(self.rejected(DisconnectReason::InfoHashMismatch));
        }
        if !policy.permits(theirs.supports_encryption()) {
            self.state = ConnectionState::Closed;
            return Err(self.rejected(DisconnectReason::EncryptionRequired));
        }
        self.complete(&theirs);
        Ok(())
    }

    fn rejected(&self, reason: DisconnectReason) -> anyhow::Error {
        EngineError::peer_full("Handshake rejected", self.addr.to_string(), reason.as_str())
            .into()
    }

    fn complete(&mut self, theirs: &Handshake) {
        self.remote = Some(RemoteCaps {
            peer_id: theirs.peer_id,
            encryption: theirs.supports_encryption(),
            extensions: theirs.supports_extensions(),
            dht: theirs.supports_dht(),
        });
        self.state = ConnectionState::Operational;
        info!(peer = %self.addr, "handshake complete");
    }

    /// Send one message
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        if self.state != ConnectionState::Operational {
            return Err(EngineError::peer_with_addr(
                "send on non-operational connection",
                self.addr.to_string(),
            )
            .into());
        }
        self.wire.write_message(&mut self.stream, message).await
    }

    /// Receive one message, bounded by `read_timeout`
    pub async fn receive(&mut self, read_timeout: Duration) -> Result<Message> {
        if self.state != ConnectionState::Operational {
            return Err(EngineError::peer_with_addr(
                "receive on non-operational connection",
                self.addr.to_string(),
            )
            .into());
        }
        timeout(read_timeout, self.wire.read_message(&mut self.stream))
            .await
            .map_err(|_| EngineError::network_with_addr("Receive timed out", self.addr.to_string()))?
    }

    /// Remote peer id, once handshaked
    pub fn peer_id(&self) -> Option<[u8; 20]> {
        self.remote.map(|r| r.peer_id)
    }

    /// Close the socket with a categorized reason
    pub async fn close(mut self, reason: DisconnectReason) {
        info!(peer = %self.addr, reason = reason.as_str(), "closing connection");
        self.state = ConnectionState::Closed;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut self.stream).await;
    }

    /// Split an operational connection into independent halves so the
    /// receive and send pumps can run as separate tasks
    pub fn into_split(self) -> (PeerReader, PeerWriter) {
        let (read, write) = self.stream.into_split();
        (
            PeerReader {
                read,
                wire: Wire,
                addr: self.addr,
            },
            PeerWriter {
                write,
                wire: Wire,
                addr: self.addr,
            },
        )
    }
}

/// Receiving half of a split connection
pub struct PeerReader {
    read: tokio::net::tcp::OwnedReadHalf,
    wire: Wire,
    pub addr: SocketAddr,
}

impl PeerReader {
    /// Read the next message; errors indicate a dead or hostile peer
    pub async fn receive(&mut self) -> Result<Message> {
        self.wire.read_message(&mut self.read).await
    }
}

/// Sending half of a split connection
pub struct PeerWriter {
    write: tokio::net::tcp::OwnedWriteHalf,
    wire: Wire,
    pub addr: SocketAddr,
}

impl PeerWriter {
    /// Write one message
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        self.wire.write_message(&mut self.write, message).await
    }

    /// Shut down the write direction
    pub async fn shutdown(&mut self) {
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut self.write).await;
    }
}
