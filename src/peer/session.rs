//! Per-peer session task.
//!
//! A session owns one TCP connection: it performs the handshake, frames
//! incoming messages, tracks the choke/interest state machine, and turns
//! wire traffic into [`PeerEvent`]s for the download coordinator. The
//! coordinator talks back through the [`PeerHandle`] command channel; the
//! session holds no reference to the coordinator, so ownership stays a
//! tree.
use super::{Handshake, Message, PeerError, PeerResult};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

/// Block size requested from peers; fixed by the wire protocol.
pub use super::message::BLOCK_LEN;

/// Idle time after which a keep-alive frame is sent.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);
/// Connect plus handshake window when no other timeout is imposed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Observable session events, delivered to the coordinator's mailbox.
///
/// `Disconnected` is emitted exactly once per session, always last.
#[derive(Debug)]
pub enum PeerEvent {
    Ready {
        addr: SocketAddr,
        peer_id: [u8; 20],
    },
    Bitfield {
        addr: SocketAddr,
        payload: Vec<u8>,
    },
    Have {
        addr: SocketAddr,
        index: u32,
    },
    Choke {
        addr: SocketAddr,
    },
    Unchoke {
        addr: SocketAddr,
    },
    Block {
        addr: SocketAddr,
        index: u32,
        begin: u32,
        data: Vec<u8>,
    },
    Error {
        addr: SocketAddr,
        error: PeerError,
    },
    Disconnected {
        addr: SocketAddr,
    },
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Download { index: u32, size: u32 },
    Disconnect,
}

/// The coordinator's handle to one session.
#[derive(Debug)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    commands: mpsc::Sender<SessionCommand>,
}

impl PeerHandle {
    /// Asks the session to request every block of a piece.
    ///
    /// Returns false when the session is gone or its queue is full; the
    /// caller should not consider the piece assigned in that case.
    pub fn download(&self, index: u32, size: u32) -> bool {
        self.commands
            .try_send(SessionCommand::Download { index, size })
            .is_ok()
    }

    /// Asks the session to close its socket. The session answers with its
    /// final `Disconnected` event.
    pub fn disconnect(&self) {
        let _ = self.commands.try_send(SessionCommand::Disconnect);
    }

    #[cfg(test)]
    pub(crate) fn stub(addr: SocketAddr) -> (Self, mpsc::Receiver<SessionCommand>) {
        let (commands, rx) = mpsc::channel(32);
        (PeerHandle { addr, commands }, rx)
    }
}

/// Choke/interest state of one connection, plus the remote id learned at
/// handshake. Initial state per BEP 3: both sides choked, neither
/// interested.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub am_choked: bool,
    pub am_interested: bool,
    pub peer_choked: bool,
    pub peer_interested: bool,
    pub remote_id: Option<[u8; 20]>,
}

impl PeerState {
    fn new() -> Self {
        PeerState {
            am_choked: true,
            am_interested: false,
            peer_choked: true,
            peer_interested: false,
            remote_id: None,
        }
    }
}

/// Spawns a session task for `addr` and returns the coordinator's handle.
///
/// The task dials, handshakes, then serves the message loop until an
/// error, a disconnect command, or socket close. Failures surface as an
/// `Error` event; `Disconnected` always follows as the final event.
pub fn spawn(
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_id: [u8; 20],
    connect_timeout: Duration,
    events: mpsc::Sender<PeerEvent>,
) -> PeerHandle {
    let (commands, commands_rx) = mpsc::channel(32);
    let session = PeerSession {
        addr,
        info_hash,
        our_id,
        connect_timeout,
        events: events.clone(),
        commands: commands_rx,
        state: PeerState::new(),
    };
    tokio::spawn(async move {
        if let Err(error) = session.run().await {
            debug!(peer = %addr, %error, "peer session ended with error");
            let _ = events.send(PeerEvent::Error { addr, error }).await;
        }
        let _ = events.send(PeerEvent::Disconnected { addr }).await;
    });
    PeerHandle { addr, commands }
}

struct PeerSession {
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_id: [u8; 20],
    connect_timeout: Duration,
    events: mpsc::Sender<PeerEvent>,
    commands: mpsc::Receiver<SessionCommand>,
    state: PeerState,
}

impl PeerSession {
    async fn run(mut self) -> PeerResult<()> {
        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(self.addr)).await {
            Err(_) => return Err(PeerError::ConnectTimeout(self.addr)),
            Ok(Err(source)) => {
                return Err(PeerError::Connect {
                    addr: self.addr,
                    source,
                })
            }
            Ok(Ok(stream)) => stream,
        };

        let remote_id = match timeout(self.connect_timeout, self.handshake(&mut stream)).await {
            Err(_) => return Err(PeerError::HandshakeTimeout),
            Ok(result) => result?,
        };

        // We only ever download, so interest is declared up front.
        stream.write_all(&Message::Interested.serialize()).await?;
        self.state.am_interested = true;

        debug!(peer = %self.addr, remote_id = %hex::encode(remote_id), "peer ready");
        if !self
            .emit(PeerEvent::Ready {
                addr: self.addr,
                peer_id: remote_id,
            })
            .await
        {
            return Ok(());
        }

        self.message_loop(stream).await
    }

    /// Sends our handshake, reads and validates the peer's, and records
    /// the remote peer id.
    async fn handshake(&mut self, stream: &mut TcpStream) -> PeerResult<[u8; 20]> {
        let ours = Handshake::new(self.info_hash, self.our_id);
        stream.write_all(&ours.serialize()).await?;

        let theirs = Handshake::read(stream).await?;
        theirs.validate(self.info_hash)?;
        self.state.remote_id = Some(theirs.peer_id);
        Ok(theirs.peer_id)
    }

    /**
    The session's steady state: a select over socket reads, coordinator
    commands, and the keep-alive deadline.

    Received bytes accumulate in a buffer drained message by message;
    partial frames survive until the next read.
    */
    async fn message_loop(mut self, mut stream: TcpStream) -> PeerResult<()> {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        let mut last_write = Instant::now();
        let keepalive = tokio::time::sleep_until(last_write + KEEPALIVE_INTERVAL);
        tokio::pin!(keepalive);

        loop {
            tokio::select! {
                read = tokio::io::AsyncReadExt::read_buf(&mut stream, &mut buf) => {
                    if read? == 0 {
                        return Err(PeerError::ConnectionClosed);
                    }
                    while let Some(msg) = Message::parse(&mut buf)? {
                        if !self.handle_message(msg).await {
                            return Ok(());
                        }
                    }
                }
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Download { index, size }) => {
                        self.request_piece(&mut stream, index, size).await?;
                        last_write = Instant::now();
                        keepalive.as_mut().reset(last_write + KEEPALIVE_INTERVAL);
                    }
                    // A dropped handle means the coordinator is gone.
                    Some(SessionCommand::Disconnect) | None => {
                        debug!(peer = %self.addr, "disconnecting");
                        return Ok(());
                    }
                },
                _ = &mut keepalive => {
                    trace!(peer = %self.addr, "sending keep-alive");
                    stream.write_all(&Message::KeepAlive.serialize()).await?;
                    last_write = Instant::now();
                    keepalive.as_mut().reset(last_write + KEEPALIVE_INTERVAL);
                }
            }
        }
    }

    /// Applies one received message to the state machine and forwards the
    /// observable ones. Returns false once the coordinator is gone.
    async fn handle_message(&mut self, msg: Message) -> bool {
        let addr = self.addr;
        match msg {
            Message::KeepAlive => true,
            Message::Choke => {
                self.state.am_choked = true;
                self.emit(PeerEvent::Choke { addr }).await
            }
            Message::Unchoke => {
                self.state.am_choked = false;
                self.emit(PeerEvent::Unchoke { addr }).await
            }
            Message::Interested => {
                self.state.peer_interested = true;
                true
            }
            Message::NotInterested => {
                self.state.peer_interested = false;
                true
            }
            Message::Have(index) => self.emit(PeerEvent::Have { addr, index }).await,
            Message::Bitfield(payload) => self.emit(PeerEvent::Bitfield { addr, payload }).await,
            Message::Piece {
                index,
                begin,
                block,
            } => {
                self.emit(PeerEvent::Block {
                    addr,
                    index,
                    begin,
                    data: block,
                })
                .await
            }
            Message::Request { index, .. } => {
                // This client never serves pieces.
                trace!(peer = %addr, piece = index, "ignoring block request");
                true
            }
            Message::Cancel { .. } | Message::Port(_) => true,
            Message::Unknown(id) => {
                debug!(peer = %addr, id, "skipping unknown message id");
                true
            }
        }
    }

    /**
    Issues pipelined requests for every block of a piece: consecutive
    16 KiB strides, the last one possibly shorter.

    Requests may only be transmitted while unchoked and interested. If the
    peer choked us after the coordinator decided, the command is dropped
    and the coordinator's per-piece deadline recovers the piece.
    */
    async fn request_piece(
        &mut self,
        stream: &mut TcpStream,
        index: u32,
        size: u32,
    ) -> PeerResult<()> {
        if self.state.am_choked || !self.state.am_interested {
            warn!(peer = %self.addr, piece = index, "dropping download command while choked");
            return Ok(());
        }

        let mut begin = 0u32;
        while begin < size {
            let length = BLOCK_LEN.min(size - begin);
            let msg = Message::Request {
                index,
                begin,
                length,
            };
            stream.write_all(&msg.serialize()).await?;
            begin += length;
        }
        trace!(
            peer = %self.addr,
            piece = index,
            blocks = size.div_ceil(BLOCK_LEN),
            "requested piece"
        );
        Ok(())
    }

    /// Delivers an event; false means the coordinator dropped its mailbox
    /// and the session should wind down.
    async fn emit(&self, event: PeerEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}
