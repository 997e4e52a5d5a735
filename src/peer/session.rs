//! The per-connection peer state machine: handshake, bitfield exchange,
//! pipelined block requests, and serving upload requests.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};
use tokio_util::{
    codec::{Framed, FramedParts},
    sync::CancellationToken,
};

use crate::{
    bitfield::Bitfield,
    disk::DiskHandle,
    download::PieceDownload,
    error::{Error, Result},
    torrent::SharedStatus,
    BlockInfo, PieceIndex,
};

use super::codec::{
    Handshake, HandshakeCodec, Message, PeerCodec, PROTOCOL_STRING,
};

/// Every socket operation (dial, handshake, message read/write) carries this
/// deadline.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of a peer's have-notification outbox. Overflow silently drops
/// the notification for that peer rather than blocking the scheduler.
const HAVE_OUTBOX_CAPACITY: usize = 16;

pub(crate) type Sender = mpsc::UnboundedSender<Command>;
pub(crate) type Receiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type HaveSender = mpsc::Sender<PieceIndex>;
pub(crate) type HaveReceiver = mpsc::Receiver<PieceIndex>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

/// Commands the scheduler (the owning [`crate::torrent::Torrent`]) may send
/// to a session.
pub(crate) enum Command {
    /// The scheduler picked a piece for this (idle) peer to download.
    Assign(PieceIndex),
    /// Eventually shut down the peer session.
    Shutdown,
}

/// Alerts a session sends back to the scheduler about its own lifecycle.
pub(crate) enum Alert {
    /// The handshake and bitfield exchange completed; the peer's initial
    /// piece availability is attached.
    Ready { addr: SocketAddr, bitfield: Bitfield },
    /// The peer announced (via `Have`) that it now has this piece.
    PeerHasPiece { addr: SocketAddr, index: PieceIndex },
    /// The session has no more work assigned and is available for a new
    /// piece.
    Idle { addr: SocketAddr },
    /// The session has terminated. If it had an incomplete assigned piece,
    /// its index is attached so the scheduler can requeue it.
    Stopped {
        addr: SocketAddr,
        pending_piece: Option<PieceIndex>,
    },
}

/// A single peer connection's state machine.
pub(crate) struct PeerSession {
    torrent: Arc<SharedStatus>,
    disk: DiskHandle,
    alert_chan: AlertSender,
    cmd_port: Receiver,
    have_port: HaveReceiver,
    cancel: CancellationToken,
    addr: SocketAddr,
    status: Status,
    /// The piece currently assigned to us by the scheduler, if any. Per the
    /// pipelining contract this engine downloads at most one piece at a time
    /// per peer.
    current_piece: Option<PieceDownload>,
    /// Requests we've sent but haven't yet received a block for.
    outgoing_requests: Vec<BlockInfo>,
    /// Set once the handshake completes.
    peer_info: Option<PeerInfo>,
}

impl PeerSession {
    /// Creates a new outbound session for the peer at `addr`.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        disk: DiskHandle,
        alert_chan: AlertSender,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> (Self, Sender, HaveSender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (have_chan, have_port) = mpsc::channel(HAVE_OUTBOX_CAPACITY);
        (
            Self {
                torrent,
                disk,
                alert_chan,
                cmd_port,
                have_port,
                cancel,
                addr,
                status: Status::default(),
                current_piece: None,
                outgoing_requests: Vec::new(),
                peer_info: None,
            },
            cmd_chan,
            have_chan,
        )
    }

    /// Creates a new inbound session from a connection the listener already
    /// accepted and handshook (the listener reads the incoming handshake
    /// itself in order to resolve which torrent it's for).
    pub fn inbound(
        torrent: Arc<SharedStatus>,
        disk: DiskHandle,
        alert_chan: AlertSender,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> (Self, Sender, HaveSender) {
        Self::outbound(torrent, disk, alert_chan, addr, cancel)
    }

    /// Dials, handshakes and runs an outbound session to completion.
    pub async fn start_outbound(&mut self) {
        let result = self.run_outbound().await;
        self.finish(result).await;
    }

    /// Runs an inbound session to completion, given the already-connected
    /// socket and the peer's already-received handshake.
    pub async fn start_inbound(
        &mut self,
        socket: TcpStream,
        peer_handshake: Handshake,
    ) {
        let result = self.run_inbound(socket, peer_handshake).await;
        self.finish(result).await;
    }

    async fn finish(&mut self, result: Result<()>) {
        match &result {
            Err(Error::Cancelled) => {
                log::debug!("peer {} session cancelled", self.addr);
            }
            Err(e) => {
                log::info!("peer {} session ended: {}", self.addr, e);
            }
            Ok(()) => {}
        }
        let pending_piece = self.current_piece.as_ref().map(|d| d.index());
        let _ = self.alert_chan.send(Alert::Stopped {
            addr: self.addr,
            pending_piece,
        });
    }

    async fn run_outbound(&mut self) -> Result<()> {
        log::info!("connecting to peer {}", self.addr);
        let socket =
            timeout(SOCKET_TIMEOUT, TcpStream::connect(self.addr)).await??;
        log::info!("connected to peer {}", self.addr);

        let mut handshake_socket = Framed::new(socket, HandshakeCodec);
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        timeout(SOCKET_TIMEOUT, handshake_socket.send(handshake)).await??;

        let peer_handshake = timeout(SOCKET_TIMEOUT, handshake_socket.next())
            .await?
            .ok_or(Error::HandshakeMismatch)??;
        self.verify_handshake(&peer_handshake)?;

        self.run_from_handshake(handshake_socket, peer_handshake).await
    }

    async fn run_inbound(
        &mut self,
        socket: TcpStream,
        peer_handshake: Handshake,
    ) -> Result<()> {
        self.verify_handshake(&peer_handshake)?;

        let mut handshake_socket = Framed::new(socket, HandshakeCodec);
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        timeout(SOCKET_TIMEOUT, handshake_socket.send(handshake)).await??;

        self.run_from_handshake(handshake_socket, peer_handshake).await
    }

    fn verify_handshake(&self, peer_handshake: &Handshake) -> Result<()> {
        debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());
        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("peer {} sent unexpected info hash", self.addr);
            return Err(Error::HandshakeMismatch);
        }
        if peer_handshake.peer_id == self.torrent.client_id {
            log::info!("peer {} is ourselves, dropping", self.addr);
            return Err(Error::HandshakeMismatch);
        }
        Ok(())
    }

    async fn run_from_handshake(
        &mut self,
        handshake_socket: Framed<TcpStream, HandshakeCodec>,
        peer_handshake: Handshake,
    ) -> Result<()> {
        self.peer_info = Some(PeerInfo {
            their_pieces: Bitfield::new(self.torrent.storage.piece_count),
        });
        let _ = peer_handshake;

        // switch codecs, reusing the framed buffers in case the peer sent
        // anything right after the handshake
        let old_parts = handshake_socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        // announce our own availability, then declare the normal operating
        // posture: unchoked and interested, always (no choking algorithm, no
        // tit-for-tat in this engine)
        let our_bitfield = self.torrent.bitfield.read().await.clone();
        timeout(
            SOCKET_TIMEOUT,
            socket.send(Message::Bitfield(our_bitfield.as_bytes().to_vec())),
        )
        .await??;
        timeout(SOCKET_TIMEOUT, socket.send(Message::Unchoke)).await??;
        timeout(SOCKET_TIMEOUT, socket.send(Message::Interested)).await??;
        self.status.am_choking = false;
        self.status.am_interested = true;

        // the first non-keep-alive message we expect from the peer is its
        // bitfield
        loop {
            match timeout(SOCKET_TIMEOUT, socket.next()).await? {
                Some(msg) => {
                    let msg = msg?;
                    if let Message::KeepAlive = msg {
                        continue;
                    }
                    if let Message::Bitfield(bytes) = msg {
                        let mut bitfield = Bitfield::from_bytes(bytes);
                        if bitfield.len() < self.torrent.storage.piece_count {
                            return Err(Error::ProtocolViolation(
                                "peer bitfield shorter than piece count"
                                    .into(),
                            ));
                        }
                        self.peer_info.as_mut().unwrap().their_pieces =
                            bitfield_with_len(
                                &mut bitfield,
                                self.torrent.storage.piece_count,
                            );
                        break;
                    } else {
                        log::info!(
                            "peer {} sent {:?} before bitfield",
                            self.addr,
                            msg
                        );
                        return Err(Error::ProtocolViolation(
                            "expected bitfield as first message".into(),
                        ));
                    }
                }
                None => return Err(Error::ChannelClosed),
            }
        }

        let _ = self.alert_chan.send(Alert::Ready {
            addr: self.addr,
            bitfield: self.peer_info.as_ref().unwrap().their_pieces.clone(),
        });

        self.run(socket).await
    }

    /// The main session loop: reacts to inbound messages and scheduler
    /// commands until the connection closes or is shut down.
    async fn run(
        &mut self,
        mut socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::debug!("peer {} session cancelled", self.addr);
                    return Err(Error::Cancelled);
                }
                msg = timeout(SOCKET_TIMEOUT, socket.next()) => {
                    let msg = msg?.ok_or(Error::ChannelClosed)??;
                    self.handle_msg(&mut socket, msg).await?;
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Assign(index)) => {
                            self.assign_piece(index);
                            self.make_requests(&mut socket).await?;
                        }
                        Some(Command::Shutdown) | None => {
                            log::info!("shutting down peer {} session", self.addr);
                            return Ok(());
                        }
                    }
                }
                index = self.have_port.recv() => {
                    if let Some(index) = index {
                        socket.send(Message::Have { piece_index: index as u32 }).await?;
                    }
                }
            }
        }
    }

    fn assign_piece(&mut self, index: PieceIndex) {
        debug_assert!(self.current_piece.is_none());
        log::info!("peer {} assigned piece {}", self.addr, index);
        let len = self
            .torrent
            .storage
            .piece_len(index)
            .unwrap_or(self.torrent.storage.piece_len);
        self.current_piece = Some(PieceDownload::new(index, len));
    }

    async fn handle_msg(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(_) => {
                return Err(Error::ProtocolViolation(
                    "bitfield sent outside of handshake".into(),
                ));
            }
            Message::Choke => {
                if !self.status.peer_choking {
                    log::info!("peer {} choked us", self.addr);
                    self.status.peer_choking = true;
                    let freed = std::mem::take(&mut self.outgoing_requests);
                    if let Some(download) = self.current_piece.as_mut() {
                        download.free_blocks(&freed);
                    }
                }
            }
            Message::Unchoke => {
                if self.status.peer_choking {
                    log::info!("peer {} unchoked us", self.addr);
                    self.status.peer_choking = false;
                    self.make_requests(socket).await?;
                }
            }
            Message::Interested => {
                self.status.peer_interested = true;
            }
            Message::NotInterested => {
                self.status.peer_interested = false;
            }
            Message::Have { piece_index } => {
                let index = piece_index as PieceIndex;
                if let Some(info) = self.peer_info.as_mut() {
                    info.their_pieces.set(index);
                }
                let _ = self.alert_chan.send(Alert::PeerHasPiece {
                    addr: self.addr,
                    index,
                });
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                self.serve_request(socket, index, begin, length).await?;
            }
            Message::Block { index, begin, data } => {
                self.handle_block(index, begin, data).await?;
                self.make_requests(socket).await?;
            }
            Message::Cancel { .. } => {
                // no endgame mode, so there's nothing in flight to cancel
            }
        }
        Ok(())
    }

    async fn serve_request(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<()> {
        let piece_index = index as PieceIndex;
        let have_it = self.torrent.bitfield.read().await.has(piece_index);
        let piece_len = self.torrent.storage.piece_len(piece_index);
        let in_bounds = matches!(piece_len, Ok(len) if begin.checked_add(length).map_or(false, |end| end <= len));
        if !have_it || !in_bounds {
            log::info!(
                "peer {} requested out of bounds or unavailable block {}:{}:{}",
                self.addr,
                index,
                begin,
                length
            );
            return Err(Error::ProtocolViolation(
                "request out of bounds or piece not available".into(),
            ));
        }

        let data = self
            .disk
            .read_block(
                self.torrent.id,
                BlockInfo {
                    piece_index,
                    offset: begin,
                    len: length,
                },
            )
            .await?;
        timeout(
            SOCKET_TIMEOUT,
            socket.send(Message::Block { index, begin, data }),
        )
        .await??;
        Ok(())
    }

    async fn handle_block(
        &mut self,
        index: u32,
        begin: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let block_info = BlockInfo {
            piece_index: index as PieceIndex,
            offset: begin,
            len: data.len() as u32,
        };
        log::debug!("received block {:?} from peer {}", block_info, self.addr);

        let request_pos = self
            .outgoing_requests
            .iter()
            .position(|b| *b == block_info);
        let request_pos = match request_pos {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "peer {} sent unrequested block {:?}",
                    self.addr,
                    block_info
                );
                return Ok(());
            }
        };
        self.outgoing_requests.remove(request_pos);

        let download = self.current_piece.as_mut().ok_or_else(|| {
            Error::ProtocolViolation(
                "received block without an assigned piece".into(),
            )
        })?;
        if download.index() != block_info.piece_index {
            return Err(Error::ProtocolViolation(
                "block belongs to a piece that isn't currently assigned"
                    .into(),
            ));
        }
        download.received_block(block_info);

        self.disk.write_block(self.torrent.id, block_info, data)?;

        if download.is_complete() {
            let index = download.index();
            log::info!("finished downloading piece {} from peer {}", index, self.addr);
            self.current_piece = None;
            let _ = self.alert_chan.send(Alert::Idle { addr: self.addr });
        }

        Ok(())
    }

    /// Tops up the outstanding request backlog for the currently assigned
    /// piece, if we're not choked.
    async fn make_requests(
        &mut self,
        socket: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        if self.status.peer_choking {
            return Ok(());
        }
        let download = match self.current_piece.as_mut() {
            Some(d) => d,
            None => return Ok(()),
        };

        let max_backlog = self.torrent.max_request_backlog;
        debug_assert!(self.outgoing_requests.len() <= max_backlog);
        let to_request = max_backlog - self.outgoing_requests.len();
        if to_request == 0 {
            return Ok(());
        }

        let mut blocks = Vec::new();
        download.pick_blocks(to_request, &mut blocks);
        self.outgoing_requests.extend_from_slice(&blocks);
        for block in blocks {
            timeout(
                SOCKET_TIMEOUT,
                socket.send(Message::Request {
                    index: block.piece_index as u32,
                    begin: block.offset,
                    length: block.len,
                }),
            )
            .await??;
        }
        Ok(())
    }
}

/// Resizes `bitfield` down to `piece_count` bits (the wire form may be
/// padded up to a byte boundary) and returns the result.
fn bitfield_with_len(bitfield: &mut Bitfield, piece_count: usize) -> Bitfield {
    let mut out = Bitfield::new(piece_count);
    for i in 0..piece_count {
        if bitfield.has(i) {
            out.set(i);
        }
    }
    out
}

/// Session-local flags, independent of the torrent-wide `Bitfield`.
#[derive(Clone, Copy, Debug)]
struct Status {
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Information about the connected peer, set once the handshake and initial
/// bitfield exchange complete.
struct PeerInfo {
    their_pieces: Bitfield,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use tokio::net::{TcpListener, TcpStream};

    use crate::{
        disk::DiskHandle,
        storage_info::{FsStructure, StorageInfo},
        FileInfo, PeerId, Sha1Hash, BLOCK_LEN,
    };

    #[test]
    fn test_bitfield_with_len_truncates_padding_bits() {
        let mut bf = Bitfield::from_bytes(vec![0b1111_1111]);
        let truncated = bitfield_with_len(&mut bf, 3);
        assert_eq!(truncated.len(), 3);
        assert!(truncated.has(0));
        assert!(truncated.has(1));
        assert!(truncated.has(2));
    }

    fn single_piece_shared_status(
        info_hash: Sha1Hash,
        client_id: PeerId,
        piece_len: u32,
    ) -> SharedStatus {
        let storage = StorageInfo {
            piece_count: 1,
            piece_len,
            last_piece_len: piece_len,
            download_len: piece_len as u64,
            download_dir: PathBuf::from("/tmp"),
            structure: FsStructure::File(FileInfo {
                path: PathBuf::from("f"),
                torrent_offset: 0,
                len: piece_len as u64,
            }),
        };
        SharedStatus {
            id: 1,
            info_hash,
            client_id,
            storage,
            bitfield: tokio::sync::RwLock::new(Bitfield::new(1)),
            max_request_backlog: 5,
        }
    }

    fn new_session_for_test(
        shared: Arc<SharedStatus>,
        addr: SocketAddr,
    ) -> (PeerSession, AlertReceiver) {
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let disk = DiskHandle::spawn().unwrap();
        let (session, _cmd_tx, _have_tx) = PeerSession::outbound(
            shared,
            disk,
            alert_tx,
            addr,
            CancellationToken::new(),
        );
        (session, alert_rx)
    }

    // spec scenario 4: a handshake whose info hash doesn't match ours, or
    // whose peer id is our own, must be rejected before anything else
    // happens on the connection.
    #[tokio::test]
    async fn test_handshake_mismatch_is_rejected() {
        let client_id = [9u8; 20];
        let shared = Arc::new(single_piece_shared_status(
            [0u8; 20],
            client_id,
            65536,
        ));
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (session, _alert_rx) =
            new_session_for_test(Arc::clone(&shared), addr);

        let mismatched = Handshake::new([0xffu8; 20], [1u8; 20]);
        assert!(matches!(
            session.verify_handshake(&mismatched),
            Err(Error::HandshakeMismatch)
        ));

        let self_connect = Handshake::new([0u8; 20], client_id);
        assert!(matches!(
            session.verify_handshake(&self_connect),
            Err(Error::HandshakeMismatch)
        ));

        let legit = Handshake::new([0u8; 20], [2u8; 20]);
        assert!(session.verify_handshake(&legit).is_ok());
    }

    // spec scenario 5: piece length 65536 = 4 * 16384. With a backlog cap of
    // 5 but only 4 blocks in the piece, the session should pipeline exactly
    // 4 requests, not 5, before waiting for any response.
    #[tokio::test]
    async fn test_pipelining_caps_at_piece_block_count() {
        let shared = Arc::new(single_piece_shared_status(
            [0u8; 20],
            [9u8; 20],
            65536,
        ));
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (mut session, _alert_rx) =
            new_session_for_test(Arc::clone(&shared), addr);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener_addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(listener_addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let mut our_socket = Framed::new(client, PeerCodec);
        let mut peer_socket = Framed::new(server, PeerCodec);

        session.status.peer_choking = false;
        session.assign_piece(0);
        session.make_requests(&mut our_socket).await.unwrap();

        assert_eq!(session.outgoing_requests.len(), 4);

        let mut seen = Vec::new();
        for _ in 0..4 {
            match peer_socket.next().await.unwrap().unwrap() {
                Message::Request { index, begin, length } => {
                    assert_eq!(index, 0);
                    seen.push((begin, length));
                }
                other => panic!("expected Request, got {:?}", other),
            }
        }
        seen.sort();
        assert_eq!(
            seen,
            vec![
                (0, BLOCK_LEN),
                (BLOCK_LEN, BLOCK_LEN),
                (2 * BLOCK_LEN, BLOCK_LEN),
                (3 * BLOCK_LEN, BLOCK_LEN),
            ]
        );

        // nothing more is pending: a 5th request would have overshot the
        // piece's actual block count
        tokio::select! {
            _ = peer_socket.next() => panic!("unexpected 5th request"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
}
