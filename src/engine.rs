//! The public entry point: owns every active torrent and accepts inbound
//! connections for them.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use bytes::BytesMut;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::{oneshot, RwLock},
    task,
    time::timeout,
};
use tokio_util::codec::Decoder;

use crate::{
    bitfield::Bitfield,
    conf::Conf,
    disk::DiskHandle,
    error::{Error, Result},
    metainfo::Metainfo,
    peer::{
        codec::{Handshake, HandshakeCodec},
        PeerSession,
    },
    torrent::{InboundRegistration, Torrent, TorrentHandle},
    PeerId, Sha1Hash, TorrentId,
};

/// Every socket operation the listener performs (reading the incoming
/// handshake) carries this deadline, matching peer sessions.
const SOCKET_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// The set of active torrents, keyed by info hash, shared between the
/// engine and the seeder listener.
pub(crate) type TaskRegistry = Arc<RwLock<HashMap<Sha1Hash, TorrentHandle>>>;

/// Owns the set of active torrents and the disk task they all share. The
/// crate's public entry point.
pub struct Engine {
    conf: Conf,
    disk: DiskHandle,
    registry: TaskRegistry,
    next_id: AtomicU32,
}

impl Engine {
    /// Spawns the disk task and returns an engine with no torrents yet.
    pub fn new(conf: Conf) -> Result<Self> {
        let disk = DiskHandle::spawn()?;
        Ok(Self {
            conf,
            disk,
            registry: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU32::new(1),
        })
    }

    /// Adds a torrent identified by `metainfo`, allocates its storage and
    /// starts its scheduler. `resume` is the bitfield to start from:
    /// all-zero for a fresh download, all-ones for a seed-only task.
    ///
    /// Rejects torrents whose info hash is already active.
    pub async fn add_torrent(
        &self,
        metainfo: Metainfo,
        resume: Bitfield,
    ) -> Result<TorrentId> {
        if self.registry.read().await.contains_key(&metainfo.info_hash) {
            return Err(Error::InvalidMetainfo(format!(
                "torrent {} already added",
                hex::encode(metainfo.info_hash)
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (torrent, handle) = Torrent::new(
            id,
            &metainfo,
            self.conf.torrent.clone(),
            self.conf.engine.client_id,
            self.conf.engine.listen_port,
            self.disk.clone(),
            resume,
        )
        .await?;

        // re-check under the write lock: two concurrent add_torrent calls
        // for the same info hash could otherwise both pass the read-lock
        // check above and both allocate storage
        let mut registry = self.registry.write().await;
        if registry.contains_key(&metainfo.info_hash) {
            return Err(Error::InvalidMetainfo(format!(
                "torrent {} already added",
                hex::encode(metainfo.info_hash)
            )));
        }
        registry.insert(metainfo.info_hash, handle);
        drop(registry);

        task::spawn(torrent.run());

        Ok(id)
    }

    /// Returns a handle to the registry, for constructing a
    /// [`SeederListener`] that serves every torrent this engine owns.
    pub(crate) fn registry(&self) -> TaskRegistry {
        Arc::clone(&self.registry)
    }

    pub fn client_id(&self) -> PeerId {
        self.conf.engine.client_id
    }

    /// Starts a seeder listener bound to the engine's configured port on
    /// every local address, serving every torrent currently (and
    /// subsequently) registered with this engine.
    pub async fn run_seeder_listener(&self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.conf.engine.listen_port));
        let listener =
            SeederListener::bind(addr, self.registry(), self.client_id())
                .await?;
        listener.run().await
    }
}

/// Accepts inbound TCP connections, performs the incoming handshake (which
/// identifies the torrent being requested), and hands the session off to
/// the matching torrent's scheduler.
pub(crate) struct SeederListener {
    listener: TcpListener,
    registry: TaskRegistry,
    client_id: PeerId,
}

impl SeederListener {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        registry: TaskRegistry,
        client_id: PeerId,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("seeder listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            registry,
            client_id,
        })
    }

    /// Runs the accept loop forever, spawning one task per inbound
    /// connection.
    pub async fn run(self) -> Result<()> {
        loop {
            let (socket, addr) = self.listener.accept().await?;
            let registry = Arc::clone(&self.registry);
            let client_id = self.client_id;
            task::spawn(async move {
                if let Err(e) =
                    handle_incoming(socket, addr, registry, client_id).await
                {
                    log::info!("inbound peer {} rejected: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_incoming(
    mut socket: TcpStream,
    addr: SocketAddr,
    registry: TaskRegistry,
    client_id: PeerId,
) -> Result<()> {
    let handshake = read_handshake(&mut socket).await?;

    if handshake.peer_id == client_id {
        log::info!("inbound peer {} is ourselves, dropping", addr);
        return Err(Error::HandshakeMismatch);
    }

    let handle = {
        let registry = registry.read().await;
        registry.get(&handshake.info_hash).cloned().ok_or_else(|| {
            Error::InvalidMetainfo(format!(
                "unknown torrent {}",
                hex::encode(handshake.info_hash)
            ))
        })?
    };

    let (mut session, cmd_tx, have_tx) = PeerSession::inbound(
        Arc::clone(&handle.shared),
        handle.disk.clone(),
        handle.session_alert_tx.clone(),
        addr,
        handle.cancel.clone(),
    );

    // register the session's channels with the torrent's scheduler before
    // starting it, so that by the time it can emit its `Ready` alert the
    // scheduler already knows about it
    let (ack_tx, ack_rx) = oneshot::channel();
    handle
        .new_inbound_tx
        .send(InboundRegistration {
            addr,
            cmd_tx,
            have_tx,
            ack: ack_tx,
        })
        .map_err(|_| Error::ChannelClosed)?;
    ack_rx.await.map_err(|_| Error::ChannelClosed)?;

    session.start_inbound(socket, handshake).await;
    Ok(())
}

/// Reads exactly the handshake's fixed-size wire form off `socket` via
/// plain positioned reads (not a `Framed`, so no buffered bytes are
/// discarded for the session's own codec to pick up afterwards).
async fn read_handshake(socket: &mut TcpStream) -> Result<Handshake> {
    let mut buf = [0u8; 68];
    timeout(SOCKET_TIMEOUT, socket.read_exact(&mut buf)).await??;
    let mut bytes = BytesMut::from(&buf[..]);
    HandshakeCodec
        .decode(&mut bytes)?
        .ok_or(Error::HandshakeMismatch)
}
