//! The per-torrent scheduler: owns the piece queue, the live peer sessions,
//! the announce loop, and reacts to the disk task's write/hash results.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot, RwLock},
    task,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::{
    bitfield::Bitfield,
    conf::TorrentConf,
    counter::ThroughputCounter,
    disk::{DiskHandle, TorrentAlert, TorrentAlertReceiver},
    error::Result,
    metainfo::Metainfo,
    peer::{
        Alert as SessionAlert, AlertReceiver as SessionAlertReceiver,
        AlertSender as SessionAlertSender, Command as SessionCommand,
        HaveSender, PeerSession, Sender as SessionSender,
    },
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    tracker,
    PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// State shared between the scheduler and every peer session belonging to
/// this torrent. Held behind an `Arc` so sessions can outlive a single
/// scheduling pass without borrowing from the `Torrent` actor.
pub(crate) struct SharedStatus {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    pub bitfield: RwLock<Bitfield>,
    pub max_request_backlog: usize,
}

/// Bookkeeping the scheduler keeps for a live session.
struct PeerHandle {
    cmd_tx: SessionSender,
    have_tx: HaveSender,
    their_pieces: Bitfield,
}

/// What a not-yet-handshook connection needs once it reports in, whether it
/// was dialed by us (outbound) or handed off by the seeder listener
/// (inbound).
struct PendingPeer {
    cmd_tx: SessionSender,
    have_tx: HaveSender,
}

/// Registers an inbound session's channels with the scheduler before it
/// starts running, so that by the time it can possibly emit
/// [`SessionAlert::Ready`] the scheduler already has it in `connecting` and
/// won't drop the alert. `ack` is fired once the registration has landed.
pub(crate) struct InboundRegistration {
    pub addr: SocketAddr,
    pub cmd_tx: SessionSender,
    pub have_tx: HaveSender,
    pub ack: oneshot::Sender<()>,
}

/// A cheaply cloneable handle to a running torrent, held by
/// [`crate::engine::TaskRegistry`] so the seeder listener can hand off
/// inbound connections without round-tripping through the scheduler's own
/// command loop.
#[derive(Clone)]
pub(crate) struct TorrentHandle {
    pub shared: Arc<SharedStatus>,
    pub disk: DiskHandle,
    pub session_alert_tx: SessionAlertSender,
    pub new_inbound_tx: mpsc::UnboundedSender<InboundRegistration>,
    pub cancel: CancellationToken,
}

/// The per-torrent actor: matches idle peers to pieces they have, persists
/// completed pieces (via the disk task) and keeps the peer set replenished
/// through periodic tracker announces.
pub(crate) struct Torrent {
    shared: Arc<SharedStatus>,
    disk: DiskHandle,
    conf: TorrentConf,
    listen_port: u16,
    announce_url: Option<String>,
    cancel: CancellationToken,
    pieces: PiecePicker,
    peers_idle: HashMap<SocketAddr, PeerHandle>,
    peers_busy: HashMap<SocketAddr, PeerHandle>,
    connecting: HashMap<SocketAddr, PendingPeer>,
    session_alert_tx: SessionAlertSender,
    session_alert_rx: SessionAlertReceiver,
    disk_alert_rx: TorrentAlertReceiver,
    new_peers_tx: mpsc::UnboundedSender<SocketAddr>,
    new_peers_rx: mpsc::UnboundedReceiver<SocketAddr>,
    new_inbound_tx: mpsc::UnboundedSender<InboundRegistration>,
    new_inbound_rx: mpsc::UnboundedReceiver<InboundRegistration>,
    throughput: ThroughputCounter,
    /// Whether the torrent was already complete when it started (a
    /// seed-only task): in that case reaching `all_ones` again is not a
    /// termination signal, since there's nothing left to download.
    started_complete: bool,
}

impl Torrent {
    /// Allocates storage for `metainfo` and builds the scheduler, ready to
    /// be run via [`Torrent::run`]. `resume` is the bitfield to start from:
    /// all-zero for a fresh download, all-ones for a seed-only task.
    pub async fn new(
        id: TorrentId,
        metainfo: &Metainfo,
        conf: TorrentConf,
        client_id: PeerId,
        listen_port: u16,
        disk: DiskHandle,
        resume: Bitfield,
    ) -> Result<(Self, TorrentHandle)> {
        let storage = StorageInfo::new(metainfo, conf.download_dir.clone());
        let piece_hashes: Vec<u8> =
            metainfo.piece_hashes.iter().flatten().copied().collect();

        let allocation = disk
            .allocate_new_torrent(id, storage.clone(), piece_hashes)
            .await
            .map_err(|e| {
                crate::error::Error::StorageFailure(e.to_string())
            })?;

        let piece_count = storage.piece_count;
        let mut pieces = PiecePicker::new(piece_count);
        for index in 0..piece_count {
            if resume.has(index) {
                pieces.remove(index);
            }
        }
        let started_complete = resume.all_ones(piece_count);

        let shared = Arc::new(SharedStatus {
            id,
            info_hash: metainfo.info_hash,
            client_id,
            storage,
            bitfield: RwLock::new(resume),
            max_request_backlog: conf.max_request_backlog,
        });

        let (session_alert_tx, session_alert_rx) = mpsc::unbounded_channel();
        let (new_peers_tx, new_peers_rx) = mpsc::unbounded_channel();
        let (new_inbound_tx, new_inbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = TorrentHandle {
            shared: Arc::clone(&shared),
            disk: disk.clone(),
            session_alert_tx: session_alert_tx.clone(),
            new_inbound_tx: new_inbound_tx.clone(),
            cancel: cancel.clone(),
        };

        let torrent = Self {
            shared,
            disk,
            announce_url: metainfo.announce.clone(),
            conf,
            listen_port,
            cancel,
            pieces,
            peers_idle: HashMap::new(),
            peers_busy: HashMap::new(),
            connecting: HashMap::new(),
            session_alert_tx,
            session_alert_rx,
            disk_alert_rx: allocation.alert_port,
            new_peers_tx,
            new_peers_rx,
            new_inbound_tx,
            new_inbound_rx,
            throughput: ThroughputCounter::new(),
            started_complete,
        };

        Ok((torrent, handle))
    }

    /// Runs the scheduler until the torrent completes (unless it started out
    /// already complete) or its cancellation token fires.
    pub async fn run(mut self) {
        if let Some(url) = self.announce_url.clone() {
            task::spawn(announce_loop(
                url,
                Arc::clone(&self.shared),
                self.conf.clone(),
                self.listen_port,
                self.new_peers_tx.clone(),
                self.cancel.clone(),
            ));
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("torrent {} shutting down", self.shared.id);
                    break;
                }
                alert = self.session_alert_rx.recv() => {
                    match alert {
                        Some(alert) => self.handle_session_alert(alert).await,
                        None => break,
                    }
                }
                alert = self.disk_alert_rx.recv() => {
                    match alert {
                        Some(alert) => self.handle_disk_alert(alert).await,
                        None => break,
                    }
                }
                addr = self.new_peers_rx.recv() => {
                    if let Some(addr) = addr {
                        self.spawn_outbound_peer(addr);
                    }
                }
                reg = self.new_inbound_rx.recv() => {
                    if let Some(reg) = reg {
                        self.connecting.insert(
                            reg.addr,
                            PendingPeer { cmd_tx: reg.cmd_tx, have_tx: reg.have_tx },
                        );
                        let _ = reg.ack.send(());
                    }
                }
            }
        }
    }

    /// Spawns an outbound session to `addr`, unless one is already live or
    /// in progress.
    fn spawn_outbound_peer(&mut self, addr: SocketAddr) {
        if self.peers_idle.contains_key(&addr)
            || self.peers_busy.contains_key(&addr)
            || self.connecting.contains_key(&addr)
        {
            return;
        }

        let (mut session, cmd_tx, have_tx) = PeerSession::outbound(
            Arc::clone(&self.shared),
            self.disk.clone(),
            self.session_alert_tx.clone(),
            addr,
            self.cancel.clone(),
        );
        self.connecting
            .insert(addr, PendingPeer { cmd_tx, have_tx });
        task::spawn(async move {
            session.start_outbound().await;
        });
    }

    async fn handle_session_alert(&mut self, alert: SessionAlert) {
        match alert {
            SessionAlert::Ready { addr, bitfield } => {
                if let Some(pending) = self.connecting.remove(&addr) {
                    self.peers_idle.insert(
                        addr,
                        PeerHandle {
                            cmd_tx: pending.cmd_tx,
                            have_tx: pending.have_tx,
                            their_pieces: bitfield,
                        },
                    );
                }
                self.schedule().await;
            }
            SessionAlert::PeerHasPiece { addr, index } => {
                if let Some(peer) = self
                    .peers_idle
                    .get_mut(&addr)
                    .or_else(|| self.peers_busy.get_mut(&addr))
                {
                    peer.their_pieces.set(index);
                }
                self.schedule().await;
            }
            SessionAlert::Idle { addr } => {
                if let Some(peer) = self.peers_busy.remove(&addr) {
                    self.peers_idle.insert(addr, peer);
                }
                self.schedule().await;
            }
            SessionAlert::Stopped { addr, pending_piece } => {
                self.peers_idle.remove(&addr);
                self.peers_busy.remove(&addr);
                self.connecting.remove(&addr);
                if let Some(index) = pending_piece {
                    self.pieces.requeue(index);
                }
                self.schedule().await;
            }
        }
    }

    /// Walks the idle peer set and, for each, assigns it the lowest-index
    /// pending piece it has available. A peer is matched to at most one
    /// piece per pass.
    async fn schedule(&mut self) {
        let idle_addrs: Vec<SocketAddr> =
            self.peers_idle.keys().copied().collect();
        for addr in idle_addrs {
            if self.pieces.is_empty() {
                break;
            }
            let their_pieces = match self.peers_idle.get(&addr) {
                Some(peer) => peer.their_pieces.clone(),
                None => continue,
            };
            let Some(index) = self.pieces.pick_for(&their_pieces) else {
                continue;
            };
            let peer = self
                .peers_idle
                .remove(&addr)
                .expect("addr was just looked up");
            if peer.cmd_tx.send(SessionCommand::Assign(index)).is_err() {
                // the session already tore down; its own Stopped alert will
                // requeue whatever it had in flight, but this piece was
                // never actually assigned, so requeue it here too
                self.pieces.requeue(index);
                continue;
            }
            self.peers_busy.insert(addr, peer);
        }
    }

    async fn handle_disk_alert(&mut self, alert: TorrentAlert) {
        match alert {
            TorrentAlert::BatchWrite(Ok(batch)) => {
                let Some(index) =
                    batch.blocks.first().map(|b| b.piece_index)
                else {
                    return;
                };
                match batch.is_piece_valid {
                    Some(true) => {
                        let already_owned =
                            self.shared.bitfield.read().await.has(index);
                        if already_owned {
                            // persisting the same piece twice is a no-op
                            return;
                        }
                        self.shared.bitfield.write().await.set(index);
                        let bytes: u64 = batch
                            .blocks
                            .iter()
                            .map(|b| b.len as u64)
                            .sum();
                        self.throughput.update(bytes);
                        log::debug!(
                            "torrent {} piece {} persisted, ~{:.0} B/s",
                            self.shared.id,
                            index,
                            self.throughput.rate()
                        );
                        self.broadcast_have(index);

                        let complete = self
                            .shared
                            .bitfield
                            .read()
                            .await
                            .all_ones(self.shared.storage.piece_count);
                        if complete && !self.started_complete {
                            log::info!(
                                "torrent {} download complete",
                                self.shared.id
                            );
                            self.cancel.cancel();
                        }
                    }
                    Some(false) => {
                        log::warn!(
                            "piece {} failed integrity check, requeueing",
                            index
                        );
                        self.pieces.requeue(index);
                        self.schedule().await;
                    }
                    None => {}
                }
            }
            TorrentAlert::BatchWrite(Err(e)) => {
                log::error!(
                    "torrent {} storage failure, aborting: {}",
                    self.shared.id,
                    e
                );
                self.cancel.cancel();
            }
        }
    }

    /// Pushes `index` onto every live peer's have-outbox. A full outbox
    /// silently drops the notification for that peer.
    fn broadcast_have(&self, index: PieceIndex) {
        for peer in self.peers_idle.values().chain(self.peers_busy.values()) {
            let _ = peer.have_tx.try_send(index);
        }
    }
}

/// Announces to the tracker at `url`, immediately and then on the interval
/// it reports (or every 10 minutes if it reports none, or one shorter than
/// 60 seconds), forwarding discovered peers to the scheduler until
/// cancelled.
async fn announce_loop(
    url: String,
    shared: Arc<SharedStatus>,
    conf: TorrentConf,
    listen_port: u16,
    new_peers_tx: mpsc::UnboundedSender<SocketAddr>,
    cancel: CancellationToken,
) {
    let mut consecutive_failures = 0usize;
    loop {
        let left = {
            let bitfield = shared.bitfield.read().await;
            let storage = &shared.storage;
            // bytes owned so far, assuming every owned piece is a full
            // `piece_len` piece, then correcting for the last piece (which
            // may be shorter) if we happen to own it
            let mut owned_bytes =
                bitfield.count_ones() as u64 * storage.piece_len as u64;
            let last_index = storage.piece_count.saturating_sub(1);
            if storage.piece_count > 0 && bitfield.has(last_index) {
                owned_bytes = owned_bytes - storage.piece_len as u64
                    + storage.last_piece_len as u64;
            }
            storage.download_len.saturating_sub(owned_bytes)
        };
        let params = tracker::AnnounceParams {
            info_hash: shared.info_hash,
            peer_id: shared.client_id,
            port: listen_port,
            uploaded: 0,
            downloaded: 0,
            left,
        };

        let next_interval = match tracker::announce(&url, params).await {
            Ok(resp) => {
                consecutive_failures = 0;
                for addr in resp.peers {
                    let _ = new_peers_tx.send(addr);
                }
                resp.interval
                    .filter(|interval| *interval >= Duration::from_secs(60))
                    .unwrap_or(conf.announce_interval)
            }
            Err(e) => {
                consecutive_failures += 1;
                log::warn!("announce to {} failed: {}", url, e);
                if consecutive_failures >= conf.tracker_error_threshold {
                    log::error!(
                        "tracker {} exceeded error threshold, giving up",
                        url
                    );
                    return;
                }
                conf.announce_interval
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(next_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_started_complete_seed_only_bitfield() {
        let mut bitfield = Bitfield::new(4);
        bitfield.set(0);
        bitfield.set(1);
        bitfield.set(2);
        bitfield.set(3);
        assert!(bitfield.all_ones(4));
    }
}
