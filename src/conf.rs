//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use rand::Rng;

use crate::PeerId;

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. A fresh peer id is generated for this process, per
    /// [`generate_peer_id`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: generate_peer_id(),
                listen_port: DEFAULT_LISTEN_PORT,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Generates a fresh peer id for this process: the Azureus-style prefix
/// `-TC0001-` (this engine's two-letter client code and a version) followed
/// by 12 random bytes, per BEP 20.
pub fn generate_peer_id() -> PeerId {
    const PREFIX: &[u8; 8] = b"-TC0001-";
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PREFIX);
    rand::thread_rng().fill(&mut id[8..]);
    id
}

/// The default port the seeder listener binds to, if not overridden.
pub const DEFAULT_LISTEN_PORT: u16 = 8888;

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// The port the seeder listener binds to, announced to trackers.
    pub listen_port: u16,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't advertise an interval of at least 60 seconds,
    /// we default to announcing every 10 minutes.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// How many block requests a peer session keeps outstanding at once.
    pub max_request_backlog: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // fallback used only when the tracker doesn't advertise its own
            // minimum interval
            announce_interval: Duration::from_secs(10 * 60),
            // needs testing
            tracker_error_threshold: 15,
            max_request_backlog: 5,
        }
    }
}
