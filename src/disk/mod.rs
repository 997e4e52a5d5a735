//! The disk IO subsystem: an actor that owns every torrent's file handles
//! and performs the (potentially blocking) reads, writes and hash checks on
//! its own task, off the async reactor.

mod io;

use tokio::{sync::mpsc, sync::oneshot, task};

use crate::{
    error::{Error, NewTorrentError, ReadError, Result, WriteError},
    storage_info::StorageInfo,
    BlockInfo, TorrentId,
};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// A command sent to the disk task.
pub(crate) enum Command {
    /// Allocates storage for a new torrent (creates directories and opens
    /// file handles, but doesn't write anything yet).
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
        result: oneshot::Sender<
            std::result::Result<TorrentAllocation, NewTorrentError>,
        >,
    },
    /// Enqueues a downloaded block for writing; once all of a piece's blocks
    /// have arrived, the piece is hashed and, if valid, flushed to disk.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Reads a block's bytes back from disk, to serve an upload request.
    ReadBlock {
        id: TorrentId,
        info: BlockInfo,
        result: oneshot::Sender<std::result::Result<Vec<u8>, ReadError>>,
    },
    /// Shuts down the disk event loop.
    Shutdown,
}

/// Returned to the engine when a torrent's storage has been allocated: the
/// per-torrent port on which this torrent's write/hash results arrive.
pub(crate) struct TorrentAllocation {
    pub alert_port: TorrentAlertReceiver,
}

/// A torrent-specific alert sent by the disk task.
pub(crate) enum TorrentAlert {
    /// The result of writing a batch of blocks (and possibly completing and
    /// hashing a piece).
    BatchWrite(std::result::Result<BatchWrite, WriteError>),
}

/// Describes the outcome of writing a piece's blocks to disk.
pub(crate) struct BatchWrite {
    /// The blocks that were part of the write.
    pub blocks: Vec<BlockInfo>,
    /// `Some(true)` if the piece these blocks complete was valid and was
    /// flushed to disk, `Some(false)` if it was invalid and discarded, `None`
    /// if this write didn't complete a piece.
    pub is_piece_valid: Option<bool>,
}

/// A cheaply cloneable handle for submitting disk IO commands, held by the
/// engine and cloned into every per-torrent task that needs to read or write
/// blocks.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
}

impl DiskHandle {
    /// Spawns the disk task and returns a handle to it.
    pub fn spawn() -> Result<Self> {
        let (mut disk, cmd_chan) = io::Disk::new()?;
        task::spawn(async move {
            if let Err(e) = disk.start().await {
                log::error!("disk event loop exited with error: {}", e);
            }
        });
        Ok(Self { cmd_chan })
    }

    /// Allocates storage for a new torrent and returns the port on which its
    /// write/hash results will arrive.
    pub async fn allocate_new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> std::result::Result<TorrentAllocation, NewTorrentError> {
        let (result, response) = oneshot::channel();
        if self
            .cmd_chan
            .send(Command::NewTorrent {
                id,
                info,
                piece_hashes,
                result,
            })
            .is_err()
        {
            return Err(NewTorrentError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "disk task is gone",
            )));
        }
        response.await.unwrap_or_else(|_| {
            Err(NewTorrentError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "disk task is gone",
            )))
        })
    }

    pub fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        self.cmd_chan
            .send(Command::WriteBlock { id, info, data })
            .map_err(Error::from)
    }

    pub async fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
    ) -> Result<Vec<u8>> {
        let (result, response) = oneshot::channel();
        self.cmd_chan
            .send(Command::ReadBlock { id, info, result })
            .map_err(Error::from)?;
        response
            .await
            .map_err(|_| Error::ChannelClosed)?
            .map_err(|e| Error::StorageFailure(e.to_string()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.cmd_chan.send(Command::Shutdown).map_err(Error::from)
    }
}
