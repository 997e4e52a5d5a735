use {
    nix::sys::uio::pwritev,
    sha1::{Digest, Sha1},
    std::{
        collections::{BTreeMap, HashMap},
        fs::{self, File, OpenOptions},
        ops::Range,
        os::fd::AsFd,
        os::unix::fs::FileExt,
        sync::{Arc, Mutex},
    },
    tokio::{
        sync::{mpsc, RwLock},
        task,
    },
};

use {
    super::{
        BatchWrite, Command, CommandReceiver, CommandSender, TorrentAlert,
        TorrentAlertReceiver, TorrentAlertSender, TorrentAllocation,
    },
    crate::{
        block_count,
        error::{Error, NewTorrentError, ReadError, Result, WriteError},
        iovecs::{IoVec, IoVecs},
        storage_info::{FsStructure, StorageInfo},
        BlockInfo, FileIndex, FileInfo, PieceIndex, Sha1Hash, TorrentId,
    },
};

/// The entity responsible for saving downloaded file blocks to disk, serving
/// reads of already downloaded pieces, and verifying piece integrity.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap, which
    /// includes various metadata about torrent and the torrent specific alert
    /// channel.
    torrents: HashMap<TorrentId, RwLock<Torrent>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender.
    pub(super) fn new() -> Result<(Self, CommandSender)> {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
            },
            cmd_chan,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            log::debug!("Disk received command");
            match cmd {
                Command::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                    result,
                } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        let _ = result.send(Err(NewTorrentError::AlreadyExists));
                        continue;
                    }

                    // NOTE: Do _NOT_ return on failure, we don't want to kill
                    // the disk task due to potential disk IO errors: we just
                    // want to log it and notify the caller of it.
                    let torrent_res = Torrent::new(info, piece_hashes);
                    match torrent_res {
                        Ok((torrent, alert_port)) => {
                            log::info!("Torrent {} successfully allocated", id);
                            self.torrents.insert(id, RwLock::new(torrent));
                            let _ = result
                                .send(Ok(TorrentAllocation { alert_port }));
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                            let _ = result.send(Err(e));
                        }
                    }
                }
                Command::WriteBlock { id, info, data } => {
                    self.write_block(id, info, data).await?;
                }
                Command::ReadBlock { id, info, result } => {
                    let read_result = self.read_block(id, info).await;
                    // the requester may have gone away (e.g. peer session
                    // torn down while the read was in flight); that's not a
                    // disk task failure
                    let _ = result.send(read_result);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Queues a block for writing and fails if the torrent id is invalid.
    ///
    /// If the block could not be written due to IO failure, the torrent is
    /// notified of it.
    async fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving torrent {} block {:?} to disk", id, info);
        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })?;
        torrent.write().await.write_block(info, data).await
    }

    /// Reads a block's bytes back from disk, to serve an upload request.
    async fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
    ) -> std::result::Result<Vec<u8>, ReadError> {
        log::trace!("Reading torrent {} block {:?} from disk", id, info);
        let torrent = self
            .torrents
            .get(&id)
            .ok_or(ReadError::InvalidPieceIndex)?;
        let torrent = torrent.read().await;
        torrent.read_block(info)
    }
}

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), metadata about
/// torrent's download and piece sizes, etc.
struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The channel used to alert a torrent that a block has been written to
    /// disk and/or a piece was completed.
    alert_chan: TorrentAlertSender,
    /// The in-progress piece downloads and disk writes. This is the torrent's
    /// disk write buffer. Each piece is mapped to its index for faster lookups.
    pieces: HashMap<PieceIndex, Piece>,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// Disk IO statistics.
    stats: Stats,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    ///
    /// For a single file, there is a path validity check and then the file is
    /// opened. For multi-file torrents, if there are any subdirectories in the
    /// torrent archive, they are created and all files are opened.
    fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> std::result::Result<(Self, TorrentAlertReceiver), NewTorrentError>
    {
        if info.structure.is_archive() && info.download_dir.exists() {
            log::warn!("Download path {:?} exists", info.download_dir);
            return Err(NewTorrentError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "Download path already exists",
            )));
        }

        // Helper function for opening a file.
        let open_file = |info: FileInfo| {
            if let Some(parent) = info.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    log::info!("Creating torrent subdir {:?}", parent);
                    fs::create_dir_all(parent)
                        .map_err(NewTorrentError::Io)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&info.path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", &info.path);
                    NewTorrentError::Io(e)
                })?;
            Ok(Mutex::new(TorrentFile { info, handle }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "Torrent is single {} bytes long file {:?}",
                    file.len,
                    file.path
                );
                let file = FileInfo {
                    path: info.download_dir.join(&file.path),
                    torrent_offset: file.torrent_offset,
                    len: file.len,
                };
                vec![open_file(file)?]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("Torrent is multi file: {:?}", files);
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files.iter() {
                    let file = FileInfo {
                        path: info.download_dir.join(&file.path),
                        torrent_offset: file.torrent_offset,
                        len: file.len,
                    };
                    torrent_files.push(open_file(file)?);
                }
                torrent_files
            }
        };

        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        Ok((
            Self {
                info,
                alert_chan,
                pieces: HashMap::new(),
                files: Arc::new(files),
                piece_hashes,
                stats: Stats::default(),
            },
            alert_port,
        ))
    }

    async fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving block {:?} to disk", info);

        let piece_index = info.piece_index;
        if !self.pieces.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(info) {
                self.alert_chan.send(TorrentAlert::BatchWrite(Err(e)))?;
                return Ok(());
            }
        }
        let piece = self
            .pieces
            .get_mut(&piece_index)
            .expect("newly inserted piece not present");

        piece.enqueue_block(info.offset, data);

        if piece.is_complete() {
            let piece = self.pieces.remove(&piece_index).unwrap();
            let piece_len = self.info.piece_len;
            let files = Arc::clone(&self.files);

            // don't block the reactor with the potentially expensive hashing
            // and sync file writing
            let write_result = task::spawn_blocking(move || {
                let is_piece_valid = piece.matches_hash();

                // the blocks list carries the piece index back to the
                // scheduler regardless of validity, so an invalid piece can
                // still be identified and requeued; only the actual file
                // write is gated on the hash check
                let blocks: Vec<BlockInfo> = piece
                    .blocks
                    .iter()
                    .map(|(offset, block)| BlockInfo {
                        piece_index,
                        offset: *offset,
                        len: block.len() as u32,
                    })
                    .collect();

                let write_count = if is_piece_valid {
                    log::info!("Piece {} is valid", piece_index);
                    let piece_torrent_offset =
                        piece_index as u64 * piece_len as u64;
                    Some(piece.write(piece_torrent_offset, &files)?)
                } else {
                    log::warn!("Piece {} is NOT valid", piece_index);
                    None
                };

                Ok::<_, WriteError>((is_piece_valid, write_count, blocks))
            })
            .await
            .expect("disk IO write task panicked");

            match write_result {
                Ok((is_piece_valid, write_count, blocks)) => {
                    if is_piece_valid {
                        if let Some(write_count) = write_count {
                            self.stats.write_count += write_count as u64;
                        }
                    }

                    self.alert_chan.send(TorrentAlert::BatchWrite(Ok(
                        BatchWrite {
                            blocks,
                            is_piece_valid: Some(is_piece_valid),
                        },
                    )))?;
                }
                Err(e) => {
                    log::warn!("Disk write error: {}", e);
                    self.stats.write_failure_count += 1;
                    self.alert_chan.send(TorrentAlert::BatchWrite(Err(e)))?;
                }
            }
        }

        Ok(())
    }

    /// Reads a block's bytes back from already-downloaded pieces, to serve an
    /// upload request. Unlike writes, this is never buffered in memory: it
    /// always goes straight to the file(s) the block is located in.
    fn read_block(
        &self,
        info: BlockInfo,
    ) -> std::result::Result<Vec<u8>, ReadError> {
        let piece_len = self
            .info
            .piece_len(info.piece_index)
            .map_err(|_| ReadError::InvalidPieceIndex)?;
        if info.offset + info.len > piece_len {
            return Err(ReadError::InvalidPieceIndex);
        }

        let torrent_offset =
            info.piece_index as u64 * self.info.piece_len as u64
                + info.offset as u64;
        let byte_range = torrent_offset..torrent_offset + info.len as u64;
        let file_range = self.info.structure.files_intersecting_bytes(byte_range);

        let mut buf = vec![0; info.len as usize];
        let mut written = 0usize;
        for file in &self.files[file_range] {
            let file = file.lock().unwrap();
            let slice = file.info.get_slice(
                torrent_offset + written as u64,
                info.len as u64 - written as u64,
            );
            let dst = &mut buf[written..written + slice.len as usize];
            file.handle
                .read_exact_at(dst, slice.offset)
                .map_err(ReadError::Io)?;
            written += slice.len as usize;
        }

        Ok(buf)
    }

    /// Starts a new in-progress piece, creating metadata for it in self.
    ///
    /// This involves getting the expected hash of the piece, its length, and
    /// calculating the files that it intersects.
    fn start_new_piece(
        &mut self,
        info: BlockInfo,
    ) -> std::result::Result<(), WriteError> {
        log::trace!("Creating piece {} write buffer", info.piece_index);

        let hash_pos = info.piece_index * 20;
        if hash_pos + 20 > self.piece_hashes.len() {
            log::warn!("Piece index {} is invalid", info.piece_index);
            return Err(WriteError::InvalidPieceIndex);
        }

        let hash_slice = &self.piece_hashes[hash_pos..hash_pos + 20];
        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(hash_slice);
        log::debug!(
            "Piece {} expected hash {}",
            info.piece_index,
            hex::encode(&expected_hash)
        );

        let len = self
            .info
            .piece_len(info.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} is {} bytes long", info.piece_index, len);

        let files = self
            .info
            .files_intersecting_piece(info.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} intersects files: {:?}", info.piece_index, files);

        let piece = Piece {
            expected_hash,
            len,
            blocks: BTreeMap::new(),
            files,
        };
        self.pieces.insert(info.piece_index, piece);

        Ok(())
    }
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    fn write_vectored_at<'a>(
        &self,
        iovecs: &mut IoVecs<'a>,
        offset: u64,
    ) -> std::result::Result<usize, WriteError> {
        let mut total_write_count = 0;
        while !iovecs.is_empty() {
            let slices = iovecs.buffers();
            let write_count =
                pwritev(self.handle.as_fd(), &slices, offset as i64).map_err(
                    |e| {
                        log::warn!(
                            "File {:?} write error: {}",
                            self.info.path,
                            e
                        );
                        WriteError::Io(std::io::Error::from(e))
                    },
                )?;
            iovecs.advance(write_count);
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }
}

#[derive(Default)]
struct Stats {
    write_count: u64,
    write_failure_count: usize,
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
struct Piece {
    expected_hash: Sha1Hash,
    len: u32,
    /// The so far downloaded blocks, keyed by their offset in piece. A
    /// `BTreeMap` keeps the keys sorted, which matters when iterating over
    /// the map to hash each block one after another.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// The files that this piece overlaps with: a left-inclusive range of
    /// file indices into `Torrent::files`.
    files: Range<FileIndex>,
}

impl Piece {
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Calculates the piece's hash using all its blocks and returns if it
    /// matches the expected hash.
    ///
    /// # Important
    ///
    /// This is a long running function and should be executed on a thread pool
    /// and not the executor.
    fn matches_hash(&self) -> bool {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.update(block);
        }
        let hash = hasher.finalize();
        log::debug!("Piece hash: {:x}", hash);
        hash.as_slice() == self.expected_hash
    }

    /// Writes the piece's blocks to the files the piece overlaps with.
    ///
    /// # Important
    ///
    /// This performs sync IO and is thus potentially blocking and should be
    /// executed on a thread pool and not the executor.
    fn write(
        &self,
        piece_torrent_offset: u64,
        files: &[Mutex<TorrentFile>],
    ) -> std::result::Result<usize, WriteError> {
        let mut total_write_count = 0;

        let mut bufs: Vec<IoVec> = self
            .blocks
            .values()
            .map(|b| IoVec::from_slice(b))
            .collect();

        let mut write_torrent_offset = piece_torrent_offset;
        let files = &files[self.files.clone()];
        debug_assert!(!files.is_empty());

        if files.len() == 1 {
            let file = files.first().unwrap().lock().unwrap();
            let slice =
                file.info.get_slice(write_torrent_offset, self.len as u64);
            let mut iovecs = IoVecs::unbounded(&bufs);
            total_write_count +=
                file.write_vectored_at(&mut iovecs, slice.offset)?;
            bufs = iovecs.into_tail();
        } else {
            for file in files.iter() {
                let file = file.lock().unwrap();
                let slice =
                    file.info.get_slice(write_torrent_offset, self.len as u64);
                debug_assert!(slice.len > 0);
                debug_assert!(!bufs.is_empty());

                let mut iovecs = IoVecs::bounded(&bufs, slice.len);
                let write_count =
                    file.write_vectored_at(&mut iovecs, slice.offset)?;
                bufs = iovecs.into_tail();

                write_torrent_offset += write_count as u64;
                total_write_count += write_count;
            }
        }

        debug_assert!(bufs.is_empty());

        Ok(total_write_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::MetainfoParser;

    fn single_file_metainfo_bytes(
        name: &str,
        piece_len: u64,
        data: &[u8],
    ) -> (Vec<u8>, Vec<u8>) {
        let piece_count = (data.len() as u64 + piece_len - 1) / piece_len;
        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_len as usize) {
            let digest = Sha1::digest(chunk);
            pieces.extend_from_slice(&digest);
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod6:lengthi");
        buf.extend_from_slice(data.len().to_string().as_bytes());
        buf.extend_from_slice(b"e4:name");
        buf.extend_from_slice(name.len().to_string().as_bytes());
        buf.push(b':');
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b"12:piece lengthi");
        buf.extend_from_slice(piece_len.to_string().as_bytes());
        buf.extend_from_slice(b"e6:pieces");
        buf.extend_from_slice(pieces.len().to_string().as_bytes());
        buf.push(b':');
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");
        debug_assert_eq!(piece_count as usize, pieces.len() / 20);
        (buf, pieces)
    }

    #[tokio::test]
    async fn test_write_then_read_back_single_file_piece() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789abcdef0123456789ABCDEF".to_vec();
        let piece_len = 16u64;
        let (metainfo_bytes, _) =
            single_file_metainfo_bytes("f.bin", piece_len, &data);
        let metainfo = MetainfoParser::parse(&metainfo_bytes).unwrap();
        let storage_info =
            StorageInfo::new(&metainfo, dir.path().to_path_buf());
        let piece_hashes: Vec<u8> =
            metainfo.piece_hashes.iter().flatten().copied().collect();

        let (mut torrent, _alert_port) =
            Torrent::new(storage_info, piece_hashes).unwrap();

        let piece0 = &data[0..16];
        torrent
            .write_block(
                BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: 16,
                },
                piece0.to_vec(),
            )
            .await
            .unwrap();

        let read_back = torrent
            .read_block(BlockInfo {
                piece_index: 0,
                offset: 0,
                len: 16,
            })
            .unwrap();
        assert_eq!(read_back, piece0);
    }

    #[tokio::test]
    async fn test_invalid_piece_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0u8; 16];
        let piece_len = 16u64;
        let (metainfo_bytes, _) =
            single_file_metainfo_bytes("f.bin", piece_len, &data);
        let metainfo = MetainfoParser::parse(&metainfo_bytes).unwrap();
        let storage_info =
            StorageInfo::new(&metainfo, dir.path().to_path_buf());
        // corrupt the expected hash so the piece is rejected
        let piece_hashes = vec![0xffu8; 20];

        let (mut torrent, mut alert_port) =
            Torrent::new(storage_info, piece_hashes).unwrap();

        torrent
            .write_block(
                BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: 16,
                },
                data,
            )
            .await
            .unwrap();

        match alert_port.recv().await {
            Some(TorrentAlert::BatchWrite(Ok(batch))) => {
                assert_eq!(batch.is_piece_valid, Some(false));
            }
            _ => panic!("expected a batch write alert"),
        }
    }
}
