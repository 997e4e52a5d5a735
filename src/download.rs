//! Per-peer bookkeeping of an in-progress piece download: which blocks have
//! been requested and which have arrived.
//!
//! This is distinct from [`crate::disk::io::Piece`], which is the disk
//! task's write buffer for a piece's bytes; `PieceDownload` only tracks
//! bookkeeping on the `PeerSession` side and never holds block data itself
//! (blocks are forwarded to disk as they arrive).

use crate::{block_count, block_len, BlockInfo, PieceIndex};

/// Tracks which blocks of a single piece we've requested from a peer and
/// which we've received, so the session knows when the piece is done and
/// can detect a peer that never responds to a request.
pub(crate) struct PieceDownload {
    /// The index of the piece being downloaded.
    index: PieceIndex,
    /// The length of the piece, in bytes.
    len: u32,
    /// Whether the block at a given index in piece has already been
    /// requested from the peer (but not necessarily received yet).
    requested: Vec<bool>,
    /// Whether the block at a given index in piece has been received.
    received: Vec<bool>,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, len: u32) -> Self {
        Self {
            index,
            len,
            requested: vec![false; block_count(len)],
            received: vec![false; block_count(len)],
        }
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    /// Appends up to `count` not-yet-requested blocks to `blocks`, marking
    /// them as requested. Used to top up a peer's pipelined requests.
    pub fn pick_blocks(&mut self, count: usize, blocks: &mut Vec<BlockInfo>) {
        let mut picked = 0;
        for i in 0..self.requested.len() {
            if picked == count {
                break;
            }
            if self.requested[i] {
                continue;
            }
            self.requested[i] = true;
            blocks.push(BlockInfo {
                piece_index: self.index,
                offset: i as u32 * crate::BLOCK_LEN,
                len: block_len(self.len, i),
            });
            picked += 1;
        }
    }

    /// Records that the block at `info` has been received.
    ///
    /// # Panics
    ///
    /// Panics if `info` doesn't belong to this piece.
    pub fn received_block(&mut self, info: BlockInfo) {
        debug_assert_eq!(info.piece_index, self.index);
        let block_index = info.index_in_piece();
        self.requested[block_index] = true;
        self.received[block_index] = true;
    }

    /// Returns whether every block in the piece has been received.
    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|r| *r)
    }

    /// Marks the given blocks as not-yet-requested again, e.g. because the
    /// peer choked us and discarded our queued requests (BEP 3) before they
    /// were served. A no-op for any block already received. Blocks belonging
    /// to a different piece are ignored, since a choke can race with this
    /// piece having just completed and a new one being assigned.
    pub fn free_blocks(&mut self, blocks: &[BlockInfo]) {
        for block in blocks {
            if block.piece_index != self.index {
                continue;
            }
            let block_index = block.index_in_piece();
            if !self.received[block_index] {
                self.requested[block_index] = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;

    #[test]
    fn test_pick_and_receive_blocks() {
        let piece_len = BLOCK_LEN * 2 + 100;
        let mut download = PieceDownload::new(0, piece_len);

        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, BLOCK_LEN);

        for block in blocks {
            download.received_block(block);
        }
        assert!(!download.is_complete());

        let mut last = Vec::new();
        download.pick_blocks(10, &mut last);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].len, 100);
        download.received_block(last[0]);
        assert!(download.is_complete());
    }

    #[test]
    fn test_pick_blocks_stops_at_piece_boundary() {
        // piece length is an exact multiple of the block length, so the
        // pipelining backlog (5) never actually reaches 5 outstanding
        // requests for a piece that only has 4 blocks in it
        let piece_len = BLOCK_LEN * 4;
        let mut download = PieceDownload::new(0, piece_len);
        let mut blocks = Vec::new();
        download.pick_blocks(5, &mut blocks);
        assert_eq!(blocks.len(), 4);
    }

    // a choke must free up requested-but-unreceived blocks so they're picked
    // again after unchoke, instead of stalling the piece forever
    #[test]
    fn test_free_blocks_allows_blocks_to_be_repicked() {
        let piece_len = BLOCK_LEN * 2;
        let mut download = PieceDownload::new(0, piece_len);

        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        assert_eq!(blocks.len(), 2);

        let mut none_left = Vec::new();
        download.pick_blocks(2, &mut none_left);
        assert!(none_left.is_empty());

        download.free_blocks(&blocks);

        let mut repicked = Vec::new();
        download.pick_blocks(2, &mut repicked);
        assert_eq!(repicked.len(), 2);
    }

    #[test]
    fn test_free_blocks_skips_already_received() {
        let piece_len = BLOCK_LEN * 2;
        let mut download = PieceDownload::new(0, piece_len);

        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        download.received_block(blocks[0]);

        download.free_blocks(&blocks);

        let mut repicked = Vec::new();
        download.pick_blocks(2, &mut repicked);
        // only the not-yet-received block should be repickable
        assert_eq!(repicked.len(), 1);
        assert_eq!(repicked[0].offset, blocks[1].offset);
    }
}
