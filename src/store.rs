//! Piece store: block buffers, verification, and file persistence.
//!
//! The store owns one [`PieceState`] per piece and the output file. Other
//! components never touch piece state directly; they go through the store
//! operations, which keeps the scheduling invariants in one place.
use crate::bitfield::BitField;
use crate::peer::message::BLOCK_LEN;
use crate::torrent::info_hash::sha1_digest;
use crate::torrent::TorrentMeta;
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Piece index {0} out of range")]
    UnknownPiece(u32),

    #[error("Block out of range: piece {index}, offset {offset}, length {len}")]
    BlockOutOfRange { index: u32, offset: u32, len: usize },

    #[error("Persisted piece {index} failed re-verification")]
    Corrupt { index: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of delivering one block to the store.
#[derive(Debug, PartialEq)]
pub enum PieceCompletion {
    /// Accepted; more blocks are still missing.
    Incomplete,
    /// All blocks arrived and the digest matched; the assembled piece is
    /// returned for persistence.
    Completed(Vec<u8>),
    /// Assembly or digest verification failed; the piece was reset and is
    /// idle again.
    Failed,
    /// The piece was already verified earlier; the block was dropped.
    AlreadyCompleted,
}

/// Mutable download state of a single piece.
#[derive(Debug)]
pub struct PieceState {
    index: u32,
    size: u32,
    expected_hash: [u8; 20],
    blocks: BTreeMap<u32, Vec<u8>>,
    blocks_received: u32,
    total_blocks: u32,
    requested: bool,
    completed: bool,
}

impl PieceState {
    fn new(index: u32, size: u32, expected_hash: [u8; 20]) -> Self {
        PieceState {
            index,
            size,
            expected_hash,
            blocks: BTreeMap::new(),
            blocks_received: 0,
            total_blocks: size.div_ceil(BLOCK_LEN),
            requested: false,
            completed: false,
        }
    }

    fn is_idle(&self) -> bool {
        !self.completed && !self.requested
    }

    /// Back to the initial idle state; block buffers are dropped.
    fn clear(&mut self) {
        self.blocks.clear();
        self.blocks_received = 0;
        self.requested = false;
    }

    /// Concatenates the buffered blocks in offset order, checking that
    /// they tile the piece exactly.
    fn assemble(&self) -> Option<Vec<u8>> {
        let mut assembled = Vec::with_capacity(self.size as usize);
        let mut expected_offset = 0u32;
        for (&offset, block) in &self.blocks {
            if offset != expected_offset {
                return None;
            }
            assembled.extend_from_slice(block);
            expected_offset = offset + block.len() as u32;
        }
        (assembled.len() == self.size as usize).then_some(assembled)
    }
}

/// Aggregate progress counters, for logging and announce stats.
#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    pub pieces_completed: usize,
    pub pieces_total: usize,
    pub bytes_completed: u64,
    pub bytes_total: u64,
}

/**
Owns every piece of the torrent and the backing file.

The file is created at startup under the output directory, named after the
torrent, and pre-truncated (sparse) to the torrent's total length; verified
pieces are written at `index * piece_length`.
*/
#[derive(Debug)]
pub struct PieceStore {
    pieces: Vec<PieceState>,
    piece_length: u64,
    file: File,
    path: PathBuf,
    completed_count: usize,
    completed_bytes: u64,
    total_bytes: u64,
}

impl PieceStore {
    pub async fn new(meta: &TorrentMeta, output_dir: &Path) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(output_dir).await?;
        let path = output_dir.join(&meta.file_name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(meta.total_length).await?;
        debug!(path = %path.display(), bytes = meta.total_length, "output file created");

        let pieces = meta
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(i, &hash)| PieceState::new(i as u32, meta.piece_size(i as u32), hash))
            .collect();

        Ok(PieceStore {
            pieces,
            piece_length: meta.piece_length,
            file,
            path,
            completed_count: 0,
            completed_bytes: 0,
            total_bytes: meta.total_length,
        })
    }

    /// Returns the lowest-indexed idle piece, marking it requested.
    pub fn next_sequential(&mut self) -> Option<(u32, u32)> {
        let piece = self.pieces.iter_mut().find(|p| p.is_idle())?;
        piece.requested = true;
        Some((piece.index, piece.size))
    }

    /**
    Rarest-first piece selection.

    Counts, for every idle piece, how many of the given peer bitfields
    advertise it and picks the piece with the smallest non-zero count,
    ties broken by the lowest index. Falls back to [`Self::next_sequential`]
    when no advertised idle piece exists. The returned piece is marked
    requested.
    */
    pub fn rarest(&mut self, bitfields: &HashMap<SocketAddr, BitField>) -> Option<(u32, u32)> {
        let mut best: Option<(usize, u32)> = None;
        for piece in self.pieces.iter().filter(|p| p.is_idle()) {
            let owners = bitfields
                .values()
                .filter(|b| b.has_piece(piece.index as usize))
                .count();
            if owners == 0 {
                continue;
            }
            if best.is_none_or(|(best_owners, _)| owners < best_owners) {
                best = Some((owners, piece.index));
            }
        }

        match best {
            Some((_, index)) => {
                let piece = &mut self.pieces[index as usize];
                piece.requested = true;
                Some((piece.index, piece.size))
            }
            None => self.next_sequential(),
        }
    }

    /**
    Delivers one received block.

    The block must lie inside the piece; delivery is idempotent per
    offset. Once every block is present the piece is assembled in offset
    order, its length and digest verified, and either returned as
    `Completed` or reset to idle as `Failed`.
    */
    pub fn add_block(
        &mut self,
        index: u32,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<PieceCompletion, StoreError> {
        let piece = self
            .pieces
            .get_mut(index as usize)
            .ok_or(StoreError::UnknownPiece(index))?;

        if piece.completed {
            return Ok(PieceCompletion::AlreadyCompleted);
        }
        if offset as u64 + data.len() as u64 > piece.size as u64 {
            return Err(StoreError::BlockOutOfRange {
                index,
                offset,
                len: data.len(),
            });
        }

        if !piece.blocks.contains_key(&offset) {
            piece.blocks.insert(offset, data);
            piece.blocks_received += 1;
        }
        if piece.blocks_received < piece.total_blocks {
            return Ok(PieceCompletion::Incomplete);
        }

        match piece.assemble() {
            Some(assembled) if sha1_digest(&assembled) == piece.expected_hash => {
                piece.completed = true;
                piece.requested = false;
                piece.blocks.clear();
                self.completed_count += 1;
                self.completed_bytes += piece.size as u64;
                Ok(PieceCompletion::Completed(assembled))
            }
            Some(_) => {
                warn!(piece = index, "piece digest mismatch, resetting");
                piece.clear();
                Ok(PieceCompletion::Failed)
            }
            None => {
                warn!(piece = index, "piece blocks are not contiguous, resetting");
                piece.clear();
                Ok(PieceCompletion::Failed)
            }
        }
    }

    /// Returns a non-completed piece to the idle state, dropping any
    /// partial blocks. Used on peer loss and request timeout.
    pub fn reset(&mut self, index: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            if !piece.completed {
                piece.clear();
            }
        }
    }

    /// Writes a verified piece at its absolute file offset.
    pub async fn persist(&mut self, index: u32, bytes: &[u8]) -> Result<(), StoreError> {
        if index as usize >= self.pieces.len() {
            return Err(StoreError::UnknownPiece(index));
        }
        let offset = index as u64 * self.piece_length;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(bytes).await?;
        Ok(())
    }

    /// Flushes and fsyncs the output file.
    pub async fn finalize(&mut self) -> Result<(), StoreError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        info!(path = %self.path.display(), "output file synced");
        Ok(())
    }

    /// Re-reads the whole file and re-checks every piece digest.
    pub async fn verify_file(&mut self) -> Result<(), StoreError> {
        self.file.seek(SeekFrom::Start(0)).await?;
        for piece in &self.pieces {
            let mut buf = vec![0u8; piece.size as usize];
            self.file.read_exact(&mut buf).await?;
            if sha1_digest(&buf) != piece.expected_hash {
                return Err(StoreError::Corrupt { index: piece.index });
            }
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count == self.pieces.len()
    }

    /// `(completed, total)` piece counts.
    pub fn progress(&self) -> (usize, usize) {
        (self.completed_count, self.pieces.len())
    }

    /// Bytes still missing, as reported to trackers as `left`.
    pub fn bytes_left(&self) -> u64 {
        self.total_bytes - self.completed_bytes
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            pieces_completed: self.completed_count,
            pieces_total: self.pieces.len(),
            bytes_completed: self.completed_bytes,
            bytes_total: self.total_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with_content(piece_length: u64, content: &[u8]) -> TorrentMeta {
        let piece_hashes = content
            .chunks(piece_length as usize)
            .map(sha1_digest)
            .collect::<Vec<_>>();
        TorrentMeta {
            info_hash: [0u8; 20],
            piece_hashes,
            piece_length,
            total_length: content.len() as u64,
            file_name: "out.bin".to_string(),
            announce_list: vec!["http://tracker.example/a".to_string()],
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn assembles_out_of_order_blocks_and_survives_corruption() {
        let content = patterned(49152);
        let meta = meta_with_content(49152, &content);
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::new(&meta, dir.path()).await.unwrap();

        // Blocks arrive out of order: offsets 32768, 0, 16384.
        let b = |off: usize| content[off..off + 16384].to_vec();
        assert_eq!(
            store.add_block(0, 32768, b(32768)).unwrap(),
            PieceCompletion::Incomplete
        );
        assert_eq!(
            store.add_block(0, 0, b(0)).unwrap(),
            PieceCompletion::Incomplete
        );
        match store.add_block(0, 16384, b(16384)).unwrap() {
            PieceCompletion::Completed(bytes) => assert_eq!(bytes, content),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(store.is_complete());

        // Further blocks for the finished piece are dropped silently.
        assert_eq!(
            store.add_block(0, 0, b(0)).unwrap(),
            PieceCompletion::AlreadyCompleted
        );
    }

    #[tokio::test]
    async fn corrupt_block_fails_and_redownload_succeeds() {
        let content = patterned(49152);
        let meta = meta_with_content(49152, &content);
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::new(&meta, dir.path()).await.unwrap();

        store.add_block(0, 0, content[..16384].to_vec()).unwrap();
        store
            .add_block(0, 16384, content[16384..32768].to_vec())
            .unwrap();
        assert_eq!(
            store.add_block(0, 32768, vec![0u8; 16384]).unwrap(),
            PieceCompletion::Failed
        );
        assert!(!store.is_complete());

        // The piece went back to idle and a clean retry completes it.
        assert_eq!(store.next_sequential(), Some((0, 49152)));
        store.add_block(0, 0, content[..16384].to_vec()).unwrap();
        store
            .add_block(0, 16384, content[16384..32768].to_vec())
            .unwrap();
        assert!(matches!(
            store.add_block(0, 32768, content[32768..].to_vec()).unwrap(),
            PieceCompletion::Completed(_)
        ));
    }

    #[tokio::test]
    async fn non_contiguous_blocks_fail_assembly() {
        let content = patterned(32768);
        let meta = meta_with_content(32768, &content);
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::new(&meta, dir.path()).await.unwrap();

        store.add_block(0, 0, content[..16384].to_vec()).unwrap();
        // Second block at a bogus offset still fits inside the piece.
        assert_eq!(
            store.add_block(0, 100, content[100..16484].to_vec()).unwrap(),
            PieceCompletion::Failed
        );
    }

    #[tokio::test]
    async fn rejects_blocks_past_the_piece_end() {
        let content = patterned(16384);
        let meta = meta_with_content(16384, &content);
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::new(&meta, dir.path()).await.unwrap();

        assert!(matches!(
            store.add_block(0, 16000, vec![0u8; 1000]).unwrap_err(),
            StoreError::BlockOutOfRange { .. }
        ));
        assert!(matches!(
            store.add_block(9, 0, vec![0u8; 8]).unwrap_err(),
            StoreError::UnknownPiece(9)
        ));
    }

    #[tokio::test]
    async fn sequential_selection_skips_requested_and_completed() {
        let content = patterned(40);
        let meta = meta_with_content(16, &content);
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::new(&meta, dir.path()).await.unwrap();

        assert_eq!(store.next_sequential(), Some((0, 16)));
        assert_eq!(store.next_sequential(), Some((1, 16)));
        assert_eq!(store.next_sequential(), Some((2, 8)));
        assert_eq!(store.next_sequential(), None);

        // A reset piece becomes assignable again.
        store.reset(1);
        assert_eq!(store.next_sequential(), Some((1, 16)));
    }

    #[tokio::test]
    async fn rarest_prefers_smallest_nonzero_owner_count() {
        let content = patterned(40);
        let meta = meta_with_content(16, &content);
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::new(&meta, dir.path()).await.unwrap();

        let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:1".parse().unwrap();
        let mut bitfields = HashMap::new();
        // Piece 0: two owners; piece 1: one owner; piece 2: none.
        bitfields.insert(a, BitField::from_bools(&[true, false, false]));
        bitfields.insert(b, BitField::from_bools(&[true, true, false]));

        assert_eq!(store.rarest(&bitfields), Some((1, 16)));
        assert_eq!(store.rarest(&bitfields), Some((0, 16)));
        // Only the unadvertised piece is left: sequential fallback.
        assert_eq!(store.rarest(&bitfields), Some((2, 8)));
        assert_eq!(store.rarest(&bitfields), None);
    }

    #[tokio::test]
    async fn rarest_breaks_ties_by_lowest_index() {
        let content = patterned(48);
        let meta = meta_with_content(16, &content);
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::new(&meta, dir.path()).await.unwrap();

        let a: SocketAddr = "10.0.0.1:1".parse().unwrap();
        let mut bitfields = HashMap::new();
        bitfields.insert(a, BitField::from_bools(&[true, true, true]));

        assert_eq!(store.rarest(&bitfields), Some((0, 16)));
        assert_eq!(store.rarest(&bitfields), Some((1, 16)));
    }

    #[tokio::test]
    async fn persists_pieces_at_their_offsets_and_verifies() {
        let content = patterned(40);
        let meta = meta_with_content(16, &content);
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::new(&meta, dir.path()).await.unwrap();

        // Persist pieces out of order; offsets are index * piece_length.
        store.persist(1, &content[16..32]).await.unwrap();
        store.persist(0, &content[..16]).await.unwrap();
        store.persist(2, &content[32..]).await.unwrap();
        store.finalize().await.unwrap();
        store.verify_file().await.unwrap();

        let on_disk = std::fs::read(store.path()).unwrap();
        assert_eq!(on_disk, content);

        // Corrupting a byte makes re-verification name the piece.
        let mut broken = on_disk;
        broken[20] ^= 0xff;
        std::fs::write(store.path(), &broken).unwrap();
        assert!(matches!(
            store.verify_file().await.unwrap_err(),
            StoreError::Corrupt { index: 1 }
        ));
    }

    #[tokio::test]
    async fn completion_clears_requested_flag() {
        let content = patterned(16);
        let meta = meta_with_content(16, &content);
        let dir = tempfile::tempdir().unwrap();
        let mut store = PieceStore::new(&meta, dir.path()).await.unwrap();

        assert_eq!(store.next_sequential(), Some((0, 16)));
        assert!(matches!(
            store.add_block(0, 0, content.clone()).unwrap(),
            PieceCompletion::Completed(_)
        ));
        // Completed pieces are never handed out again.
        assert_eq!(store.next_sequential(), None);
        assert_eq!(store.progress(), (1, 1));
        assert_eq!(store.bytes_left(), 0);
    }
}
