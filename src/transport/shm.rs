#![allow(unsafe_code)]
//! Memory-mapped shared-memory block ring.
//!
//! This is the transport between the upstream producer, the drain loop, and
//! the downstream storage consumer: a fixed set of `n_blocks` slots of
//! `block_size` bytes each, backed by a memory-mapped file (typically in
//! `/dev/shm`), plus a small text-header region for the one-shot header
//! handshake.
//!
//! # Layout
//!
//! ```text
//! +------------------+----------------------+--------------------------+
//! | RingHeader (128) | text header (4 KiB)  | n_blocks * block_size    |
//! +------------------+----------------------+--------------------------+
//! ```
//!
//! `head` counts blocks published by the producer, `tail` blocks released by
//! the consumer; both are monotonic, and `head % n_blocks` selects the slot.
//! The producer marks end-of-stream by publishing a final block shorter than
//! `block_size` (possibly after only full blocks, via [`ShmBlockRing::finish`],
//! in which case the consumer synthesizes an empty terminal block).
//!
//! # Process model
//!
//! One producer and one consumer, each holding its own mapping of the same
//! file. All producer/consumer methods take `&mut self`, so exclusivity
//! within a process is compiler-enforced; across processes the atomic
//! head/tail counters in the shared header carry the synchronization.

use crate::error::{AppResult, TriggerError};
use crate::transport::{AcquiredBlock, BlockSink, BlockSource};
use async_trait::async_trait;
use bytes::Bytes;
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// Magic number for ring validation ("TRIGDUMP").
const MAGIC: u64 = 0x5452_4947_4455_4D50;

/// Size of the ring header in bytes (two cache lines).
const RING_HEADER_SIZE: usize = 128;

/// Size of the text-header region in bytes.
const TEXT_HEADER_REGION: usize = 4096;

/// Sentinel for "end of stream not yet known".
const EOF_UNSET: u64 = u64::MAX;

/// Poll cadence while waiting on a slot or the text header.
const SLOT_POLL: Duration = Duration::from_millis(2);

/// Shared ring header.
///
/// `#[repr(C)]` keeps the layout identical across the producer and consumer
/// mappings of the same file.
///
/// Layout (128 bytes total):
/// - magic: u64
/// - block_size: u64
/// - n_blocks: u64
/// - head: AtomicU64 (blocks published, monotonic)
/// - tail: AtomicU64 (blocks released, monotonic)
/// - header_len: AtomicU64 (text header bytes, 0 until written)
/// - eof_blocks: AtomicU64 (total blocks in stream, EOF_UNSET until known)
/// - final_len: AtomicU64 (valid bytes in the last block)
/// - _padding: [u8; 64]
#[repr(C)]
struct RingHeader {
    magic: u64,
    block_size: u64,
    n_blocks: u64,
    head: AtomicU64,
    tail: AtomicU64,
    header_len: AtomicU64,
    eof_blocks: AtomicU64,
    final_len: AtomicU64,
    _padding: [u8; 64],
}

const _: () = assert!(
    std::mem::size_of::<RingHeader>() == RING_HEADER_SIZE,
    "RingHeader size must equal RING_HEADER_SIZE (128 bytes)"
);

/// One side of a shared-memory block ring.
///
/// Producer methods ([`write_text_header`](Self::write_text_header),
/// [`write_block`](Self::write_block), [`finish`](Self::finish)) and
/// consumer methods (the [`BlockSource`] impl) live on the same type; a
/// process uses whichever side it plays.
pub struct ShmBlockRing {
    path: PathBuf,

    /// Keeps the mapping alive; all pointers below point into it.
    #[expect(
        dead_code,
        reason = "mmap must be kept alive to maintain memory mapping validity"
    )]
    mmap: MmapMut,

    /// SAFETY: points to the start of mmap, valid as long as mmap exists.
    header: *mut RingHeader,

    /// SAFETY: points RING_HEADER_SIZE bytes into mmap.
    text_ptr: *mut u8,

    /// SAFETY: points RING_HEADER_SIZE + TEXT_HEADER_REGION bytes into mmap.
    data_ptr: *mut u8,

    block_size: u64,
    n_blocks: u64,

    /// Next block index this consumer will acquire.
    next_seq: u64,
}

impl std::fmt::Debug for ShmBlockRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmBlockRing")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("n_blocks", &self.n_blocks)
            .field("head", &self.head())
            .field("tail", &self.tail())
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

// SAFETY: ShmBlockRing owns its mmap and only exposes raw pointers
// internally. All dereferences are bounds-checked against the geometry read
// from the validated header, so the value can move to another thread.
unsafe impl Send for ShmBlockRing {}

// SAFETY: shared access only reads the atomic header fields with Acquire
// ordering; slot data is touched exclusively through &mut self methods.
unsafe impl Sync for ShmBlockRing {}

impl ShmBlockRing {
    /// Create a fresh ring backed by `path`, discarding any previous content.
    pub fn create(path: &Path, block_size: u64, n_blocks: u32) -> AppResult<Self> {
        if block_size == 0 || n_blocks < 2 {
            return Err(TriggerError::Transport(format!(
                "invalid ring geometry: {} blocks of {} bytes",
                n_blocks, block_size
            )));
        }
        let total = Self::total_size(block_size, n_blocks as u64);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total as u64)?;

        // SAFETY: the file was just created and sized, so mapping it is safe.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        debug_assert!(mmap.len() >= total, "mmap shorter than requested size");

        // SAFETY: mmap is at least RING_HEADER_SIZE bytes.
        let header = mmap.as_mut_ptr() as *mut RingHeader;
        unsafe {
            (*header).magic = MAGIC;
            (*header).block_size = block_size;
            (*header).n_blocks = n_blocks as u64;
            (*header).head = AtomicU64::new(0);
            (*header).tail = AtomicU64::new(0);
            (*header).header_len = AtomicU64::new(0);
            (*header).eof_blocks = AtomicU64::new(EOF_UNSET);
            (*header).final_len = AtomicU64::new(0);
            (*header)._padding.fill(0);
        }

        Ok(Self::from_parts(path, mmap, header, block_size, n_blocks as u64))
    }

    /// Attach to an existing ring created by [`create`](Self::create),
    /// possibly by another process.
    pub fn open(path: &Path) -> AppResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: mapping a file this process can read and write.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        if mmap.len() < RING_HEADER_SIZE {
            return Err(TriggerError::Transport(format!(
                "ring file {:?} too small for header",
                path
            )));
        }

        let header = mmap.as_mut_ptr() as *mut RingHeader;
        // SAFETY: mmap is at least RING_HEADER_SIZE bytes, just checked.
        let (magic, block_size, n_blocks) =
            unsafe { ((*header).magic, (*header).block_size, (*header).n_blocks) };

        if magic != MAGIC {
            return Err(TriggerError::Transport(format!(
                "invalid ring magic in {:?}: expected 0x{:016X}, got 0x{:016X}",
                path, MAGIC, magic
            )));
        }
        let total = Self::total_size(block_size, n_blocks);
        if mmap.len() < total {
            return Err(TriggerError::Transport(format!(
                "ring file {:?} shorter ({}) than its declared geometry ({})",
                path,
                mmap.len(),
                total
            )));
        }

        Ok(Self::from_parts(path, mmap, header, block_size, n_blocks))
    }

    fn from_parts(
        path: &Path,
        mut mmap: MmapMut,
        header: *mut RingHeader,
        block_size: u64,
        n_blocks: u64,
    ) -> Self {
        // SAFETY: mmap covers the full layout, validated by the callers.
        let text_ptr = unsafe { mmap.as_mut_ptr().add(RING_HEADER_SIZE) };
        let data_ptr = unsafe { mmap.as_mut_ptr().add(RING_HEADER_SIZE + TEXT_HEADER_REGION) };
        Self {
            path: path.to_path_buf(),
            mmap,
            header,
            text_ptr,
            data_ptr,
            block_size,
            n_blocks,
            next_seq: 0,
        }
    }

    fn total_size(block_size: u64, n_blocks: u64) -> usize {
        RING_HEADER_SIZE + TEXT_HEADER_REGION + (block_size * n_blocks) as usize
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn n_blocks(&self) -> u64 {
        self.n_blocks
    }

    fn head(&self) -> u64 {
        // SAFETY: header is valid for the lifetime of self.
        unsafe { (*self.header).head.load(Ordering::Acquire) }
    }

    fn tail(&self) -> u64 {
        // SAFETY: header is valid for the lifetime of self.
        unsafe { (*self.header).tail.load(Ordering::Acquire) }
    }

    fn eof_blocks(&self) -> u64 {
        // SAFETY: header is valid for the lifetime of self.
        unsafe { (*self.header).eof_blocks.load(Ordering::Acquire) }
    }

    /// Occupied fraction of the ring, `0.0` when empty.
    pub fn occupancy(&self) -> f32 {
        let head = self.head();
        let tail = self.tail();
        (head.saturating_sub(tail)) as f32 / self.n_blocks as f32
    }

    // --- producer side -----------------------------------------------------

    /// Publish the stream's text header. Must happen before the first block.
    pub fn write_text_header(&mut self, header: &[u8]) -> AppResult<()> {
        if header.len() > TEXT_HEADER_REGION {
            return Err(TriggerError::Header(format!(
                "text header of {} bytes exceeds the {} byte region",
                header.len(),
                TEXT_HEADER_REGION
            )));
        }
        // SAFETY: text_ptr addresses TEXT_HEADER_REGION bytes and header fits.
        unsafe {
            std::ptr::copy_nonoverlapping(header.as_ptr(), self.text_ptr, header.len());
            (*self.header)
                .header_len
                .store(header.len() as u64, Ordering::Release);
        }
        Ok(())
    }

    /// Publish one block, waiting for a free slot if the ring is full.
    ///
    /// A block shorter than `block_size` marks the end of the stream.
    pub async fn write_block(&mut self, data: &[u8]) -> AppResult<u64> {
        if data.len() as u64 > self.block_size {
            return Err(TriggerError::Transport(format!(
                "block of {} bytes exceeds ring block size {}",
                data.len(),
                self.block_size
            )));
        }
        loop {
            if self.try_write_block(data) {
                return Ok(data.len() as u64);
            }
            sleep(SLOT_POLL).await;
        }
    }

    fn try_write_block(&mut self, data: &[u8]) -> bool {
        let head = self.head();
        let tail = self.tail();
        if head - tail >= self.n_blocks {
            return false;
        }

        let slot = (head % self.n_blocks) as usize;
        let offset = slot * self.block_size as usize;
        // SAFETY: slot < n_blocks, data.len() <= block_size, so the write
        // stays inside the data region.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.data_ptr.add(offset),
                data.len(),
            );
            if (data.len() as u64) < self.block_size {
                // Short block ends the stream. Both stores must be visible
                // before the head publish below.
                (*self.header)
                    .final_len
                    .store(data.len() as u64, Ordering::Relaxed);
                (*self.header)
                    .eof_blocks
                    .store(head + 1, Ordering::Release);
            }
            (*self.header).head.fetch_add(1, Ordering::Release);
        }
        true
    }

    /// Mark the stream complete after a run of full blocks. The consumer
    /// observes an empty terminal block.
    pub fn finish(&mut self) {
        // SAFETY: header is valid for the lifetime of self.
        unsafe {
            let head = (*self.header).head.load(Ordering::Acquire);
            // The last published block is a full one.
            (*self.header)
                .final_len
                .store(self.block_size, Ordering::Relaxed);
            (*self.header).eof_blocks.store(head, Ordering::Release);
        }
    }

    // --- consumer side -----------------------------------------------------

    fn try_read_text_header(&self) -> Option<Bytes> {
        // SAFETY: header is valid for the lifetime of self.
        let len = unsafe { (*self.header).header_len.load(Ordering::Acquire) };
        if len == 0 {
            return None;
        }
        // SAFETY: header_len was bounds-checked by the writer.
        let slice = unsafe { std::slice::from_raw_parts(self.text_ptr, len as usize) };
        Some(Bytes::copy_from_slice(slice))
    }

    fn try_acquire_block(&mut self) -> Option<AcquiredBlock> {
        // Head before eof: a consumer that observes a published short block
        // is guaranteed to observe its final length too.
        let head = self.head();
        let eof = self.eof_blocks();

        if eof != EOF_UNSET && self.next_seq >= eof {
            // Stream complete with only full blocks: synthesize the
            // terminal short read.
            let seq = self.next_seq;
            self.next_seq += 1;
            return Some(AcquiredBlock {
                seq,
                data: Bytes::new(),
            });
        }

        if head <= self.next_seq {
            return None;
        }

        let seq = self.next_seq;
        let len = if eof != EOF_UNSET && seq + 1 == eof {
            // SAFETY: header is valid for the lifetime of self.
            unsafe { (*self.header).final_len.load(Ordering::Relaxed) }
        } else {
            self.block_size
        };

        let slot = (seq % self.n_blocks) as usize;
        let offset = slot * self.block_size as usize;
        // SAFETY: slot < n_blocks and len <= block_size, so the read stays
        // inside the data region; the producer published this slot before
        // advancing head.
        let slice = unsafe { std::slice::from_raw_parts(self.data_ptr.add(offset), len as usize) };
        let data = Bytes::copy_from_slice(slice);

        self.next_seq += 1;
        Some(AcquiredBlock { seq, data })
    }
}

#[async_trait]
impl BlockSource for ShmBlockRing {
    async fn read_header(&mut self) -> AppResult<Bytes> {
        loop {
            if let Some(header) = self.try_read_text_header() {
                return Ok(header);
            }
            sleep(SLOT_POLL).await;
        }
    }

    async fn acquire_block(&mut self) -> AppResult<AcquiredBlock> {
        loop {
            if let Some(block) = self.try_acquire_block() {
                return Ok(block);
            }
            sleep(SLOT_POLL).await;
        }
    }

    fn release_block(&mut self, block: AcquiredBlock) -> AppResult<()> {
        let eof = self.eof_blocks();
        if eof != EOF_UNSET && block.seq >= eof {
            // Synthesized terminal block; no slot to free.
            return Ok(());
        }
        // SAFETY: header is valid for the lifetime of self.
        unsafe {
            (*self.header).tail.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    fn fill_level(&self) -> f32 {
        self.occupancy()
    }

    fn end_of_stream(&self) -> bool {
        self.eof_blocks() != EOF_UNSET
    }
}

#[async_trait]
impl BlockSink for ShmBlockRing {
    async fn write_header(&mut self, header: &[u8]) -> AppResult<()> {
        self.write_text_header(header)
    }

    async fn write_block(&mut self, data: &[u8]) -> AppResult<u64> {
        ShmBlockRing::write_block(self, data).await
    }
}
