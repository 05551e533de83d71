//! Transport seams between the upstream block producer and downstream
//! storage.
//!
//! The drain loop is written against these traits so the same matching logic
//! runs over the shared-memory rings in production ([`shm`]) and the
//! in-memory transports in tests ([`mock`]).

pub mod mock;
pub mod shm;

use crate::error::AppResult;
use async_trait::async_trait;
use bytes::Bytes;

/// One block checked out from a [`BlockSource`].
///
/// `data` holds the bytes actually available; a length shorter than the
/// stream's block size marks the end of the stream.
#[derive(Debug, Clone)]
pub struct AcquiredBlock {
    /// Sequential block index within the stream, starting at 0.
    pub seq: u64,
    pub data: Bytes,
}

/// Sequential supplier of fixed-size blocks.
#[async_trait]
pub trait BlockSource: Send {
    /// Read the stream header. Called once, before any block.
    async fn read_header(&mut self) -> AppResult<Bytes>;

    /// Block until the next sequential block is available.
    async fn acquire_block(&mut self) -> AppResult<AcquiredBlock>;

    /// Return a block to the transport, freeing its slot.
    fn release_block(&mut self, block: AcquiredBlock) -> AppResult<()>;

    /// Fraction of transport capacity currently occupied, in `[0, 1]`.
    fn fill_level(&self) -> f32;

    /// True once the producer has marked the stream complete.
    fn end_of_stream(&self) -> bool;
}

/// Consumer of whole-block writes.
#[async_trait]
pub trait BlockSink: Send {
    /// Write the stream header. Called once, before any block.
    async fn write_header(&mut self, header: &[u8]) -> AppResult<()>;

    /// Write one block, returning the bytes actually written. The transport
    /// contract is full-or-fail; a short count signals an unrecoverable
    /// output channel.
    async fn write_block(&mut self, data: &[u8]) -> AppResult<u64>;
}
