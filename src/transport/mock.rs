//! In-memory transports for tests and offline runs.
//!
//! `MockSource` plays back a scripted sequence of blocks; `MockSink` records
//! everything written to it and can be told to misbehave (short writes) to
//! exercise the fatal-output path.

use crate::error::{AppResult, TriggerError};
use crate::state::DumpState;
use crate::transport::{AcquiredBlock, BlockSink, BlockSource};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// Scripted block source.
///
/// Blocks are handed out in order; once the script is exhausted an empty
/// block is returned, which the drain loop treats as the terminal short
/// read. A trigger can be injected deterministically before a given block
/// is acquired, standing in for a control command that raced the stream.
pub struct MockSource {
    header: Bytes,
    blocks: VecDeque<Bytes>,
    fill: f32,
    acquire_delay: Option<Duration>,
    triggers: Vec<(u64, u64)>,
    state: Option<Arc<DumpState>>,
    next_seq: u64,
}

impl MockSource {
    pub fn new(header: impl Into<Bytes>, blocks: Vec<Bytes>) -> Self {
        Self {
            header: header.into(),
            blocks: blocks.into(),
            fill: 1.0,
            acquire_delay: None,
            triggers: Vec::new(),
            state: None,
            next_seq: 0,
        }
    }

    /// Report a fixed fill level instead of the default 1.0.
    pub fn with_fill_level(mut self, fill: f32) -> Self {
        self.fill = fill;
        self
    }

    /// Sleep before every acquisition, simulating a producer at line rate.
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = Some(delay);
        self
    }

    /// Arm `target` on `state` just before block `seq` is acquired.
    pub fn with_trigger(mut self, seq: u64, target: u64, state: Arc<DumpState>) -> Self {
        self.triggers.push((seq, target));
        self.state = Some(state);
        self
    }
}

#[async_trait]
impl BlockSource for MockSource {
    async fn read_header(&mut self) -> AppResult<Bytes> {
        Ok(self.header.clone())
    }

    async fn acquire_block(&mut self) -> AppResult<AcquiredBlock> {
        if let Some(delay) = self.acquire_delay {
            sleep(delay).await;
        }
        let seq = self.next_seq;
        if let Some(state) = &self.state {
            for &(at, target) in &self.triggers {
                if at == seq {
                    // A rejected injection mirrors a rejected command: the
                    // armed target stays.
                    let _ = state.try_arm(target);
                }
            }
        }
        self.next_seq += 1;
        let data = self.blocks.pop_front().unwrap_or_default();
        Ok(AcquiredBlock { seq, data })
    }

    fn release_block(&mut self, _block: AcquiredBlock) -> AppResult<()> {
        Ok(())
    }

    fn fill_level(&self) -> f32 {
        self.fill
    }

    fn end_of_stream(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[derive(Default)]
struct MockSinkInner {
    header: Option<Bytes>,
    blocks: Vec<Bytes>,
    short_write_at: Option<usize>,
}

/// Recording block sink.
pub struct MockSink {
    inner: Arc<Mutex<MockSinkInner>>,
}

/// Inspection handle for a [`MockSink`] that has been moved into a drain
/// loop.
#[derive(Clone)]
pub struct MockSinkHandle {
    inner: Arc<Mutex<MockSinkInner>>,
}

impl MockSink {
    pub fn new() -> (Self, MockSinkHandle) {
        let inner = Arc::new(Mutex::new(MockSinkInner::default()));
        (
            Self {
                inner: Arc::clone(&inner),
            },
            MockSinkHandle { inner },
        )
    }

    /// Report a truncated count for the `index`-th block write.
    pub fn short_write_at(self, index: usize) -> Self {
        self.inner
            .lock()
            .expect("mock sink lock poisoned")
            .short_write_at = Some(index);
        self
    }
}

impl MockSinkHandle {
    pub fn header(&self) -> Option<Bytes> {
        self.inner
            .lock()
            .expect("mock sink lock poisoned")
            .header
            .clone()
    }

    pub fn blocks(&self) -> Vec<Bytes> {
        self.inner
            .lock()
            .expect("mock sink lock poisoned")
            .blocks
            .clone()
    }
}

#[async_trait]
impl BlockSink for MockSink {
    async fn write_header(&mut self, header: &[u8]) -> AppResult<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| TriggerError::Transport("mock sink lock poisoned".into()))?;
        inner.header = Some(Bytes::copy_from_slice(header));
        Ok(())
    }

    async fn write_block(&mut self, data: &[u8]) -> AppResult<u64> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| TriggerError::Transport("mock sink lock poisoned".into()))?;
        let index = inner.blocks.len();
        if inner.short_write_at == Some(index) {
            return Ok(data.len() as u64 / 2);
        }
        inner.blocks.push(Bytes::copy_from_slice(data));
        Ok(data.len() as u64)
    }
}
