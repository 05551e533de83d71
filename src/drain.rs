//! Drain loop: sequential block consumption and trigger matching.
//!
//! The loop pulls blocks from the input transport in strict order, gates on
//! ring occupancy, evaluates the pending trigger against the current
//! sequence position, and forwards matched blocks whole to the output sink.
//! A trigger target can fall anywhere inside a block, so serving it takes
//! the block containing the target (case A) plus the following block once
//! the counter has passed the target (case B). Targets the stream has
//! already left behind are dropped (case C).

use crate::config::UNIT_BYTES;
use crate::error::{AppResult, TriggerError};
use crate::state::DumpState;
use crate::transport::{AcquiredBlock, BlockSink, BlockSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Cadence of the fill-level poll.
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Counters reported when the drain loop finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    /// Blocks consumed from the input stream, terminal short block included.
    pub blocks_drained: u64,
    /// Sequence position after the final advance.
    pub final_position: u64,
}

pub struct DrainLoop<S, K> {
    source: S,
    sink: K,
    state: Arc<DumpState>,
    block_size: u64,
    units_per_block: u64,
    fill_threshold: f32,
    current: u64,
    blocks_drained: u64,
}

impl<S: BlockSource, K: BlockSink> DrainLoop<S, K> {
    pub fn new(
        source: S,
        sink: K,
        state: Arc<DumpState>,
        block_size: u64,
        fill_threshold: f32,
    ) -> Self {
        Self {
            source,
            sink,
            state,
            block_size,
            units_per_block: block_size / UNIT_BYTES,
            fill_threshold,
            current: 0,
            blocks_drained: 0,
        }
    }

    /// Consume the input stream to exhaustion.
    ///
    /// Returns on the terminal short read; the only error out of steady
    /// state is a short write to the sink.
    pub async fn run(mut self) -> AppResult<DrainSummary> {
        info!(
            block_size = self.block_size,
            units_per_block = self.units_per_block,
            fill_threshold = self.fill_threshold,
            "drain loop starting"
        );

        loop {
            let block = self.source.acquire_block().await?;
            let complete = block.data.len() as u64 == self.block_size;

            if complete {
                self.wait_for_fill().await;
            }

            if self.state.pending() {
                self.match_pending(&block).await?;
            }

            // The position advances whether or not anything matched.
            self.current += self.units_per_block;
            self.blocks_drained += 1;

            self.source.release_block(block)?;

            if !complete {
                info!(
                    blocks = self.blocks_drained,
                    final_position = self.current,
                    "input stream ended with short block"
                );
                break;
            }
        }

        Ok(DrainSummary {
            blocks_drained: self.blocks_drained,
            final_position: self.current,
        })
    }

    /// Admission gate: do not consume a block while the producer is still
    /// filling nearby. Skipped once the stream is complete, where occupancy
    /// can no longer rise.
    async fn wait_for_fill(&self) {
        while self.source.fill_level() < self.fill_threshold && !self.source.end_of_stream() {
            sleep(FILL_POLL_INTERVAL).await;
        }
    }

    /// Evaluate the armed trigger against the block just acquired. The
    /// target is fixed for the whole pending window, so the three position
    /// ranges are disjoint and at most one case fires.
    async fn match_pending(&mut self, block: &AcquiredBlock) -> AppResult<()> {
        let target = self.state.target();
        let current = self.current;
        let units = self.units_per_block;

        if target > current && target < current + units {
            // Case A: the target lies inside this block. First half of the
            // pair; stay pending for the follow-up block.
            self.forward(block).await?;
            info!(target, current, seq = block.seq, "dump first block written");
        } else if target < current && current - target < units {
            // Case B: the target lies in the previous block. This block is
            // the second half; the dump is complete.
            self.forward(block).await?;
            self.state.complete_dump();
            info!(
                target,
                current,
                seq = block.seq,
                triggers = self.state.trigger_count(),
                dumps = self.state.dump_count(),
                "dump second block written"
            );
        } else if target + units <= current {
            // Case C: the window has fully passed.
            self.state.drop_late();
            warn!(target, current, "trigger arrived too late, dropping");
        }

        Ok(())
    }

    async fn forward(&mut self, block: &AcquiredBlock) -> AppResult<()> {
        let expected = block.data.len() as u64;
        let written = self.sink.write_block(&block.data).await?;
        if written < expected {
            return Err(TriggerError::ShortWrite { written, expected });
        }
        Ok(())
    }
}
