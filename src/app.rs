//! Observation lifecycle.
//!
//! `Observation` wires the pieces for one pass over an input stream: the
//! header handshake, the control listener task, and the drain loop. The
//! drain loop decides when the observation is over (stream exhaustion or a
//! fatal write); the listener is then shut down and joined, whatever the
//! drain outcome.

use crate::config::Settings;
use crate::control::ControlListener;
use crate::drain::DrainLoop;
use crate::error::AppResult;
use crate::state::DumpState;
use crate::transport::{BlockSink, BlockSource};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Final counters for a completed observation.
#[derive(Debug, Clone, Copy)]
pub struct CaptureOutcome {
    pub blocks_drained: u64,
    pub final_position: u64,
    pub triggers: u64,
    pub dumps: u64,
    pub advisory: u64,
}

pub struct Observation<S, K> {
    state: Arc<DumpState>,
    listener: ControlListener,
    shutdown_tx: watch::Sender<bool>,
    drain: DrainLoop<S, K>,
}

impl<S, K> Observation<S, K>
where
    S: BlockSource + 'static,
    K: BlockSink + 'static,
{
    /// Perform the setup phase: header handshake, control socket bind,
    /// drain loop construction. Any failure here aborts before steady
    /// state.
    pub async fn prepare(settings: &Settings, mut source: S, mut sink: K) -> AppResult<Self> {
        // Header first: the output stream must carry the input stream's
        // header verbatim before any data block.
        let header = source.read_header().await?;
        sink.write_header(&header).await?;
        info!(header_len = header.len(), "propagated stream header");

        let state = Arc::new(DumpState::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = ControlListener::bind(
            settings.listen_addr(),
            Arc::clone(&state),
            settings.command_scale(),
            shutdown_rx,
        )
        .await?;

        let drain = DrainLoop::new(
            source,
            sink,
            Arc::clone(&state),
            settings.capture.block_size,
            settings.capture.fill_threshold,
        );

        Ok(Self {
            state,
            listener,
            shutdown_tx,
            drain,
        })
    }

    /// Address of the bound control socket (relevant with port 0).
    pub fn control_addr(&self) -> AppResult<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared trigger state, mainly for inspection in tests.
    pub fn state(&self) -> Arc<DumpState> {
        Arc::clone(&self.state)
    }

    /// Run the observation to completion.
    pub async fn run(self) -> AppResult<CaptureOutcome> {
        let Self {
            state,
            listener,
            shutdown_tx,
            drain,
        } = self;

        let control_task = tokio::spawn(listener.run());
        let drain_result = drain.run().await;

        // Stop the listener whether the drain ended cleanly or not.
        let _ = shutdown_tx.send(true);
        match control_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(%err, "control listener failed"),
            Err(err) => error!(%err, "control listener task panicked"),
        }

        let summary = drain_result?;
        Ok(CaptureOutcome {
            blocks_drained: summary.blocks_drained,
            final_position: summary.final_position,
            triggers: state.trigger_count(),
            dumps: state.dump_count(),
            advisory: state.advisory(),
        })
    }
}
