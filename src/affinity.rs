//! CPU core pinning.
//!
//! Latency-sensitive deployments pin the drain process to a dedicated core;
//! pinning happens once at startup, before the runtime spins up its workers.

use crate::error::{AppResult, TriggerError};
use tracing::info;

/// Pin the current process to `core_id`.
pub fn bind_to_core(core_id: usize) -> AppResult<()> {
    let cores = core_affinity::get_core_ids().ok_or(TriggerError::Affinity(core_id))?;
    let core = cores
        .into_iter()
        .find(|c| c.id == core_id)
        .ok_or(TriggerError::Affinity(core_id))?;
    if !core_affinity::set_for_current(core) {
        return Err(TriggerError::Affinity(core_id));
    }
    info!(core = core_id, "bound to CPU core");
    Ok(())
}
