//! Controller configuration

use serde::{Deserialize, Serialize};

/// Resource limits and timing knobs of an [`IsoController`](crate::IsoController)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Broadcast BIGs that may exist at once
    pub max_bigs: usize,
    /// Broadcast BISes across all BIGs
    pub max_bis: usize,
    /// BIG syncs that may exist at once
    pub max_big_syncs: usize,
    /// Synchronized BISes across all syncs
    pub max_sync_bis: usize,
    /// SDUs a broadcast BIS may hold before enqueueing fails
    pub max_sdu_queue: usize,
    /// Local sleep clock accuracy in ppm
    pub local_sca_ppm: u32,
    /// Consecutive unschedulable events before a BIG is torn down
    pub max_sched_retries: u8,
    /// Events between a channel map update and its instant
    pub control_instant_offset: u16,
    /// Scheduler reservation ahead of each anchor
    pub event_lead_us: u32,
    /// Receive window beyond the widened uncertainty
    pub rx_window_margin_us: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_bigs: 2,
            max_bis: 8,
            max_big_syncs: 2,
            max_sync_bis: 8,
            max_sdu_queue: 16,
            local_sca_ppm: 50,
            max_sched_retries: 6,
            control_instant_offset: 6,
            event_lead_us: 250,
            rx_window_margin_us: 32,
        }
    }
}
