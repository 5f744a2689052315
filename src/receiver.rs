// Receiver-side sync state
//
// The slice of per-receiver session state the clock synchronization core
// reads and mutates. Connection handling, positions and interest sets live
// in the session layer, not here.

use crate::clocksync::{Clock, ClockSyncError, SyncParty};

/// Sync bookkeeping for one connected receiver
#[derive(Debug, Clone)]
pub struct Receiver {
    pub uid: usize,
    pub user: String,
    pub clock: Clock,

    /// Verbose-diagnostics flag
    pub focus: bool,
    /// Bad-sync score; < 0.01 means the receiver is currently trusted.
    /// The session layer decays this over time.
    pub bad_syncs: f64,
    pub num_syncs: u64,
    pub num_outliers: u64,
    /// Number of active pairings involving this receiver
    pub sync_peers: usize,
    /// Pair jumps since the last escalation
    pub recent_pair_jumps: usize,
    pub dead: bool,

    pub connected_since: f64,
    pub last_clock_reset: f64,
    pub clock_reset_counter: usize,
}

impl Receiver {
    pub fn new(uid: usize, user: String, clock_tag: &str, now: f64) -> Result<Self, ClockSyncError> {
        Ok(Receiver {
            uid,
            user,
            clock: Clock::from_tag(clock_tag)?,
            focus: false,
            bad_syncs: 0.0,
            num_syncs: 0,
            num_outliers: 0,
            sync_peers: 0,
            recent_pair_jumps: 0,
            dead: false,
            connected_since: now,
            last_clock_reset: now,
            clock_reset_counter: 0,
        })
    }

    /// Record a receiver clock reset; the caller also resets the offsets of
    /// every pairing involving this receiver.
    pub fn reset_clock(&mut self, now: f64) {
        self.last_clock_reset = now;
        self.clock_reset_counter += 1;
    }
}

impl SyncParty for Receiver {
    fn user(&self) -> &str {
        &self.user
    }

    fn focus(&self) -> bool {
        self.focus
    }

    fn bad_syncs(&self) -> f64 {
        self.bad_syncs
    }

    fn add_sync(&mut self) {
        self.num_syncs += 1;
    }

    fn add_outlier(&mut self) {
        self.num_outliers += 1;
    }

    fn increment_jumps(&mut self) {
        self.recent_pair_jumps += 1;

        if self.sync_peers > 0 {
            let jump_ratio = self.recent_pair_jumps as f64 / self.sync_peers as f64;
            if jump_ratio > 0.25 && self.recent_pair_jumps > 3 {
                self.recent_pair_jumps = 0;
                self.bad_syncs += 0.1;
            }
        }
    }
}
