// Pairwise receiver clock synchronization
//
// For every pair of receivers that see the same aircraft, a ClockPairing
// tracks the relative frequency drift of the two receiver clocks and a
// piecewise-linear mapping between their timebases. Downstream
// multilateration consumes the mapping through predict_peer/predict_base.

use std::fmt;

use tracing::warn;

use crate::constants::CAIR;

/// Sample ring capacity per pairing
const CP_SIZE: usize = 32;

/// Ring occupancy a prune pass reduces to
const CP_KEEP: usize = CP_SIZE - 12;

/// Drift samples integrated before the control loop counts as settled
const DRIFT_N_STABLE: u32 = 12;

/// Proportional gain of the drift loop
const DRIFT_KP: f64 = 0.03;

/// Integral gain of the drift loop, applied to the cumulative offset error
const DRIFT_KI: f64 = 0.008;

/// Absolute prediction-error limit (s) once the ring is warm; doubled while n < 4
const OUTLIER_THRESHOLD: f64 = 0.9e-6;

/// Sync-point smoothing weight once the drift loop has settled.
/// Empirically chosen; 0.5 oscillates.
const SMOOTHING_SETTLED: f64 = 0.38;

/// Sync-point smoothing weight while the pairing is still warming up
const SMOOTHING_WARMUP: f64 = 0.15;

#[derive(Debug, Clone, PartialEq)]
pub enum ClockSyncError {
    /// The clock factory was handed a receiver type tag it does not know.
    UnsupportedClockType(String),
    /// A prediction was requested from a pairing with no sync points.
    EmptyPairing,
}

impl fmt::Display for ClockSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockSyncError::UnsupportedClockType(tag) => {
                write!(f, "unsupported clock type: {}", tag)
            }
            ClockSyncError::EmptyPairing => write!(f, "pairing has no sync points"),
        }
    }
}

impl std::error::Error for ClockSyncError {}

/// Receiver clock types with known presets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockType {
    RadarcapeGps,
    Radarcape12Mhz,
    Beast,
    Sbs,
    Dump1090,
    Unknown,
}

impl ClockType {
    /// Parse a receiver type tag as sent in the client handshake.
    pub fn from_tag(tag: &str) -> Result<Self, ClockSyncError> {
        match tag {
            "radarcape_gps" => Ok(ClockType::RadarcapeGps),
            "radarcape_12mhz" => Ok(ClockType::Radarcape12Mhz),
            "beast" => Ok(ClockType::Beast),
            "sbs" => Ok(ClockType::Sbs),
            "dump1090" => Ok(ClockType::Dump1090),
            "unknown" => Ok(ClockType::Unknown),
            _ => Err(ClockSyncError::UnsupportedClockType(tag.to_string())),
        }
    }
}

/// Clock characteristics of one receiver's timebase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clock {
    /// Clock frequency in Hz
    pub freq: f64,
    /// Maximum expected relative frequency error (e.g. 1e-6 = 1 PPM)
    pub max_freq_error: f64,
    /// Expected jitter of a single reading, in seconds (standard deviation)
    pub jitter: f64,
    /// Precomputed delay factor: freq / CAIR
    pub delay_factor: f64,
}

impl Clock {
    /// Create a clock with the given parameters
    pub fn new(freq: f64, max_freq_error: f64, jitter: f64) -> Self {
        Clock {
            freq,
            max_freq_error,
            jitter,
            delay_factor: freq / CAIR,
        }
    }

    /// Create a clock from a known receiver type
    pub fn from_type(clock_type: ClockType) -> Self {
        match clock_type {
            // GPS-disciplined 1 GHz clock
            ClockType::RadarcapeGps => Clock::new(1e9, 1e-6, 15e-9),
            // 12 MHz crystal
            ClockType::Radarcape12Mhz | ClockType::Beast => Clock::new(12e6, 5e-6, 83e-9),
            // 20 MHz crystal, poor quality
            ClockType::Sbs => Clock::new(20e6, 100e-6, 500e-9),
            // 12 MHz crystal, assume poor quality
            ClockType::Dump1090 | ClockType::Unknown => Clock::new(12e6, 100e-6, 500e-9),
        }
    }

    /// Create a clock from a receiver type tag
    pub fn from_tag(tag: &str) -> Result<Self, ClockSyncError> {
        Ok(Clock::from_type(ClockType::from_tag(tag)?))
    }
}

/// The per-receiver session state the pairing estimator credits and consults.
///
/// Passed into `ClockPairing::update` by mutable reference; the pairing never
/// holds on to a receiver.
pub trait SyncParty {
    /// Login name, for diagnostics
    fn user(&self) -> &str;
    /// Verbose-diagnostics flag
    fn focus(&self) -> bool;
    /// Bad-sync score; below 0.01 the receiver is currently trusted
    fn bad_syncs(&self) -> f64;
    /// Count one sync attempt against this receiver
    fn add_sync(&mut self);
    /// Count one outlier against this receiver
    fn add_outlier(&mut self);
    /// Record that a pairing involving this receiver jumped
    fn increment_jumps(&mut self);
}

/// Per-aircraft sync quality context, owned by the aircraft tracker.
///
/// The tracker decays the counters and derives `sync_dont_use` from them;
/// the pairing estimator only increments `sync_good`/`sync_bad` and honors
/// `sync_dont_use`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AircraftSyncState {
    pub sync_good: u32,
    pub sync_bad: u32,
    pub sync_dont_use: bool,
}

/// Relative characteristics of a pair of receiver clocks.
///
/// All mutation funnels through `update` and `reset_offsets`; reads go
/// through `predict_peer` / `predict_base` / `check_valid` and the getters.
#[derive(Debug)]
pub struct ClockPairing {
    base_uid: usize,
    peer_uid: usize,

    /// Distance category, opaque to the estimator
    cat: usize,

    base_freq: f64,
    peer_freq: f64,
    relative_freq: f64,   // peer_freq / base_freq
    i_relative_freq: f64, // base_freq / peer_freq

    // Drift control loop
    raw_drift: f64,
    drift: f64,
    i_drift: f64,
    drift_n: u32,
    drift_outliers: u32,
    drift_max: f64,
    drift_max_delta: f64,
    cumulative_error: f64,

    // Sync point ring; strictly increasing on both axes
    ts_base: [f64; CP_SIZE],
    ts_peer: [f64; CP_SIZE],
    var: [f64; CP_SIZE],
    var_sum: f64,
    n: usize,

    // Outlier accounting
    outliers: u32,
    outlier_threshold: f64,
    outlier_total: f64,
    update_total: f64,
    outlier_reset_cooldown: u32,
    jumped: bool,

    valid: bool,
    updated: f64,
    update_attempted: f64,
    variance: f64,
    error: f64,
}

impl ClockPairing {
    pub fn new(
        base_uid: usize,
        peer_uid: usize,
        base_clock: &Clock,
        peer_clock: &Clock,
        cat: usize,
    ) -> Self {
        let drift_max = 0.75 * (base_clock.max_freq_error + peer_clock.max_freq_error);

        ClockPairing {
            base_uid,
            peer_uid,
            cat,

            base_freq: base_clock.freq,
            peer_freq: peer_clock.freq,
            relative_freq: peer_clock.freq / base_clock.freq,
            i_relative_freq: base_clock.freq / peer_clock.freq,

            raw_drift: 0.0,
            drift: 0.0,
            i_drift: 0.0,
            drift_n: 0,
            drift_outliers: 0,
            drift_max,
            drift_max_delta: drift_max / 10.0,
            cumulative_error: 0.0,

            ts_base: [0.0; CP_SIZE],
            ts_peer: [0.0; CP_SIZE],
            var: [0.0; CP_SIZE],
            var_sum: 0.0,
            n: 0,

            outliers: 0,
            outlier_threshold: OUTLIER_THRESHOLD,
            outlier_total: 0.0,
            // non-zero so outlier_total / update_total is always defined
            update_total: 1e-3,
            outlier_reset_cooldown: 5,
            jumped: false,

            valid: false,
            updated: 0.0,
            update_attempted: 0.0,
            variance: -1e-6,
            error: -1e-6,
        }
    }

    pub fn base_uid(&self) -> usize {
        self.base_uid
    }

    pub fn peer_uid(&self) -> usize {
        self.peer_uid
    }

    pub fn category(&self) -> usize {
        self.cat
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn updated(&self) -> f64 {
        self.updated
    }

    pub fn update_attempted(&self) -> f64 {
        self.update_attempted
    }

    /// Variance of recent predictions (s²); -1e-6 while undefined
    pub fn variance(&self) -> f64 {
        self.variance
    }

    /// Standard error of recent predictions (s); -1e-6 while undefined
    pub fn error(&self) -> f64 {
        self.error
    }

    pub fn drift(&self) -> f64 {
        self.drift
    }

    pub fn raw_drift(&self) -> f64 {
        self.raw_drift
    }

    pub fn i_drift(&self) -> f64 {
        self.i_drift
    }

    pub fn drift_n(&self) -> u32 {
        self.drift_n
    }

    /// Number of sync points currently in the ring
    pub fn n(&self) -> usize {
        self.n
    }

    pub fn outliers(&self) -> u32 {
        self.outliers
    }

    pub fn outlier_reset_cooldown(&self) -> u32 {
        self.outlier_reset_cooldown
    }

    pub fn outlier_total(&self) -> f64 {
        self.outlier_total
    }

    pub fn update_total(&self) -> f64 {
        self.update_total
    }

    pub fn jumped(&self) -> bool {
        self.jumped
    }

    /// Fraction of recent updates classified as outliers, as a percentage
    pub fn outlier_percent(&self) -> f64 {
        100.0 * self.outlier_total / self.update_total
    }

    /// Halve the diagnostic totals so the outlier percentage stays recent.
    pub(crate) fn decay_update_stats(&mut self) {
        self.outlier_total /= 2.0;
        self.update_total /= 2.0;
    }

    /// Read and clear the sticky jump flag.
    pub(crate) fn take_jumped(&mut self) -> bool {
        std::mem::take(&mut self.jumped)
    }

    /// Ingest one synchronized observation.
    ///
    /// `base_ts`/`peer_ts` are the timestamps of the same radio event on each
    /// receiver clock, in native ticks. `base_interval`/`peer_interval` are
    /// the native-tick lengths of the interval since the previous event seen
    /// for this aircraft, used for drift estimation independent of the
    /// absolute offset. Returns true iff the sample entered the sync ring.
    #[allow(clippy::too_many_arguments)]
    pub fn update<B: SyncParty, P: SyncParty>(
        &mut self,
        address: u32,
        mut base_ts: f64,
        mut peer_ts: f64,
        base_interval: f64,
        peer_interval: f64,
        now: f64,
        base: &mut B,
        peer: &mut P,
        ac: &mut AircraftSyncState,
    ) -> bool {
        let mut outlier = false;
        let mut do_reset = false;

        // Make room / drop stale history before looking at the sample
        if self.n > CP_SIZE - 1
            || (self.n > 0 && base_ts - self.ts_base[0] > 50.0 * self.base_freq)
        {
            self.prune_old_data(now);
        }

        self.update_total += 1.0;
        self.update_attempted = now;

        // Clocks must move forward on both axes
        if self.n > 0 {
            let last = self.n - 1;
            if peer_ts <= self.ts_peer[last] || base_ts <= self.ts_base[last] {
                if peer_ts < self.ts_peer[last] && base_ts < self.ts_base[last] {
                    // Both went backwards: transient from the transport, drop quietly
                    return false;
                }
                if peer_ts == self.ts_peer[last] || base_ts == self.ts_base[last] {
                    return false;
                }

                // One clock stepped across the other
                self.valid = false;
                self.outliers += 10;
                self.outlier_total += 1.0;
                outlier = true;

                if self.outliers <= 10 {
                    return false;
                }
                do_reset = true;
            }
        }

        // Predict from existing data and classify the sample
        let mut prediction = 0.0;
        let mut prediction_error = 0.0;
        if self.n > 0 && !outlier {
            prediction = self.interpolate_peer(base_ts);
            prediction_error = (prediction - peer_ts) / self.peer_freq;

            let threshold = if self.n >= 4 {
                self.outlier_threshold
            } else {
                2.0 * self.outlier_threshold
            };

            base.add_sync();
            peer.add_sync();

            if prediction_error.abs() > threshold {
                if base.bad_syncs() < 0.01 && peer.bad_syncs() < 0.01 {
                    ac.sync_bad += 1;
                }
                if ac.sync_dont_use {
                    return false;
                }

                // Blame the receiver whose opposite side is currently trusted
                if peer.bad_syncs() < 0.01 {
                    base.add_outlier();
                }
                if base.bad_syncs() < 0.01 {
                    peer.add_outlier();
                }

                outlier = true;
                self.outlier_total += 1.0;

                if prediction_error.abs() > 2.0 * threshold {
                    self.outliers += 20;
                    do_reset = true;
                } else {
                    self.outliers += 8;
                }

                if self.outliers <= 77 {
                    return false;
                }

                if do_reset {
                    if !self.jumped {
                        if peer.bad_syncs() < 0.01 {
                            base.increment_jumps();
                        }
                        if base.bad_syncs() < 0.01 {
                            peer.increment_jumps();
                        }
                    }
                    self.jumped = true;
                }
            } else {
                ac.sync_good += 1;
            }
        }

        // Bend the sample towards the prediction on both axes. The weight is
        // < 1 so tail monotonicity survives.
        if self.n >= 2 && !do_reset {
            let prediction_base = self.interpolate_base(peer_ts);
            let weight = if self.n >= 4 && self.drift_n > DRIFT_N_STABLE {
                SMOOTHING_SETTLED
            } else {
                SMOOTHING_WARMUP
            };
            peer_ts += weight * (prediction - peer_ts);
            base_ts += weight * (prediction_base - base_ts);
        }

        if ac.sync_dont_use {
            return false;
        }

        if do_reset {
            if (base.focus() && peer.bad_syncs() < 0.01)
                || (peer.focus() && base.bad_syncs() < 0.01)
            {
                warn!(
                    target: "clocksync",
                    "ac {:06X} step_us {:.1} drift_ppm {:.1} outlier_percent {:.3} pair: {}:{}",
                    address,
                    prediction_error * 1e6,
                    self.drift * 1e6,
                    self.outlier_percent(),
                    base.user(),
                    peer.user(),
                );
            }
            self.reset_offsets();
            self.outlier_reset_cooldown = 15;
            // The sample becomes a fresh anchor; no history to err against
            prediction_error = 0.0;
        }

        self.outliers = self.outliers.saturating_sub(18);
        self.cumulative_error = (self.cumulative_error + prediction_error).clamp(-50e-6, 50e-6);
        self.outlier_reset_cooldown = self.outlier_reset_cooldown.saturating_sub(1);

        if !self.update_drift(base_interval, peer_interval, base, peer) {
            self.check_valid(now);
            return false;
        }

        // Insert at the tail; monotonicity was enforced above
        let p_var = prediction_error * prediction_error;
        self.ts_base[self.n] = base_ts;
        self.ts_peer[self.n] = peer_ts;
        self.var[self.n] = p_var;
        self.n += 1;
        self.var_sum += p_var;

        self.updated = now;
        self.check_valid(now);
        true
    }

    /// Drop ring entries so at most CP_KEEP remain and none is older than
    /// 45 s of base clock time behind the newest.
    fn prune_old_data(&mut self, now: f64) {
        if self.outlier_total > 0.0 || self.update_total > 256.0 {
            self.decay_update_stats();
        }

        let mut i = self.n.saturating_sub(CP_KEEP);
        if self.n > 0 {
            let newest = self.ts_base[self.n - 1];
            let limit = 45.0 * self.base_freq;
            while i < self.n && newest - self.ts_base[i] > limit {
                i += 1;
            }
        }

        if i > 0 {
            self.ts_base.copy_within(i..self.n, 0);
            self.ts_peer.copy_within(i..self.n, 0);
            self.var.copy_within(i..self.n, 0);
            self.n -= i;
            self.var_sum = self.var[..self.n].iter().sum();
        }

        self.check_valid(now);
    }

    /// Drift control loop. Returns false if the interval pair was rejected.
    fn update_drift<B: SyncParty, P: SyncParty>(
        &mut self,
        base_interval: f64,
        peer_interval: f64,
        base: &B,
        peer: &P,
    ) -> bool {
        // Rescale before subtracting to avoid catastrophic cancellation
        let adjusted_interval = base_interval * self.relative_freq;
        let new_drift = (peer_interval - adjusted_interval) / adjusted_interval;

        if new_drift.abs() > self.drift_max {
            return false;
        }

        // First sample, or the loop lost the plot: adopt the measurement
        if self.drift_n == 0 || self.drift_outliers > 30 {
            self.raw_drift = new_drift;
            self.drift = new_drift;
            self.i_drift = -self.drift / (1.0 + self.drift);
            self.drift_n = 0;
            self.cumulative_error = 0.0;
            self.drift_outliers = 0;
        }

        if self.drift_n == 0 {
            // Seed confidence so one sample doesn't count as settled
            self.drift_n = 2;
            return true;
        }

        let drift_error = new_drift - self.raw_drift;
        if drift_error.abs() > self.drift_max_delta {
            self.drift_outliers += 1;
            if base.focus() || peer.focus() {
                warn!(
                    target: "clocksync",
                    "{}:{}: drift_error_ppm out of limits: {:.1}",
                    base.user(),
                    peer.user(),
                    drift_error * 1e6,
                );
            }
            return false;
        }

        self.drift_outliers = self.drift_outliers.saturating_sub(2);

        // PI update; boost the proportional gain while the pair is fresh
        let mut kp = DRIFT_KP;
        if self.drift_n < DRIFT_N_STABLE {
            kp *= 1.0
                + (0.3 / DRIFT_KP) * ((DRIFT_N_STABLE - self.drift_n) as f64 / DRIFT_N_STABLE as f64);
        }
        self.drift_n = self.drift_n.saturating_add(1);

        self.raw_drift += kp * drift_error;
        self.drift = self.raw_drift - DRIFT_KI * self.cumulative_error;
        self.i_drift = -self.drift / (1.0 + self.drift);
        true
    }

    /// Clear the sync ring and validity; drift state survives.
    pub fn reset_offsets(&mut self) {
        self.valid = false;
        self.n = 0;
        self.var_sum = 0.0;
        self.variance = -1e-6;
        self.error = -1e-6;
        self.outliers = 0;
        self.cumulative_error = 0.0;
    }

    /// Map a base-clock timestamp to the peer clock.
    pub fn predict_peer(&self, base_ts: f64) -> Result<f64, ClockSyncError> {
        if self.n == 0 {
            return Err(ClockSyncError::EmptyPairing);
        }
        Ok(self.interpolate_peer(base_ts))
    }

    /// Map a peer-clock timestamp to the base clock.
    pub fn predict_base(&self, peer_ts: f64) -> Result<f64, ClockSyncError> {
        if self.n == 0 {
            return Err(ClockSyncError::EmptyPairing);
        }
        Ok(self.interpolate_base(peer_ts))
    }

    // Requires n > 0.
    //
    // Interior queries interpolate between ring anchors; the drift is already
    // encoded in the anchor slope there. Queries before the ring or within
    // 10 s of the newest anchor extrapolate with the drifted frequency ratio;
    // near the tail the extrapolations from the two newest anchors are
    // averaged so a single noisy tail anchor cannot drag recent predictions.
    fn interpolate_peer(&self, base_ts: f64) -> f64 {
        let n = self.n;
        let factor = self.relative_freq * (1.0 + self.drift);

        if base_ts < self.ts_base[0] || n == 1 {
            return self.ts_peer[0] + (base_ts - self.ts_base[0]) * factor;
        }

        if base_ts > self.ts_base[n - 1] - 10.0 * self.base_freq {
            let newest = self.ts_peer[n - 1] + (base_ts - self.ts_base[n - 1]) * factor;
            if self.ts_base[n - 1] - self.ts_base[n - 2] > 10.0 * self.base_freq {
                return newest;
            }
            let second = self.ts_peer[n - 2] + (base_ts - self.ts_base[n - 2]) * factor;
            return 0.5 * (newest + second);
        }

        let i = self.ts_base[..n].partition_point(|&t| t < base_ts).max(1);
        self.ts_peer[i - 1]
            + (self.ts_peer[i] - self.ts_peer[i - 1]) * (base_ts - self.ts_base[i - 1])
                / (self.ts_base[i] - self.ts_base[i - 1])
    }

    // Requires n > 0. Mirror of interpolate_peer with the axes swapped.
    fn interpolate_base(&self, peer_ts: f64) -> f64 {
        let n = self.n;
        let factor = self.i_relative_freq * (1.0 + self.i_drift);

        if peer_ts < self.ts_peer[0] || n == 1 {
            return self.ts_base[0] + (peer_ts - self.ts_peer[0]) * factor;
        }

        if peer_ts > self.ts_peer[n - 1] - 10.0 * self.peer_freq {
            let newest = self.ts_base[n - 1] + (peer_ts - self.ts_peer[n - 1]) * factor;
            if self.ts_peer[n - 1] - self.ts_peer[n - 2] > 10.0 * self.peer_freq {
                return newest;
            }
            let second = self.ts_base[n - 2] + (peer_ts - self.ts_peer[n - 2]) * factor;
            return 0.5 * (newest + second);
        }

        let i = self.ts_peer[..n].partition_point(|&t| t < peer_ts).max(1);
        self.ts_base[i - 1]
            + (self.ts_base[i] - self.ts_base[i - 1]) * (peer_ts - self.ts_peer[i - 1])
                / (self.ts_peer[i] - self.ts_peer[i - 1])
    }

    /// Recompute variance, error and the validity gate.
    pub fn check_valid(&mut self, now: f64) -> bool {
        if self.n < 2 || self.drift_n < 2 {
            self.variance = -1e-6;
            self.error = -1e-6;
            self.valid = false;
            return false;
        }

        self.variance = self.var_sum / self.n as f64;
        self.error = self.variance.sqrt();

        self.valid = self.outlier_reset_cooldown < 1
            && self.n > 4
            && self.drift_n > 4
            && self.variance < 16e-12
            && now - self.updated < 35.0;
        self.valid
    }
}
