// Clock pairing registry
//
// Owns every ClockPairing, keyed by the ordered receiver uid pair. The sync
// driver fetches a pairing, feeds it observations, and periodically asks the
// registry to prune stale pairs and snapshot sync quality for the state file.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::clocksync::{Clock, ClockPairing};
use crate::constants::{PAIR_EXPIRY, PAIR_EXPIRY_INVALID};

/// Distance bin width for pairing categories (m)
const CATEGORY_BIN: f64 = 50e3;

/// Highest pairing category
const CATEGORY_MAX: usize = 3;

/// One side's view of pairing quality, as written to the state file
#[derive(Debug, Clone, Serialize)]
pub struct PairSyncReport {
    /// Sync points currently in the ring
    pub n: usize,
    /// Standard error of recent predictions (µs)
    pub error_us: f64,
    /// Drift towards this side's peer (ppm)
    pub drift_ppm: f64,
    /// Recent fraction of updates classified as outliers (%)
    pub outlier_percent: f64,
    /// Pairing jumped since the last snapshot
    pub jumped: bool,
    pub seconds_since_update: i64,
}

/// Registry of all clock pairings
#[derive(Debug, Default)]
pub struct ClockTracker {
    clock_pairs: HashMap<(usize, usize), ClockPairing>,
}

impl ClockTracker {
    pub fn new() -> Self {
        ClockTracker {
            clock_pairs: HashMap::new(),
        }
    }

    /// Fetch the pairing for two receivers, creating it on first use.
    /// Either uid ordering maps to the same pairing.
    pub fn pairing_for(
        &mut self,
        uid0: usize,
        uid1: usize,
        clock0: &Clock,
        clock1: &Clock,
        distance_m: f64,
    ) -> &mut ClockPairing {
        let (base_uid, peer_uid, base_clock, peer_clock) = if uid0 < uid1 {
            (uid0, uid1, clock0, clock1)
        } else {
            (uid1, uid0, clock1, clock0)
        };

        let cat = ((distance_m / CATEGORY_BIN) as usize).min(CATEGORY_MAX);

        self.clock_pairs
            .entry((base_uid, peer_uid))
            .or_insert_with(|| ClockPairing::new(base_uid, peer_uid, base_clock, peer_clock, cat))
    }

    pub fn pairing(&self, uid0: usize, uid1: usize) -> Option<&ClockPairing> {
        self.clock_pairs.get(&ordered(uid0, uid1))
    }

    pub fn pairing_mut(&mut self, uid0: usize, uid1: usize) -> Option<&mut ClockPairing> {
        self.clock_pairs.get_mut(&ordered(uid0, uid1))
    }

    pub fn num_pairings(&self) -> usize {
        self.clock_pairs.len()
    }

    pub fn num_valid_pairings(&self) -> usize {
        self.clock_pairs.values().filter(|p| p.valid()).count()
    }

    /// Drop pairings that have gone quiet: any pairing untouched for 45 s,
    /// and invalid pairings untouched for 30 s.
    pub fn cleanup(&mut self, now: f64) {
        self.clock_pairs.retain(|_, pairing| {
            pairing.check_valid(now);
            now - pairing.updated() <= PAIR_EXPIRY
                && (pairing.valid() || now - pairing.updated() <= PAIR_EXPIRY_INVALID)
        });
    }

    /// Forget the offsets of every pairing involving a receiver whose clock
    /// reset; drift estimates survive.
    pub fn receiver_clock_reset(&mut self, uid: usize) {
        for ((base_uid, peer_uid), pairing) in self.clock_pairs.iter_mut() {
            if *base_uid == uid || *peer_uid == uid {
                pairing.reset_offsets();
            }
        }
    }

    /// Remove every pairing involving a disconnected receiver.
    /// Returns how many were removed so the session layer can adjust
    /// its peer counts.
    pub fn receiver_disconnect(&mut self, uid: usize) -> usize {
        let before = self.clock_pairs.len();
        self.clock_pairs
            .retain(|&(base_uid, peer_uid), _| base_uid != uid && peer_uid != uid);
        before - self.clock_pairs.len()
    }

    /// Snapshot per-pair sync quality, keyed by user and peer user.
    ///
    /// Halves the running outlier/update totals and clears the jump flag of
    /// each reported pairing, so the next snapshot reflects recent behavior.
    /// Pairings with fewer than 2 sync points, or whose uids are missing from
    /// `users`, are skipped.
    pub fn sync_state(&mut self, now: f64, users: &HashMap<usize, String>) -> Value {
        let mut per_user: HashMap<&str, Map<String, Value>> = HashMap::new();

        for ((base_uid, peer_uid), pairing) in self.clock_pairs.iter_mut() {
            if pairing.n() < 2 {
                continue;
            }
            let (base_user, peer_user) = match (users.get(base_uid), users.get(peer_uid)) {
                (Some(b), Some(p)) => (b.as_str(), p.as_str()),
                _ => continue,
            };

            let outlier_percent = if pairing.update_total() < 4.0 {
                round1(50.0 * pairing.outlier_percent() / 100.0)
            } else {
                round1(pairing.outlier_percent())
            };
            pairing.decay_update_stats();
            let jumped = pairing.take_jumped();
            let seconds_since_update = (now - pairing.updated()).round() as i64;
            let error_us = round1(pairing.error() * 1e6);

            let base_view = PairSyncReport {
                n: pairing.n(),
                error_us,
                drift_ppm: round1(pairing.drift() * 1e6),
                outlier_percent,
                jumped,
                seconds_since_update,
            };
            let peer_view = PairSyncReport {
                drift_ppm: round1(pairing.i_drift() * 1e6),
                ..base_view.clone()
            };

            per_user
                .entry(base_user)
                .or_default()
                .insert(peer_user.to_string(), json!(base_view));
            per_user
                .entry(peer_user)
                .or_default()
                .insert(base_user.to_string(), json!(peer_view));
        }

        let mut sync = Map::new();
        for (user, peers) in per_user {
            sync.insert(user.to_string(), json!({ "peers": peers }));
        }
        Value::Object(sync)
    }
}

fn ordered(uid0: usize, uid1: usize) -> (usize, usize) {
    if uid0 < uid1 {
        (uid0, uid1)
    } else {
        (uid1, uid0)
    }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clocksync::AircraftSyncState;
    use crate::receiver::Receiver;

    const TICK_12MHZ: f64 = 12e6;

    fn receiver(uid: usize, user: &str) -> Receiver {
        Receiver::new(uid, user.to_string(), "dump1090", 0.0).unwrap()
    }

    /// Feed clean one-second samples into the (r0, r1) pairing.
    fn feed(
        tracker: &mut ClockTracker,
        r0: &mut Receiver,
        r1: &mut Receiver,
        count: usize,
    ) {
        let mut ac = AircraftSyncState::default();
        let clock0 = r0.clock;
        let clock1 = r1.clock;
        let pairing = tracker.pairing_for(r0.uid, r1.uid, &clock0, &clock1, 100e3);
        for i in 1..=count {
            let ts = i as f64 * TICK_12MHZ;
            pairing.update(
                0xABCDEF,
                ts,
                ts + 1000.0,
                TICK_12MHZ,
                TICK_12MHZ,
                i as f64,
                r0,
                r1,
                &mut ac,
            );
        }
    }

    #[test]
    fn pairing_lookup_ignores_uid_order() {
        let mut tracker = ClockTracker::new();
        let c = receiver(1, "alice").clock;

        let p = tracker.pairing_for(2, 1, &c, &c, 120e3);
        assert_eq!(p.base_uid(), 1);
        assert_eq!(p.peer_uid(), 2);
        assert_eq!(p.category(), 2);
        assert_eq!(tracker.num_pairings(), 1);

        tracker.pairing_for(1, 2, &c, &c, 120e3);
        assert_eq!(tracker.num_pairings(), 1);
        assert!(tracker.pairing(2, 1).is_some());
        assert!(tracker.pairing(1, 3).is_none());
    }

    #[test]
    fn category_is_clamped() {
        let mut tracker = ClockTracker::new();
        let c = receiver(1, "alice").clock;
        let p = tracker.pairing_for(1, 2, &c, &c, 400e3);
        assert_eq!(p.category(), 3);
    }

    #[test]
    fn cleanup_drops_stale_pairings() {
        let mut tracker = ClockTracker::new();
        let mut alice = receiver(1, "alice");
        let mut bob = receiver(2, "bob");
        feed(&mut tracker, &mut alice, &mut bob, 10);
        assert_eq!(tracker.num_valid_pairings(), 1);

        // Last update at now = 10: still fresh
        tracker.cleanup(20.0);
        assert_eq!(tracker.num_pairings(), 1);

        // Past the 45 s expiry
        tracker.cleanup(56.0);
        assert_eq!(tracker.num_pairings(), 0);
    }

    #[test]
    fn cleanup_drops_invalid_pairings_sooner() {
        let mut tracker = ClockTracker::new();
        let mut alice = receiver(1, "alice");
        let mut bob = receiver(2, "bob");
        // Too short a feed to become valid
        feed(&mut tracker, &mut alice, &mut bob, 3);
        assert_eq!(tracker.num_valid_pairings(), 0);

        tracker.cleanup(3.0 + 29.0);
        assert_eq!(tracker.num_pairings(), 1);
        tracker.cleanup(3.0 + 31.0);
        assert_eq!(tracker.num_pairings(), 0);
    }

    #[test]
    fn clock_reset_clears_offsets_but_keeps_pairing() {
        let mut tracker = ClockTracker::new();
        let mut alice = receiver(1, "alice");
        let mut bob = receiver(2, "bob");
        feed(&mut tracker, &mut alice, &mut bob, 10);

        tracker.receiver_clock_reset(2);
        let p = tracker.pairing(1, 2).unwrap();
        assert_eq!(p.n(), 0);
        assert!(!p.valid());
        assert!(p.drift_n() > 0);
        assert_eq!(tracker.num_pairings(), 1);
    }

    #[test]
    fn disconnect_removes_only_involved_pairings() {
        let mut tracker = ClockTracker::new();
        let c = receiver(1, "alice").clock;
        tracker.pairing_for(1, 2, &c, &c, 10e3);
        tracker.pairing_for(1, 3, &c, &c, 10e3);
        tracker.pairing_for(2, 3, &c, &c, 10e3);

        assert_eq!(tracker.receiver_disconnect(1), 2);
        assert_eq!(tracker.num_pairings(), 1);
        assert!(tracker.pairing(2, 3).is_some());
    }

    #[test]
    fn sync_state_reports_both_sides_and_decays_totals() {
        let mut tracker = ClockTracker::new();
        let mut alice = receiver(1, "alice");
        let mut bob = receiver(2, "bob");
        feed(&mut tracker, &mut alice, &mut bob, 10);

        let users: HashMap<usize, String> =
            [(1, "alice".to_string()), (2, "bob".to_string())].into();

        let update_total_before = tracker.pairing(1, 2).unwrap().update_total();
        let state = tracker.sync_state(12.0, &users);

        let alice_view = &state["alice"]["peers"]["bob"];
        assert_eq!(alice_view["n"], json!(10));
        assert_eq!(alice_view["jumped"], json!(false));
        assert_eq!(alice_view["seconds_since_update"], json!(2));
        assert!(alice_view["error_us"].as_f64().unwrap() >= 0.0);

        let bob_view = &state["bob"]["peers"]["alice"];
        assert_eq!(bob_view["n"], json!(10));

        let p = tracker.pairing(1, 2).unwrap();
        assert!((p.update_total() - update_total_before / 2.0).abs() < 1e-9);
    }

    #[test]
    fn sync_state_skips_sparse_pairings() {
        let mut tracker = ClockTracker::new();
        let mut alice = receiver(1, "alice");
        let mut bob = receiver(2, "bob");
        feed(&mut tracker, &mut alice, &mut bob, 1);

        let users: HashMap<usize, String> =
            [(1, "alice".to_string()), (2, "bob".to_string())].into();
        let state = tracker.sync_state(2.0, &users);
        assert!(state.as_object().unwrap().is_empty());
    }
}
