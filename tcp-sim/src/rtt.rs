//! Round-trip time estimation and retransmission history.
//!
//! Reliable delivery requires that unacknowledged segments are re-sent if no
//! ACK arrives within a bounded time.  This module provides:
//! - [`RttEstimator`]: smoothed RTT and mean deviation (RFC 6298).
//! - [`RttHistory`]: a log of transmitted ranges, used to take RTT samples
//!   from ACKs when the timestamp option is not in use.
//!
//! The connection derives its RTO as
//!   `RTO = max(SRTT + max(G, 4 × RTTVAR), minRto)`
//! and doubles it on each consecutive timeout, capped at 60 s.

use std::collections::VecDeque;
use std::time::Duration;

use crate::seq::SequenceNumber;

/// Upper bound on any backed-off timeout.
pub const MAX_RTO: Duration = Duration::from_secs(60);

/// Mean-deviation RTT estimator.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    initial_estimate: Duration,
    estimate: Duration,
    variation: Duration,
    n_samples: u32,
}

impl RttEstimator {
    /// `initial_estimate` is used as SRTT until the first sample arrives.
    pub fn new(initial_estimate: Duration) -> Self {
        Self {
            initial_estimate,
            estimate: initial_estimate,
            variation: Duration::ZERO,
            n_samples: 0,
        }
    }

    /// Record a new RTT sample (RFC 6298 §2).
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    pub fn measurement(&mut self, sample: Duration) {
        if self.n_samples == 0 {
            self.estimate = sample;
            self.variation = sample / 2;
        } else {
            let diff = sample.abs_diff(self.estimate);
            self.variation = self.variation * 3 / 4 + diff / 4;
            self.estimate = self.estimate * 7 / 8 + sample / 8;
        }
        self.n_samples += 1;
    }

    /// Smoothed RTT.
    pub fn estimate(&self) -> Duration {
        self.estimate
    }

    /// Mean deviation.
    pub fn variation(&self) -> Duration {
        self.variation
    }

    pub fn n_samples(&self) -> u32 {
        self.n_samples
    }

    /// `max(SRTT + max(granularity, 4·RTTVAR), min_rto)`.
    pub fn rto(&self, min_rto: Duration, granularity: Duration) -> Duration {
        (self.estimate + granularity.max(self.variation * 4)).max(min_rto)
    }

    /// Forget every sample.
    pub fn reset(&mut self) {
        self.estimate = self.initial_estimate;
        self.variation = Duration::ZERO;
        self.n_samples = 0;
    }
}

/// Provenance of one transmitted range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttEntry {
    /// First sequence number of the range.
    pub seq: SequenceNumber,
    /// Bytes covered.
    pub count: u32,
    /// When it was sent.
    pub time: Duration,
    /// Whether any byte of it was sent more than once.
    pub retx: bool,
}

/// Ordered log of transmissions awaiting acknowledgement.
#[derive(Debug, Default)]
pub struct RttHistory {
    entries: VecDeque<RttEntry>,
}

impl RttHistory {
    /// Log a transmission.  A fresh range is appended; a retransmission marks
    /// the entry containing `seq` and stretches it to cover `seq + size`.
    pub fn record(&mut self, seq: SequenceNumber, size: u32, now: Duration, is_retransmission: bool) {
        if !is_retransmission {
            self.entries.push_back(RttEntry {
                seq,
                count: size,
                time: now,
                retx: false,
            });
            return;
        }
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| seq >= e.seq && seq < e.seq + e.count)
        {
            entry.retx = true;
            entry.count = (seq + size) - entry.seq;
        }
    }

    /// Take an RTT sample for cumulative ACK `ack` (Karn's algorithm).
    ///
    /// Only the oldest entry is measured, and only if it was never
    /// retransmitted and is fully covered by `ack`.  Every covered entry is
    /// dropped.
    pub fn sample(&mut self, ack: SequenceNumber, now: Duration) -> Option<Duration> {
        let mut rtt = None;
        if let Some(head) = self.entries.front() {
            if !head.retx && ack >= head.seq + head.count {
                rtt = Some(now.saturating_sub(head.time));
            }
        }
        while let Some(head) = self.entries.front() {
            if ack >= head.seq + head.count {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        rtt
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn first_sample_sets_estimate_and_half_variation() {
        let mut est = RttEstimator::new(Duration::from_secs(1));
        est.measurement(ms(100));
        assert_eq!(est.estimate(), ms(100));
        assert_eq!(est.variation(), ms(50));
        assert_eq!(est.n_samples(), 1);
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut est = RttEstimator::new(Duration::from_secs(1));
        est.measurement(ms(100));
        est.measurement(ms(180));
        // var = 3/4·50 + 1/4·80 = 57.5, srtt = 7/8·100 + 1/8·180 = 110
        assert_eq!(est.variation(), Duration::from_micros(57_500));
        assert_eq!(est.estimate(), ms(110));
    }

    #[test]
    fn rto_respects_min_and_granularity() {
        let mut est = RttEstimator::new(Duration::from_secs(1));
        assert_eq!(est.rto(Duration::from_secs(1), ms(1)), Duration::from_millis(1001));
        est.measurement(ms(10));
        assert_eq!(est.rto(Duration::from_secs(1), ms(1)), Duration::from_secs(1));
        assert_eq!(est.rto(ms(1), ms(1)), ms(30));
        est.reset();
        assert_eq!(est.n_samples(), 0);
        assert_eq!(est.estimate(), Duration::from_secs(1));
    }

    #[test]
    fn history_samples_only_clean_head() {
        let mut h = RttHistory::default();
        let s = SequenceNumber::new;
        h.record(s(1), 100, ms(0), false);
        h.record(s(101), 100, ms(5), false);
        assert_eq!(h.sample(s(101), ms(40)), Some(ms(40)));
        assert_eq!(h.len(), 1);

        h.record(s(101), 100, ms(50), true);
        assert_eq!(h.sample(s(201), ms(90)), None);
        assert!(h.is_empty());
    }

    #[test]
    fn retransmission_stretches_entry() {
        let mut h = RttHistory::default();
        let s = SequenceNumber::new;
        h.record(s(1), 100, ms(0), false);
        h.record(s(51), 200, ms(10), true);
        // Entry now covers [1, 251) and is marked retransmitted.
        assert_eq!(h.sample(s(101), ms(20)), None);
        assert_eq!(h.len(), 1);
        assert_eq!(h.sample(s(251), ms(30)), None);
        assert!(h.is_empty());
    }
}
