//! Bounded, sequence-ordered retention store with count and age eviction.

use rtp::sequence::{seq_diff, SEQ_NUM_HALF};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Retention bounds of a [`PacketStore`]. A zero value disables that bound.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Maximum number of retained entries.
    pub max_packets: usize,
    /// Maximum age of the oldest entry relative to the newest one.
    pub max_time: Duration,
}

impl StoreLimits {
    pub fn new(max_packets: usize, max_time: Duration) -> Self {
        Self {
            max_packets,
            max_time,
        }
    }
}

struct Entry<T> {
    seq: u16,
    rtp_time: u32,
    pushed_at: Instant,
    value: T,
}

/// Ordered collection keyed by 16-bit sequence number.
///
/// Entries are kept sorted in sequence order (wraparound aware), so eviction
/// always happens from the old end. The retained span never reaches half the
/// sequence number space, even when both configured bounds are zero. Age is measured either in RTP clock units
/// converted through the stream clock rate, or, when no clock rate is known,
/// by the time the entries were pushed.
pub(crate) struct PacketStore<T> {
    entries: VecDeque<Entry<T>>,
    limits: StoreLimits,
}

impl<T> PacketStore<T> {
    pub(crate) fn new(limits: StoreLimits) -> Self {
        Self {
            entries: VecDeque::new(),
            limits,
        }
    }

    /// New limits take effect on the next insertion.
    pub(crate) fn set_limits(&mut self, limits: StoreLimits) {
        self.limits = limits;
    }

    pub(crate) fn limits(&self) -> StoreLimits {
        self.limits
    }

    /// Insert `value` under `seq`, replacing any entry with the same sequence
    /// number, then prune. Returns the number of evicted entries.
    ///
    /// A sequence number half the sequence space or more behind the newest
    /// entry is not retained.
    pub(crate) fn insert(
        &mut self,
        seq: u16,
        rtp_time: u32,
        pushed_at: Instant,
        value: T,
        clock_rate: Option<u32>,
    ) -> usize {
        let entry = Entry {
            seq,
            rtp_time,
            pushed_at,
            value,
        };

        match self.entries.back() {
            None => self.entries.push_back(entry),
            Some(back) if seq_diff(seq, back.seq) > 0 => self.entries.push_back(entry),
            Some(back) if back.seq.wrapping_sub(seq) >= SEQ_NUM_HALF => return 0,
            Some(_) => match self.position(seq) {
                Ok(idx) => self.entries[idx] = entry,
                Err(idx) => self.entries.insert(idx, entry),
            },
        }

        self.prune(pushed_at, clock_rate)
    }

    pub(crate) fn get(&self, seq: u16) -> Option<&T> {
        let idx = self.position(seq).ok()?;
        Some(&self.entries[idx].value)
    }

    pub(crate) fn contains(&self, seq: u16) -> bool {
        self.position(seq).is_ok()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence numbers of the oldest and newest retained entries.
    pub(crate) fn range(&self) -> Option<(u16, u16)> {
        Some((self.entries.front()?.seq, self.entries.back()?.seq))
    }

    fn position(&self, seq: u16) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|e| seq_diff(e.seq, seq).cmp(&0))
    }

    fn prune(&mut self, now: Instant, clock_rate: Option<u32>) -> usize {
        let mut evicted = 0;

        while self.span() >= SEQ_NUM_HALF {
            self.entries.pop_front();
            evicted += 1;
        }

        if self.limits.max_packets > 0 {
            while self.entries.len() > self.limits.max_packets {
                self.entries.pop_front();
                evicted += 1;
            }
        }

        if !self.limits.max_time.is_zero() {
            while self.entries.len() > 1 && self.oldest_age(now, clock_rate) > self.limits.max_time
            {
                self.entries.pop_front();
                evicted += 1;
            }
        }

        evicted
    }

    fn span(&self) -> u16 {
        match (self.entries.front(), self.entries.back()) {
            (Some(front), Some(back)) => back.seq.wrapping_sub(front.seq),
            _ => 0,
        }
    }

    fn oldest_age(&self, now: Instant, clock_rate: Option<u32>) -> Duration {
        let (Some(front), Some(back)) = (self.entries.front(), self.entries.back()) else {
            return Duration::ZERO;
        };

        match clock_rate {
            Some(rate) if rate > 0 => {
                let ticks = back.rtp_time.wrapping_sub(front.rtp_time) as i32;
                if ticks <= 0 {
                    Duration::ZERO
                } else {
                    Duration::from_nanos((ticks as u64 * 1_000_000_000).div_ceil(rate as u64))
                }
            }
            _ => now.saturating_duration_since(front.pushed_at),
        }
    }
}
