use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Retransmission counters of one element instance.
///
/// Counters only ever grow. They can be read from any thread while the
/// streaming and dispatch paths update them.
#[derive(Debug, Default)]
pub struct RtxStatistics {
    num_rtx_requests: AtomicU64,
    num_rtx_packets: AtomicU64,
    num_rtx_assoc_packets: AtomicU64,
}

impl RtxStatistics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of retransmission requests handled.
    pub fn num_rtx_requests(&self) -> u64 {
        self.num_rtx_requests.load(Ordering::Relaxed)
    }

    /// Number of retransmission packets sent (sender, queue) or received (receiver).
    pub fn num_rtx_packets(&self) -> u64 {
        self.num_rtx_packets.load(Ordering::Relaxed)
    }

    /// Number of retransmission packets successfully associated with their
    /// master stream and rewritten (receiver only).
    pub fn num_rtx_assoc_packets(&self) -> u64 {
        self.num_rtx_assoc_packets.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_rtx_requests(&self) {
        self.num_rtx_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_rtx_packets(&self) {
        self.num_rtx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_rtx_assoc_packets(&self) {
        self.num_rtx_assoc_packets.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_statistics_concurrent_increments() {
        let stats = RtxStatistics::new();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.inc_rtx_requests();
                        stats.inc_rtx_packets();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.num_rtx_requests(), 4000);
        assert_eq!(stats.num_rtx_packets(), 4000);
        assert_eq!(stats.num_rtx_assoc_packets(), 0);
    }
}
