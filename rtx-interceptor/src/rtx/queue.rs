//! RTX Queue Interceptor - Answers retransmission requests inline with the outgoing stream.

use super::association::{ClockRateMap, PayloadTypeMap, RtxAssociation, SsrcMap};
use super::packet_store::StoreLimits;
use super::stats::RtxStatistics;
use super::stream::{DEFAULT_MAX_SIZE_PACKETS, RequestOutcome, SenderState};
use crate::{Interceptor, Packet, TaggedPacket, TaggedRequest};
use log::trace;
use shared::error::Error;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Builder for the RtxQueueInterceptor.
///
/// # Example
///
/// ```ignore
/// use rtx_interceptor::{Registry, RtxQueueBuilder};
///
/// let chain = Registry::new()
///     .with(RtxQueueBuilder::new()
///         .with_ssrc_map([(1234567, 7654321)].into())
///         .with_payload_type_map([(96, 106)].into())
///         .with_max_size_packets(200)
///         .build())
///     .build();
/// ```
pub struct RtxQueueBuilder<P> {
    ssrc_map: SsrcMap,
    payload_type_map: PayloadTypeMap,
    clock_rate_map: ClockRateMap,
    max_size_packets: usize,
    max_size_time: Duration,
    _phantom: PhantomData<P>,
}

impl<P> Default for RtxQueueBuilder<P> {
    fn default() -> Self {
        Self {
            ssrc_map: SsrcMap::new(),
            payload_type_map: PayloadTypeMap::new(),
            clock_rate_map: ClockRateMap::new(),
            max_size_packets: DEFAULT_MAX_SIZE_PACKETS,
            max_size_time: Duration::ZERO,
            _phantom: PhantomData,
        }
    }
}

impl<P> RtxQueueBuilder<P> {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map of master SSRC to RTX SSRC.
    pub fn with_ssrc_map(mut self, ssrc_map: SsrcMap) -> Self {
        self.ssrc_map = ssrc_map;
        self
    }

    /// Map of master payload type to RTX payload type. An empty map disables
    /// retransmission.
    pub fn with_payload_type_map(mut self, payload_type_map: PayloadTypeMap) -> Self {
        self.payload_type_map = payload_type_map;
        self
    }

    /// Map of master payload type to clock rate, used for time based eviction.
    pub fn with_clock_rate_map(mut self, clock_rate_map: ClockRateMap) -> Self {
        self.clock_rate_map = clock_rate_map;
        self
    }

    /// Maximum number of packets retained per SSRC, 0 for unlimited.
    pub fn with_max_size_packets(mut self, max_size_packets: usize) -> Self {
        self.max_size_packets = max_size_packets;
        self
    }

    /// Maximum age of retained packets, zero for unlimited.
    pub fn with_max_size_time(mut self, max_size_time: Duration) -> Self {
        self.max_size_time = max_size_time;
        self
    }

    /// Build the interceptor factory function.
    pub fn build(self) -> impl FnOnce(P) -> RtxQueueInterceptor<P> {
        move |inner| {
            let mut association = RtxAssociation::new(self.ssrc_map, self.payload_type_map);
            association.set_clock_rate_map(self.clock_rate_map);
            RtxQueueInterceptor::new(
                inner,
                association,
                StoreLimits::new(self.max_size_packets, self.max_size_time),
            )
        }
    }
}

/// Interceptor that retains outgoing packets and answers retransmission
/// requests synchronously.
///
/// Requests arrive through `handle_event`. Answers are held back until the
/// next `handle_write`, where they are emitted ahead of the new packet, in
/// the order the requests arrived. Requests for streams without an RTX
/// association are passed on to the inner interceptor.
pub struct RtxQueueInterceptor<P> {
    inner: P,

    state: SenderState,
    stats: Arc<RtxStatistics>,

    /// Retransmissions waiting for the next outgoing packet
    pending: VecDeque<TaggedPacket>,
    /// Output ahead of the inner interceptor's
    write_queue: VecDeque<TaggedPacket>,
}

impl<P> RtxQueueInterceptor<P> {
    fn new(inner: P, association: RtxAssociation, limits: StoreLimits) -> Self {
        let stats = RtxStatistics::new();
        Self {
            inner,
            state: SenderState::new(association, limits, None, Arc::clone(&stats)),
            stats,
            pending: VecDeque::new(),
            write_queue: VecDeque::new(),
        }
    }

    /// Retransmission counters of this interceptor.
    pub fn stats(&self) -> Arc<RtxStatistics> {
        Arc::clone(&self.stats)
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    pub fn association(&self) -> &RtxAssociation {
        self.state.association()
    }

    /// Number of packets currently retained for `ssrc`.
    pub fn retained(&self, ssrc: u32) -> usize {
        self.state.retained(ssrc)
    }

    /// Number of retransmissions waiting for the next outgoing packet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn set_ssrc_map(&mut self, ssrc_map: SsrcMap) {
        self.state.set_ssrc_map(ssrc_map);
    }

    pub fn set_payload_type_map(&mut self, payload_type_map: PayloadTypeMap) {
        if payload_type_map.is_empty() {
            self.pending.clear();
        }
        self.state.set_payload_type_map(payload_type_map);
    }

    pub fn set_clock_rate_map(&mut self, clock_rate_map: ClockRateMap) {
        self.state.set_clock_rate_map(clock_rate_map);
    }

    pub fn set_max_size_packets(&mut self, max_size_packets: usize) {
        let limits = self.state.limits();
        self.state
            .set_limits(StoreLimits::new(max_size_packets, limits.max_time));
    }

    pub fn set_max_size_time(&mut self, max_size_time: Duration) {
        let limits = self.state.limits();
        self.state
            .set_limits(StoreLimits::new(limits.max_packets, max_size_time));
    }
}

impl<P: Interceptor> RtxQueueInterceptor<P> {
    /// Move pending retransmissions to the output, behind whatever the inner
    /// interceptor already produced.
    fn release_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        while let Some(msg) = self.inner.poll_write() {
            self.write_queue.push_back(msg);
        }
        while let Some(msg) = self.pending.pop_front() {
            self.stats.inc_rtx_packets();
            self.write_queue.push_back(msg);
        }
    }
}

impl<P: Interceptor> sansio::Protocol<TaggedPacket, TaggedPacket, TaggedRequest>
    for RtxQueueInterceptor<P>
{
    type Rout = TaggedPacket;
    type Wout = TaggedPacket;
    type Eout = TaggedRequest;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedPacket) -> Result<(), Self::Error> {
        self.inner.handle_read(msg)
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.inner.poll_read()
    }

    fn handle_write(&mut self, msg: TaggedPacket) -> Result<(), Self::Error> {
        if self.state.is_enabled() {
            if let Packet::Rtp(ref rtp_packet) = msg.message {
                self.state.retain(msg.now, rtp_packet);
            }
            self.release_pending();
        }

        self.inner.handle_write(msg)
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        // First drain retransmitted packets
        if let Some(pkt) = self.write_queue.pop_front() {
            return Some(pkt);
        }
        self.inner.poll_write()
    }

    fn handle_event(&mut self, evt: TaggedRequest) -> Result<(), Self::Error> {
        if !self.state.is_enabled() {
            return self.inner.handle_event(evt);
        }

        match self.state.handle_request(&evt.message) {
            RequestOutcome::Unknown => self.inner.handle_event(evt),
            RequestOutcome::Missing => Ok(()),
            RequestOutcome::Retransmit(rtx) => {
                trace!(
                    "queued retransmission of {} for ssrc {}",
                    evt.message.seqnum, evt.message.ssrc
                );
                self.pending.push_back(evt.map(|_| Packet::Rtx(rtx)));
                Ok(())
            }
        }
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.inner.poll_event()
    }

    fn handle_timeout(&mut self, now: Self::Time) -> Result<(), Self::Error> {
        self.inner.handle_timeout(now)
    }

    fn poll_timeout(&mut self) -> Option<Self::Time> {
        self.inner.poll_timeout()
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.state.flush();
        self.pending.clear();
        self.write_queue.clear();
        self.inner.close()
    }
}

impl<P: Interceptor> Interceptor for RtxQueueInterceptor<P> {
    fn flush(&mut self) {
        self.state.flush();
        self.pending.clear();
        self.write_queue.clear();
        self.inner.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Registry, RetransmissionRequest};
    use bytes::Bytes;
    use sansio::Protocol;

    fn make_rtp_packet(ssrc: u32, pt: u8, seq: u16) -> TaggedPacket {
        TaggedPacket::new(
            Instant::now(),
            Packet::Rtp(rtp::Packet {
                header: rtp::header::Header {
                    ssrc,
                    payload_type: pt,
                    sequence_number: seq,
                    ..Default::default()
                },
                payload: Bytes::from(vec![0xAA, seq as u8]),
                ..Default::default()
            }),
        )
    }

    fn make_request(ssrc: u32, pt: u8, seq: u16) -> TaggedRequest {
        TaggedRequest::new(Instant::now(), RetransmissionRequest::new(ssrc, pt, seq))
    }

    fn build_queue() -> RtxQueueInterceptor<crate::NoopInterceptor> {
        Registry::new()
            .with(
                RtxQueueBuilder::new()
                    .with_ssrc_map([(1234567, 7654321)].into())
                    .with_payload_type_map([(96, 106)].into())
                    .build(),
            )
            .build()
    }

    #[test]
    fn test_rtx_queue_builder_defaults() {
        let queue = Registry::new().with(RtxQueueBuilder::default().build()).build();

        assert!(!queue.is_enabled());
        assert_eq!(queue.state.limits().max_packets, 100);
        assert!(queue.state.limits().max_time.is_zero());
    }

    #[test]
    fn test_rtx_queue_retransmits_before_next_packet() {
        let mut queue = build_queue();

        queue.handle_write(make_rtp_packet(1234567, 96, 0)).unwrap();
        assert_eq!(
            queue.poll_write().unwrap().message,
            make_rtp_packet(1234567, 96, 0).message
        );

        queue.handle_event(make_request(1234567, 96, 0)).unwrap();
        // nothing is emitted until the next packet
        assert!(queue.poll_write().is_none());
        assert_eq!(queue.pending(), 1);

        queue.handle_write(make_rtp_packet(1234567, 96, 1)).unwrap();

        let rtx = queue.poll_write().unwrap();
        assert!(rtx.message.is_retransmission());
        let rtx = rtx.message.into_rtp();
        assert_eq!(rtx.header.ssrc, 7654321);
        assert_eq!(rtx.header.payload_type, 106);
        assert_eq!(rtx.payload, Bytes::from_static(&[0x00, 0x00, 0xAA, 0x00]));

        let next = queue.poll_write().unwrap();
        assert!(!next.message.is_retransmission());
        assert_eq!(next.message.rtp().header.sequence_number, 1);
        assert!(queue.poll_write().is_none());

        let stats = queue.stats();
        assert_eq!(stats.num_rtx_requests(), 1);
        assert_eq!(stats.num_rtx_packets(), 1);
    }

    #[test]
    fn test_rtx_queue_keeps_request_order() {
        let mut queue = build_queue();

        for seq in 0..5u16 {
            queue.handle_write(make_rtp_packet(1234567, 96, seq)).unwrap();
        }
        while queue.poll_write().is_some() {}

        for seq in [3u16, 1, 4] {
            queue.handle_event(make_request(1234567, 96, seq)).unwrap();
        }
        queue.handle_write(make_rtp_packet(1234567, 96, 5)).unwrap();

        let mut osns = Vec::new();
        let mut rtx_seqs = Vec::new();
        while let Some(msg) = queue.poll_write() {
            if msg.message.is_retransmission() {
                let rtx = msg.message.into_rtp();
                osns.push(u16::from_be_bytes([rtx.payload[0], rtx.payload[1]]));
                rtx_seqs.push(rtx.header.sequence_number);
            }
        }
        assert_eq!(osns, vec![3, 1, 4]);
        assert_eq!(rtx_seqs[1], rtx_seqs[0].wrapping_add(1));
        assert_eq!(rtx_seqs[2], rtx_seqs[1].wrapping_add(1));
    }

    #[test]
    fn test_rtx_queue_preserves_earlier_output_order() {
        let mut queue = build_queue();

        queue.handle_write(make_rtp_packet(1234567, 96, 0)).unwrap();
        queue.handle_event(make_request(1234567, 96, 0)).unwrap();
        queue.handle_write(make_rtp_packet(1234567, 96, 1)).unwrap();

        // seq 0 was written before the request, so it leaves first
        let order: Vec<(bool, u16)> = std::iter::from_fn(|| queue.poll_write())
            .map(|m| (m.message.is_retransmission(), m.message.rtp().header.sequence_number))
            .collect();
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], (false, 0));
        assert!(order[1].0);
        assert_eq!(order[2], (false, 1));
    }

    #[test]
    fn test_rtx_queue_unknown_request_forwarded() {
        let mut queue = build_queue();
        queue.handle_write(make_rtp_packet(1234567, 96, 0)).unwrap();

        queue.handle_event(make_request(42, 96, 0)).unwrap();
        assert_eq!(
            queue.poll_event().unwrap().message,
            RetransmissionRequest::new(42, 96, 0)
        );
        assert_eq!(queue.stats().num_rtx_requests(), 0);
    }

    #[test]
    fn test_rtx_queue_missing_packet_dropped() {
        let mut queue = Registry::new()
            .with(
                RtxQueueBuilder::new()
                    .with_ssrc_map([(1234567, 7654321)].into())
                    .with_payload_type_map([(96, 106)].into())
                    .with_max_size_packets(2)
                    .build(),
            )
            .build();

        for seq in 0..3u16 {
            queue.handle_write(make_rtp_packet(1234567, 96, seq)).unwrap();
        }
        while queue.poll_write().is_some() {}

        queue.handle_event(make_request(1234567, 96, 0)).unwrap();
        assert!(queue.poll_event().is_none());
        assert_eq!(queue.pending(), 0);

        queue.handle_write(make_rtp_packet(1234567, 96, 3)).unwrap();
        assert!(!queue.poll_write().unwrap().message.is_retransmission());
        assert!(queue.poll_write().is_none());
        assert_eq!(queue.stats().num_rtx_packets(), 0);
    }

    #[test]
    fn test_rtx_queue_disabled_is_passthrough() {
        let mut queue = build_queue();
        queue.set_payload_type_map(PayloadTypeMap::new());

        let pkt = make_rtp_packet(1234567, 96, 0);
        queue.handle_write(pkt.clone()).unwrap();
        assert_eq!(queue.poll_write().unwrap(), pkt);
        assert_eq!(queue.retained(1234567), 0);

        queue.handle_event(make_request(1234567, 96, 0)).unwrap();
        assert!(queue.poll_event().is_some());
    }

    #[test]
    fn test_rtx_queue_flush_drops_pending() {
        let mut queue = build_queue();
        queue.handle_write(make_rtp_packet(1234567, 96, 0)).unwrap();
        queue.handle_event(make_request(1234567, 96, 0)).unwrap();

        queue.flush();
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.retained(1234567), 0);
        assert!(queue.poll_write().is_none());
        assert_eq!(queue.stats().num_rtx_requests(), 1);
    }
}
