//! RTX Receive Interceptor - Restores incoming RTX packets to the packets they carry.

use super::association::{PayloadTypeMap, RtxAssociation, SsrcMap};
use super::split_rtx_payload;
use super::stats::RtxStatistics;
use crate::{Interceptor, Packet, TaggedPacket, TaggedRequest};
use log::{debug, trace};
use shared::error::Error;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a request keeps its sequence number reserved for its SSRC while
/// the RTX SSRC of that stream is unknown.
const ASSOC_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for the RtxReceiveInterceptor.
///
/// # Example
///
/// ```ignore
/// use rtx_interceptor::{Registry, RtxReceiveBuilder};
///
/// let chain = Registry::new()
///     .with(RtxReceiveBuilder::new()
///         .with_payload_type_map([(96, 106)].into())
///         .build())
///     .build();
/// ```
pub struct RtxReceiveBuilder<P> {
    ssrc_map: SsrcMap,
    payload_type_map: PayloadTypeMap,
    _phantom: PhantomData<P>,
}

impl<P> Default for RtxReceiveBuilder<P> {
    fn default() -> Self {
        Self {
            ssrc_map: SsrcMap::new(),
            payload_type_map: PayloadTypeMap::new(),
            _phantom: PhantomData,
        }
    }
}

impl<P> RtxReceiveBuilder<P> {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Known master SSRC to RTX SSRC pairs. Optional, associations are also
    /// learned from retransmission requests.
    pub fn with_ssrc_map(mut self, ssrc_map: SsrcMap) -> Self {
        self.ssrc_map = ssrc_map;
        self
    }

    /// Map of master payload type to RTX payload type. An empty map disables
    /// retransmission handling.
    pub fn with_payload_type_map(mut self, payload_type_map: PayloadTypeMap) -> Self {
        self.payload_type_map = payload_type_map;
        self
    }

    /// Build the interceptor factory function.
    pub fn build(self) -> impl FnOnce(P) -> RtxReceiveInterceptor<P> {
        move |inner| {
            RtxReceiveInterceptor::new(
                inner,
                RtxAssociation::new(self.ssrc_map, self.payload_type_map),
            )
        }
    }
}

/// A request that went upstream, not yet matched by an RTX packet.
#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    ssrc: u32,
    at: Instant,
}

/// Interceptor that turns incoming RTX packets back into master packets.
///
/// Packets with a payload type listed as an RTX payload type are unwrapped:
/// SSRC, payload type and sequence number are restored and the original
/// sequence number prefix is stripped from the payload. Everything else is
/// passed through.
///
/// The RTX SSRC of a master stream comes from the configured SSRC map, or is
/// learned from the first RTX packet that answers a pending request. Requests
/// travel through `handle_event` and are forwarded to the inner interceptor,
/// except when another stream already has a request pending for the same
/// sequence number: an RTX packet for that sequence number could then not be
/// told apart, so the later request is dropped.
pub struct RtxReceiveInterceptor<P> {
    inner: P,

    association: RtxAssociation,
    stats: Arc<RtxStatistics>,

    /// RTX SSRC -> master SSRC, learned
    learned: HashMap<u32, u32>,
    /// Requested sequence number -> requesting master stream
    pending: HashMap<u16, PendingRequest>,
}

impl<P> RtxReceiveInterceptor<P> {
    fn new(inner: P, association: RtxAssociation) -> Self {
        Self {
            inner,
            association,
            stats: RtxStatistics::new(),
            learned: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Retransmission counters of this interceptor.
    pub fn stats(&self) -> Arc<RtxStatistics> {
        Arc::clone(&self.stats)
    }

    pub fn is_enabled(&self) -> bool {
        self.association.is_enabled()
    }

    pub fn association(&self) -> &RtxAssociation {
        &self.association
    }

    /// Master SSRC an RTX SSRC is associated with, configured or learned.
    pub fn master_ssrc_for(&self, rtx_ssrc: u32) -> Option<u32> {
        self.learned
            .get(&rtx_ssrc)
            .copied()
            .or_else(|| self.association.master_ssrc_for(rtx_ssrc))
    }

    /// Number of requests not yet matched by an RTX packet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn set_ssrc_map(&mut self, ssrc_map: SsrcMap) {
        self.association.set_ssrc_map(ssrc_map);
    }

    pub fn set_payload_type_map(&mut self, payload_type_map: PayloadTypeMap) {
        if payload_type_map.is_empty() {
            self.reset();
        }
        self.association.set_payload_type_map(payload_type_map);
    }

    fn reset(&mut self) {
        self.learned.clear();
        self.pending.clear();
    }

    fn is_master_associated(&self, master_ssrc: u32) -> bool {
        self.association.rtx_ssrc_for(master_ssrc).is_some()
            || self.learned.values().any(|&m| m == master_ssrc)
    }

    fn purge_pending(&mut self, now: Instant) {
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.at) < ASSOC_TIMEOUT);
    }

    /// Record a request. Returns false when it must not go upstream.
    fn track_request(&mut self, now: Instant, ssrc: u32, seqnum: u16) -> bool {
        self.purge_pending(now);

        if self.is_master_associated(ssrc) {
            return true;
        }

        if let Some(p) = self.pending.get(&seqnum) {
            if p.ssrc != ssrc {
                debug!(
                    "dropping request for {} of ssrc {}, ssrc {} requested it first",
                    seqnum, ssrc, p.ssrc
                );
                return false;
            }
        }

        self.pending.insert(seqnum, PendingRequest { ssrc, at: now });
        true
    }

    /// Master SSRC for an incoming RTX packet, learning the association from
    /// a pending request if needed.
    fn resolve_master(&mut self, rtx_ssrc: u32, osn: u16) -> Option<u32> {
        if let Some(master_ssrc) = self.master_ssrc_for(rtx_ssrc) {
            if self
                .pending
                .get(&osn)
                .is_some_and(|p| p.ssrc == master_ssrc)
            {
                self.pending.remove(&osn);
            }
            return Some(master_ssrc);
        }

        let p = self.pending.get(&osn).copied()?;
        if self.is_master_associated(p.ssrc) {
            // master already has another RTX stream
            return None;
        }

        debug!("associated rtx ssrc {} with ssrc {}", rtx_ssrc, p.ssrc);
        self.pending.remove(&osn);
        self.learned.insert(rtx_ssrc, p.ssrc);
        Some(p.ssrc)
    }
}

impl<P: Interceptor> sansio::Protocol<TaggedPacket, TaggedPacket, TaggedRequest>
    for RtxReceiveInterceptor<P>
{
    type Rout = TaggedPacket;
    type Wout = TaggedPacket;
    type Eout = TaggedRequest;
    type Error = Error;
    type Time = Instant;

    fn handle_read(&mut self, msg: TaggedPacket) -> Result<(), Self::Error> {
        if !self.association.is_enabled() {
            return self.inner.handle_read(msg);
        }

        let header = &msg.message.rtp().header;
        let Some(master_pt) = self.association.master_pt_for(header.payload_type) else {
            return self.inner.handle_read(msg);
        };
        let rtx_ssrc = header.ssrc;

        let Some((osn, _)) = split_rtx_payload(&msg.message.rtp().payload) else {
            debug!("dropping rtx packet without original sequence number from ssrc {rtx_ssrc}");
            return Ok(());
        };

        self.stats.inc_rtx_packets();

        let Some(master_ssrc) = self.resolve_master(rtx_ssrc, osn) else {
            debug!("dropping rtx packet {osn} of unassociated ssrc {rtx_ssrc}");
            return Ok(());
        };

        self.stats.inc_rtx_assoc_packets();
        trace!("restored packet {osn} of ssrc {master_ssrc} from rtx ssrc {rtx_ssrc}");

        self.inner.handle_read(msg.map(|message| {
            let mut packet = message.into_rtp();
            packet.header.ssrc = master_ssrc;
            packet.header.payload_type = master_pt;
            packet.header.sequence_number = osn;
            packet.payload = packet.payload.slice(super::OSN_LENGTH..);
            Packet::Rtp(packet)
        }))
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.inner.poll_read()
    }

    fn handle_write(&mut self, msg: TaggedPacket) -> Result<(), Self::Error> {
        self.inner.handle_write(msg)
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.inner.poll_write()
    }

    fn handle_event(&mut self, evt: TaggedRequest) -> Result<(), Self::Error> {
        if !self.association.is_enabled() {
            return self.inner.handle_event(evt);
        }

        self.stats.inc_rtx_requests();

        if self.track_request(evt.now, evt.message.ssrc, evt.message.seqnum) {
            self.inner.handle_event(evt)
        } else {
            Ok(())
        }
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.inner.poll_event()
    }

    fn handle_timeout(&mut self, now: Self::Time) -> Result<(), Self::Error> {
        self.purge_pending(now);
        self.inner.handle_timeout(now)
    }

    fn poll_timeout(&mut self) -> Option<Self::Time> {
        self.inner.poll_timeout()
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.reset();
        self.inner.close()
    }
}

impl<P: Interceptor> Interceptor for RtxReceiveInterceptor<P> {
    fn flush(&mut self) {
        self.reset();
        self.inner.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NoopInterceptor, Registry, RetransmissionRequest};
    use bytes::Bytes;
    use sansio::Protocol;

    fn make_rtx_packet(now: Instant, rtx_ssrc: u32, payload: &'static [u8]) -> TaggedPacket {
        TaggedPacket::new(
            now,
            Packet::Rtp(rtp::Packet {
                header: rtp::header::Header {
                    ssrc: rtx_ssrc,
                    payload_type: 106,
                    sequence_number: 500,
                    timestamp: 9000,
                    marker: true,
                    ..Default::default()
                },
                payload: Bytes::from_static(payload),
                ..Default::default()
            }),
        )
    }

    fn make_request(now: Instant, ssrc: u32, seq: u16) -> TaggedRequest {
        TaggedRequest::new(now, RetransmissionRequest::new(ssrc, 96, seq))
    }

    fn build_receiver() -> RtxReceiveInterceptor<NoopInterceptor> {
        Registry::new()
            .with(
                RtxReceiveBuilder::new()
                    .with_payload_type_map([(96, 106)].into())
                    .build(),
            )
            .build()
    }

    #[test]
    fn test_rtx_receive_restores_packet() {
        let now = Instant::now();
        let mut receiver = build_receiver();

        receiver.handle_event(make_request(now, 1234567, 7)).unwrap();
        assert!(receiver.poll_event().is_some());
        assert_eq!(receiver.pending(), 1);

        receiver
            .handle_read(make_rtx_packet(now, 7654321, &[0x00, 0x07, 1, 2, 3]))
            .unwrap();

        let restored = receiver.poll_read().unwrap();
        assert!(!restored.message.is_retransmission());
        let restored = restored.message.into_rtp();
        assert_eq!(restored.header.ssrc, 1234567);
        assert_eq!(restored.header.payload_type, 96);
        assert_eq!(restored.header.sequence_number, 7);
        assert_eq!(restored.header.timestamp, 9000);
        assert!(restored.header.marker);
        assert_eq!(restored.payload, Bytes::from_static(&[1, 2, 3]));

        assert_eq!(receiver.master_ssrc_for(7654321), Some(1234567));
        assert_eq!(receiver.pending(), 0);

        let stats = receiver.stats();
        assert_eq!(stats.num_rtx_requests(), 1);
        assert_eq!(stats.num_rtx_packets(), 1);
        assert_eq!(stats.num_rtx_assoc_packets(), 1);
    }

    #[test]
    fn test_rtx_receive_passes_normal_packets() {
        let now = Instant::now();
        let mut receiver = build_receiver();

        let mut pkt = make_rtx_packet(now, 1234567, &[0x00]);
        if let Packet::Rtp(ref mut p) = pkt.message {
            p.header.payload_type = 96;
        }
        receiver.handle_read(pkt.clone()).unwrap();
        assert_eq!(receiver.poll_read().unwrap(), pkt);
        assert_eq!(receiver.stats().num_rtx_packets(), 0);
    }

    #[test]
    fn test_rtx_receive_drops_undersized() {
        let now = Instant::now();
        let mut receiver = build_receiver();
        receiver.handle_event(make_request(now, 1234567, 0)).unwrap();

        receiver
            .handle_read(make_rtx_packet(now, 7654321, &[0x00]))
            .unwrap();
        receiver.handle_read(make_rtx_packet(now, 7654321, &[])).unwrap();

        assert!(receiver.poll_read().is_none());
        let stats = receiver.stats();
        assert_eq!(stats.num_rtx_packets(), 0);
        assert_eq!(stats.num_rtx_assoc_packets(), 0);
    }

    #[test]
    fn test_rtx_receive_drops_unassociated() {
        let now = Instant::now();
        let mut receiver = build_receiver();

        receiver
            .handle_read(make_rtx_packet(now, 7654321, &[0x00, 0x03, 9]))
            .unwrap();

        assert!(receiver.poll_read().is_none());
        let stats = receiver.stats();
        assert_eq!(stats.num_rtx_packets(), 1);
        assert_eq!(stats.num_rtx_assoc_packets(), 0);
    }

    #[test]
    fn test_rtx_receive_configured_ssrc_map() {
        let now = Instant::now();
        let mut receiver = Registry::new()
            .with(
                RtxReceiveBuilder::new()
                    .with_ssrc_map([(1234567, 7654321)].into())
                    .with_payload_type_map([(96, 106)].into())
                    .build(),
            )
            .build();

        receiver
            .handle_read(make_rtx_packet(now, 7654321, &[0x00, 0x03, 9]))
            .unwrap();
        let restored = receiver.poll_read().unwrap().message.into_rtp();
        assert_eq!(restored.header.ssrc, 1234567);
        assert_eq!(restored.header.sequence_number, 3);
    }

    #[test]
    fn test_rtx_receive_rejects_ambiguous_request() {
        let now = Instant::now();
        let mut receiver = build_receiver();

        receiver.handle_event(make_request(now, 1111, 5)).unwrap();
        assert!(receiver.poll_event().is_some());

        // same sequence number requested for another stream
        receiver.handle_event(make_request(now, 2222, 5)).unwrap();
        assert!(receiver.poll_event().is_none());

        // another sequence number is fine
        receiver.handle_event(make_request(now, 2222, 6)).unwrap();
        assert!(receiver.poll_event().is_some());

        // once the old request timed out the sequence number is free again
        let later = now + ASSOC_TIMEOUT;
        receiver.handle_event(make_request(later, 2222, 5)).unwrap();
        assert!(receiver.poll_event().is_some());

        assert_eq!(receiver.stats().num_rtx_requests(), 4);
    }

    #[test]
    fn test_rtx_receive_associated_master_skips_check() {
        let now = Instant::now();
        let mut receiver = build_receiver();

        receiver.handle_event(make_request(now, 1111, 5)).unwrap();
        receiver
            .handle_read(make_rtx_packet(now, 9999, &[0x00, 0x05]))
            .unwrap();
        assert_eq!(receiver.master_ssrc_for(9999), Some(1111));
        receiver.handle_event(make_request(now, 2222, 6)).unwrap();
        while receiver.poll_event().is_some() {}

        // 1111 already has an rtx stream, its requests are not ambiguous
        receiver.handle_event(make_request(now, 1111, 6)).unwrap();
        assert!(receiver.poll_event().is_some());
    }

    #[test]
    fn test_rtx_receive_master_bound_once() {
        let now = Instant::now();
        let mut receiver = build_receiver();

        receiver.handle_event(make_request(now, 1111, 5)).unwrap();
        receiver
            .handle_read(make_rtx_packet(now, 9999, &[0x00, 0x05]))
            .unwrap();
        assert!(receiver.poll_read().is_some());

        // the second rtx ssrc cannot take over 1111
        receiver.handle_event(make_request(now, 1111, 6)).unwrap();
        receiver
            .handle_read(make_rtx_packet(now, 8888, &[0x00, 0x06]))
            .unwrap();
        assert!(receiver.poll_read().is_none());
        assert_eq!(receiver.master_ssrc_for(8888), None);
    }

    #[test]
    fn test_rtx_receive_disabled_passthrough() {
        let now = Instant::now();
        let mut receiver = build_receiver();
        receiver.set_payload_type_map(PayloadTypeMap::new());

        let pkt = make_rtx_packet(now, 7654321, &[0x00, 0x01]);
        receiver.handle_read(pkt.clone()).unwrap();
        assert_eq!(receiver.poll_read().unwrap(), pkt);

        receiver.handle_event(make_request(now, 1, 1)).unwrap();
        assert!(receiver.poll_event().is_some());
        assert_eq!(receiver.stats().num_rtx_requests(), 0);
    }

    #[test]
    fn test_rtx_receive_flush_forgets_state() {
        let now = Instant::now();
        let mut receiver = build_receiver();
        receiver.handle_event(make_request(now, 1111, 5)).unwrap();
        receiver
            .handle_read(make_rtx_packet(now, 9999, &[0x00, 0x05]))
            .unwrap();
        receiver.handle_event(make_request(now, 1111, 6)).unwrap();

        receiver.flush();
        assert_eq!(receiver.pending(), 0);
        assert_eq!(receiver.master_ssrc_for(9999), None);
        assert_eq!(receiver.stats().num_rtx_assoc_packets(), 1);
    }
}
