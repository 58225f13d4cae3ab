//! Retention and request matching shared by the sender and the queue.

use super::association::{ClockRateMap, PayloadTypeMap, RtxAssociation, SsrcMap};
use super::build_rtx_packet;
use super::packet_store::{PacketStore, StoreLimits};
use super::stats::RtxStatistics;
use crate::RetransmissionRequest;
use log::{debug, trace};
use rtp::sequence::Sequencer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub(crate) const DEFAULT_MAX_SIZE_PACKETS: usize = 100;

/// Result of matching a retransmission request against retained packets.
#[derive(Debug, PartialEq)]
pub(crate) enum RequestOutcome {
    /// No RTX association for the request's SSRC/payload type.
    Unknown,
    /// Associated stream, but the packet is not (or no longer) retained.
    Missing,
    /// The RTX packet answering the request.
    Retransmit(rtp::Packet),
}

/// Store, association and statistics of one sending element.
pub(crate) struct SenderState {
    association: RtxAssociation,
    limits: StoreLimits,
    rtx_seqnum_offset: Option<u16>,
    /// Retained packets per master SSRC.
    stores: HashMap<u32, PacketStore<rtp::Packet>>,
    /// Sequence numbers per RTX SSRC, shared by every master mapped onto it.
    sequencers: HashMap<u32, Sequencer>,
    stats: Arc<RtxStatistics>,
}

impl SenderState {
    pub(crate) fn new(
        association: RtxAssociation,
        limits: StoreLimits,
        rtx_seqnum_offset: Option<u16>,
        stats: Arc<RtxStatistics>,
    ) -> Self {
        Self {
            association,
            limits,
            rtx_seqnum_offset,
            stores: HashMap::new(),
            sequencers: HashMap::new(),
            stats,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.association.is_enabled()
    }

    pub(crate) fn association(&self) -> &RtxAssociation {
        &self.association
    }

    /// Retain a copy of an outgoing master packet if its stream has an RTX
    /// association. Returns whether the packet was retained.
    pub(crate) fn retain(&mut self, now: Instant, packet: &rtp::Packet) -> bool {
        let header = &packet.header;
        if self.association.rtx_pt_for(header.payload_type).is_none()
            || self.association.rtx_ssrc_for(header.ssrc).is_none()
        {
            return false;
        }

        let clock_rate = self.association.clock_rate_for(header.payload_type);
        let limits = self.limits;
        let store = self.stores.entry(header.ssrc).or_insert_with(|| {
            debug!("retaining packets of ssrc {}", header.ssrc);
            PacketStore::new(limits)
        });

        let evicted = store.insert(
            header.sequence_number,
            header.timestamp,
            now,
            packet.clone(),
            clock_rate,
        );
        if evicted > 0 {
            trace!(
                "ssrc {}: evicted {} packet(s), retaining {:?}",
                header.ssrc,
                evicted,
                store.range()
            );
        }

        true
    }

    /// Match a request against retained packets and build the RTX answer.
    pub(crate) fn handle_request(&mut self, request: &RetransmissionRequest) -> RequestOutcome {
        if self.association.rtx_pt_for(request.payload_type).is_none() {
            return RequestOutcome::Unknown;
        }
        let Some(rtx_ssrc) = self.association.rtx_ssrc_for(request.ssrc) else {
            return RequestOutcome::Unknown;
        };
        let Some(store) = self.stores.get(&request.ssrc) else {
            return RequestOutcome::Unknown;
        };

        self.stats.inc_rtx_requests();

        let Some(original) = store.get(request.seqnum) else {
            debug!(
                "ssrc {}: packet {} not retained, dropping request",
                request.ssrc, request.seqnum
            );
            return RequestOutcome::Missing;
        };

        let rtx_pt = self
            .association
            .rtx_pt_for(original.header.payload_type)
            .or_else(|| self.association.rtx_pt_for(request.payload_type))
            .unwrap_or_default();
        let rtx_seqnum_offset = self.rtx_seqnum_offset;
        let rtx_seq = self
            .sequencers
            .entry(rtx_ssrc)
            .or_insert_with(|| match rtx_seqnum_offset {
                Some(offset) => Sequencer::new_fixed(offset),
                None => Sequencer::new_random(),
            })
            .next_sequence_number();
        trace!(
            "ssrc {}: retransmitting {} as ssrc {} pt {} seq {}",
            request.ssrc, request.seqnum, rtx_ssrc, rtx_pt, rtx_seq
        );

        RequestOutcome::Retransmit(build_rtx_packet(original, rtx_ssrc, rtx_pt, rtx_seq))
    }

    /// Drop every retained packet.
    pub(crate) fn flush(&mut self) {
        for store in self.stores.values_mut() {
            store.clear();
        }
    }

    pub(crate) fn retained(&self, ssrc: u32) -> usize {
        self.stores.get(&ssrc).map_or(0, |s| s.len())
    }

    pub(crate) fn set_ssrc_map(&mut self, ssrc_map: SsrcMap) {
        // streams without a mapping any more are no longer answered
        self.stores.retain(|ssrc, _| ssrc_map.contains_key(ssrc));
        self.sequencers
            .retain(|rtx_ssrc, _| ssrc_map.values().any(|v| v == rtx_ssrc));
        self.association.set_ssrc_map(ssrc_map);
    }

    pub(crate) fn set_payload_type_map(&mut self, payload_type_map: PayloadTypeMap) {
        if payload_type_map.is_empty() {
            self.stores.clear();
            self.sequencers.clear();
        }
        self.association.set_payload_type_map(payload_type_map);
    }

    pub(crate) fn set_clock_rate_map(&mut self, clock_rate_map: ClockRateMap) {
        self.association.set_clock_rate_map(clock_rate_map);
    }

    pub(crate) fn set_limits(&mut self, limits: StoreLimits) {
        self.limits = limits;
        for store in self.stores.values_mut() {
            store.set_limits(limits);
        }
    }

    pub(crate) fn limits(&self) -> StoreLimits {
        self.limits
    }
}
