//! RTX Interceptor - RTP retransmission (RFC 4588) on top of a Sans-IO interceptor chain.
//!
//! This crate keeps a bounded history of sent RTP packets and answers
//! retransmission requests with RTX packets, and on the receiving side turns
//! RTX packets back into the packets they carry.
//!
//! # Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RtxSend`] | Retains outgoing packets and answers requests from its own dispatch task |
//! | [`RtxQueueInterceptor`] | Same retention and request handling, but retransmits inline before the next outgoing packet |
//! | [`RtxReceiveInterceptor`] | Unwraps incoming RTX packets into their original form and tracks requests |
//! | [`NoopInterceptor`] | Pass-through terminal for interceptor chains |
//!
//! # Design
//!
//! Interceptors wrap an inner `Interceptor` and exchange [`TaggedPacket`]s
//! through `handle_read`/`handle_write` and [`TaggedRequest`]s (retransmission
//! requests) through `handle_event`. A request an interceptor does not
//! recognize is passed on to its inner interceptor unchanged and comes out of
//! `poll_event`, which is how requests travel further upstream.
//!
//! ```text
//! handle_write:  packets towards the network (sender side)
//! handle_read:   packets from the network (receiver side)
//! handle_event:  retransmission requests, travelling upstream
//! ```
//!
//! [`RtxSend`] is not an interceptor: it owns a background dispatch task and
//! pushes packets into a [`PacketSink`], so that answering a burst of requests
//! never blocks the streaming thread.
//!
//! # Quick Start
//!
//! ```ignore
//! use rtx_interceptor::{Registry, RtxQueueBuilder, RtxReceiveBuilder};
//!
//! let sender = Registry::new()
//!     .with(RtxQueueBuilder::new()
//!         .with_ssrc_map([(1234567, 7654321)].into())
//!         .with_payload_type_map([(96, 106)].into())
//!         .with_max_size_packets(100)
//!         .build())
//!     .build();
//!
//! let receiver = Registry::new()
//!     .with(RtxReceiveBuilder::new()
//!         .with_payload_type_map([(96, 106)].into())
//!         .build())
//!     .build();
//! ```

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

use shared::TransportMessage;
use std::time::Instant;

mod noop;
mod registry;

pub(crate) mod rtx;

pub use noop::NoopInterceptor;
pub use registry::Registry;
pub use rtx::{
    RequestDisposition,
    association::{ClockRateMap, PayloadTypeMap, RtxAssociation, SsrcMap, parse_map},
    packet_store::StoreLimits,
    queue::{RtxQueueBuilder, RtxQueueInterceptor},
    receiver::{RtxReceiveBuilder, RtxReceiveInterceptor},
    sender::{PacketSink, RtxSend, RtxSendBuilder},
    stats::RtxStatistics,
};

/// RTP packet travelling through the chain.
///
/// The variant carries the retransmission flag: [`Packet::Rtx`] marks a packet
/// generated to answer a retransmission request. The flag is local to the
/// pipeline; on the wire both variants are plain RTP.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Regular RTP packet
    Rtp(rtp::Packet),
    /// Retransmitted RTP packet
    Rtx(rtp::Packet),
}

impl Packet {
    /// The RTP packet, regardless of the retransmission flag.
    pub fn rtp(&self) -> &rtp::Packet {
        match self {
            Packet::Rtp(p) | Packet::Rtx(p) => p,
        }
    }

    pub fn into_rtp(self) -> rtp::Packet {
        match self {
            Packet::Rtp(p) | Packet::Rtx(p) => p,
        }
    }

    pub fn is_retransmission(&self) -> bool {
        matches!(self, Packet::Rtx(_))
    }
}

/// Packet tagged with its send/receive time.
pub type TaggedPacket = TransportMessage<Packet>;

/// Request to retransmit one packet of a master stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetransmissionRequest {
    /// SSRC of the master stream
    pub ssrc: u32,
    /// Payload type of the master stream
    pub payload_type: u8,
    /// Sequence number of the requested packet
    pub seqnum: u16,
}

impl RetransmissionRequest {
    pub fn new(ssrc: u32, payload_type: u8, seqnum: u16) -> Self {
        Self {
            ssrc,
            payload_type: payload_type & 0x7F,
            seqnum,
        }
    }
}

/// Tagged retransmission request with the time it was issued.
pub type TaggedRequest = TransportMessage<RetransmissionRequest>;

/// Trait for RTX interceptors with fixed Protocol type parameters.
///
/// `Interceptor` requires implementors to also implement [`sansio::Protocol`]
/// with:
/// - `Rin`, `Win`, `Rout`, `Wout` = [`TaggedPacket`]
/// - `Ein`, `Eout` = [`TaggedRequest`]
/// - `Time` = [`Instant`]
/// - `Error` = [`shared::error::Error`]
pub trait Interceptor:
    sansio::Protocol<
        TaggedPacket,
        TaggedPacket,
        TaggedRequest,
        Rout = TaggedPacket,
        Wout = TaggedPacket,
        Eout = TaggedRequest,
        Time = Instant,
        Error = shared::error::Error,
    > + Sized
{
    /// Wrap this interceptor with another layer.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use rtx_interceptor::{NoopInterceptor, RtxReceiveBuilder};
    ///
    /// let chain = NoopInterceptor::new()
    ///     .with(RtxReceiveBuilder::new().build());
    /// ```
    fn with<O, F>(self, f: F) -> O
    where
        F: FnOnce(Self) -> O,
        O: Interceptor,
    {
        f(self)
    }

    /// Drop retained packets and pending retransmission state, as on a
    /// flush or a transition out of the streaming state. Statistics are kept.
    fn flush(&mut self);
}
