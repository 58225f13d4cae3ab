//! RTX (RFC 4588) retransmission components.
//!
//! A retransmission packet is sent on its own SSRC and payload type, with its
//! own sequence number space. Its payload starts with the original sequence
//! number (OSN) of the packet it carries:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         RTP Header                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            OSN                |                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               |
//! |                  Original RTP Packet Payload                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! # References
//!
//! - [RFC 4588](https://datatracker.ietf.org/doc/html/rfc4588) - RTP Retransmission Payload Format

pub(crate) mod association;
pub(crate) mod packet_store;
pub(crate) mod queue;
pub(crate) mod receiver;
pub(crate) mod sender;
pub(crate) mod stats;
pub(crate) mod stream;

use crate::TaggedRequest;
use bytes::{Bytes, BytesMut};

/// Length of the original sequence number prefix of an RTX payload.
pub(crate) const OSN_LENGTH: usize = 2;

/// What a sender did with a retransmission request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestDisposition {
    /// The request belonged to a stream handled here. It was answered, or
    /// dropped because the packet is no longer retained.
    Consumed,
    /// The request is for a stream not handled here and must travel further
    /// upstream unchanged.
    Forward(TaggedRequest),
}

/// Build the RTX packet carrying `original`.
///
/// Timestamp, marker, CSRCs and header extensions are copied; padding is not.
pub(crate) fn build_rtx_packet(
    original: &rtp::Packet,
    rtx_ssrc: u32,
    rtx_payload_type: u8,
    rtx_sequence_number: u16,
) -> rtp::Packet {
    let mut payload = BytesMut::with_capacity(OSN_LENGTH + original.payload.len());
    payload.extend_from_slice(&original.header.sequence_number.to_be_bytes());
    payload.extend_from_slice(&original.payload);

    rtp::Packet {
        header: rtp::header::Header {
            padding: false,
            ssrc: rtx_ssrc,
            payload_type: rtx_payload_type,
            sequence_number: rtx_sequence_number,
            ..original.header.clone()
        },
        payload: payload.freeze(),
        padding_size: 0,
    }
}

/// Split an RTX payload into the original sequence number and the original
/// payload. Returns `None` when the payload cannot hold the sequence number.
pub(crate) fn split_rtx_payload(payload: &Bytes) -> Option<(u16, Bytes)> {
    if payload.len() < OSN_LENGTH {
        return None;
    }
    let osn = u16::from_be_bytes([payload[0], payload[1]]);
    Some((osn, payload.slice(OSN_LENGTH..)))
}
