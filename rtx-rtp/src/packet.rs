use crate::header::{Header, PADDING_SHIFT};
use bytes::{Buf, BufMut, Bytes};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};
use std::fmt;

/// Packet represents an RTP Packet
#[derive(Debug, Eq, PartialEq, Default, Clone)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
    /// Number of padding bytes, including the trailing count byte. Zero means no padding.
    pub padding_size: u8,
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = "RTP PACKET:\n".to_string();

        out += format!("\tVersion: {}\n", self.header.version).as_str();
        out += format!("\tMarker: {}\n", self.header.marker).as_str();
        out += format!("\tPayload Type: {}\n", self.header.payload_type).as_str();
        out += format!("\tSequence Number: {}\n", self.header.sequence_number).as_str();
        out += format!("\tTimestamp: {}\n", self.header.timestamp).as_str();
        out += format!("\tSSRC: {} ({:x})\n", self.header.ssrc, self.header.ssrc).as_str();
        out += format!("\tPayload Length: {}\n", self.payload.len()).as_str();

        write!(f, "{out}")
    }
}

impl Unmarshal for Packet {
    /// Unmarshal parses the passed byte slice and stores the result in the Packet this method is called upon
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        let payload_len = raw_packet.remaining();
        let mut payload = raw_packet.copy_to_bytes(payload_len);

        let padding_size = if header.padding {
            if payload.is_empty() {
                return Err(Error::ErrTooShortRtp);
            }
            let padding_size = payload[payload.len() - 1];
            if padding_size == 0 || padding_size as usize > payload.len() {
                return Err(Error::ErrInvalidPadding);
            }
            payload.truncate(payload.len() - padding_size as usize);
            padding_size
        } else {
            0
        };

        Ok(Packet {
            header,
            payload,
            padding_size,
        })
    }
}

impl MarshalSize for Packet {
    /// MarshalSize returns the size of the packet once marshaled.
    fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len() + self.padding_size as usize
    }
}

impl Marshal for Packet {
    /// MarshalTo serializes the packet and writes to the buffer.
    fn marshal_to(&self, mut buf: &mut [u8]) -> Result<usize> {
        if buf.remaining_mut() < self.marshal_size() {
            return Err(Error::ErrBufferTooSmall);
        }

        let n = self.header.marshal_to(buf)?;
        // the padding bit follows the actual padding carried by this packet
        if self.padding_size > 0 {
            buf[0] |= 1 << PADDING_SHIFT;
        } else {
            buf[0] &= !(1 << PADDING_SHIFT);
        }
        buf = &mut buf[n..];
        buf.put_slice(&self.payload);

        if self.padding_size > 0 {
            for _ in 0..self.padding_size - 1 {
                buf.put_u8(0);
            }
            buf.put_u8(self.padding_size);
        }

        Ok(n + self.payload.len() + self.padding_size as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_unmarshal_marshal() -> Result<()> {
        let raw: &[u8] = &[
            0x90, 0xe0, 0x69, 0x8f, 0xd9, 0xc2, 0x93, 0xda, 0x1c, 0x64, 0x27, 0x82, 0xBE, 0xDE,
            0x00, 0x01, 0x10, 0xAA, 0x00, 0x00, 0x98, 0x36, 0xbe, 0x88, 0x9e,
        ];
        let mut buf = raw;
        let packet = Packet::unmarshal(&mut buf)?;

        assert_eq!(packet.header.sequence_number, 27023);
        assert_eq!(
            packet.payload,
            Bytes::from_static(&[0x98, 0x36, 0xbe, 0x88, 0x9e])
        );
        assert_eq!(packet.padding_size, 0);
        assert_eq!(packet.marshal_size(), raw.len());
        assert_eq!(packet.marshal()?, Bytes::from_static(raw));

        Ok(())
    }

    #[test]
    fn test_packet_padding() -> Result<()> {
        let raw: &[u8] = &[
            0xa0, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x11, 0x22,
            0x00, 0x00, 0x03,
        ];
        let mut buf = raw;
        let packet = Packet::unmarshal(&mut buf)?;

        assert!(packet.header.padding);
        assert_eq!(packet.padding_size, 3);
        assert_eq!(packet.payload, Bytes::from_static(&[0x11, 0x22]));
        assert_eq!(packet.marshal()?, Bytes::from_static(raw));

        Ok(())
    }

    #[test]
    fn test_packet_invalid_padding() {
        let mut buf: &[u8] = &[
            0xa0, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x11, 0x09,
        ];
        assert_eq!(Packet::unmarshal(&mut buf), Err(Error::ErrInvalidPadding));

        let mut buf: &[u8] = &[
            0xa0, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03,
        ];
        assert_eq!(Packet::unmarshal(&mut buf), Err(Error::ErrTooShortRtp));
    }

    #[test]
    fn test_packet_marshal_clears_stale_padding_bit() -> Result<()> {
        let packet = Packet {
            header: Header {
                padding: true,
                payload_type: 96,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x01]),
            padding_size: 0,
        };
        let raw = packet.marshal()?;
        assert_eq!(raw[0] & (1 << PADDING_SHIFT), 0);
        assert_eq!(raw.len(), 13);

        Ok(())
    }
}
