//! Master stream to retransmission stream mappings.

use shared::error::{Error, Result};
use std::collections::HashMap;
use std::hash::Hash;
use std::str::FromStr;

/// Master SSRC -> RTX SSRC.
pub type SsrcMap = HashMap<u32, u32>;
/// Master payload type -> RTX payload type.
pub type PayloadTypeMap = HashMap<u8, u8>;
/// Master payload type -> clock rate in Hz.
pub type ClockRateMap = HashMap<u8, u32>;

/// Parse a `key:value` list such as `"96:106, 97:107"` into a map.
///
/// Entries are separated by `,` or `;`. An empty string gives an empty map.
pub fn parse_map<K, V>(s: &str) -> Result<HashMap<K, V>>
where
    K: FromStr + Eq + Hash,
    V: FromStr,
{
    let mut map = HashMap::new();
    for entry in s.split([',', ';']).map(str::trim).filter(|e| !e.is_empty()) {
        let (k, v) = entry
            .split_once(['=', ':'])
            .ok_or_else(|| Error::ErrInvalidMapEntry(entry.to_string()))?;
        let k = k
            .trim()
            .parse::<K>()
            .map_err(|_| Error::ErrInvalidMapEntry(entry.to_string()))?;
        let v = v
            .trim()
            .parse::<V>()
            .map_err(|_| Error::ErrInvalidMapEntry(entry.to_string()))?;
        map.insert(k, v);
    }
    Ok(map)
}

/// Configured association between master and retransmission streams.
///
/// An empty payload type map disables retransmission entirely.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RtxAssociation {
    ssrc_map: SsrcMap,
    payload_type_map: PayloadTypeMap,
    clock_rate_map: ClockRateMap,
    /// Reverse of `payload_type_map`.
    master_pt: HashMap<u8, u8>,
    /// Reverse of `ssrc_map`.
    master_ssrc: HashMap<u32, u32>,
}

impl RtxAssociation {
    pub fn new(ssrc_map: SsrcMap, payload_type_map: PayloadTypeMap) -> Self {
        let mut association = Self::default();
        association.set_ssrc_map(ssrc_map);
        association.set_payload_type_map(payload_type_map);
        association
    }

    pub fn rtx_ssrc_for(&self, master_ssrc: u32) -> Option<u32> {
        self.ssrc_map.get(&master_ssrc).copied()
    }

    pub fn rtx_pt_for(&self, master_pt: u8) -> Option<u8> {
        self.payload_type_map.get(&master_pt).copied()
    }

    pub fn master_ssrc_for(&self, rtx_ssrc: u32) -> Option<u32> {
        self.master_ssrc.get(&rtx_ssrc).copied()
    }

    pub fn master_pt_for(&self, rtx_pt: u8) -> Option<u8> {
        self.master_pt.get(&rtx_pt).copied()
    }

    pub fn is_rtx_pt(&self, pt: u8) -> bool {
        self.master_pt.contains_key(&pt)
    }

    pub fn clock_rate_for(&self, master_pt: u8) -> Option<u32> {
        self.clock_rate_map.get(&master_pt).copied()
    }

    pub fn is_enabled(&self) -> bool {
        !self.payload_type_map.is_empty()
    }

    pub fn ssrc_map(&self) -> &SsrcMap {
        &self.ssrc_map
    }

    pub fn payload_type_map(&self) -> &PayloadTypeMap {
        &self.payload_type_map
    }

    pub fn clock_rate_map(&self) -> &ClockRateMap {
        &self.clock_rate_map
    }

    pub fn set_ssrc_map(&mut self, ssrc_map: SsrcMap) {
        self.master_ssrc = ssrc_map.iter().map(|(&m, &r)| (r, m)).collect();
        self.ssrc_map = ssrc_map;
    }

    pub fn set_payload_type_map(&mut self, payload_type_map: PayloadTypeMap) {
        self.master_pt = payload_type_map
            .iter()
            .map(|(&m, &r)| (r & 0x7F, m))
            .collect();
        self.payload_type_map = payload_type_map
            .into_iter()
            .map(|(m, r)| (m & 0x7F, r & 0x7F))
            .collect();
    }

    pub fn set_clock_rate_map(&mut self, clock_rate_map: ClockRateMap) {
        self.clock_rate_map = clock_rate_map;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_association_lookups() {
        let association = RtxAssociation::new(
            SsrcMap::from([(1234567, 7654321)]),
            PayloadTypeMap::from([(96, 106)]),
        );

        assert!(association.is_enabled());
        assert_eq!(association.rtx_ssrc_for(1234567), Some(7654321));
        assert_eq!(association.rtx_ssrc_for(1), None);
        assert_eq!(association.rtx_pt_for(96), Some(106));
        assert_eq!(association.rtx_pt_for(97), None);
        assert_eq!(association.master_ssrc_for(7654321), Some(1234567));
        assert_eq!(association.master_pt_for(106), Some(96));
        assert!(association.is_rtx_pt(106));
        assert!(!association.is_rtx_pt(96));
    }

    #[test]
    fn test_association_disabled_when_pt_map_empty() {
        let mut association = RtxAssociation::new(
            SsrcMap::from([(1, 2)]),
            PayloadTypeMap::from([(96, 106)]),
        );
        association.set_payload_type_map(PayloadTypeMap::new());

        assert!(!association.is_enabled());
        assert!(!association.is_rtx_pt(106));
        // ssrc map is kept
        assert_eq!(association.rtx_ssrc_for(1), Some(2));
    }

    #[test]
    fn test_association_clock_rate() {
        let mut association = RtxAssociation::default();
        assert_eq!(association.clock_rate_for(96), None);

        association.set_clock_rate_map(ClockRateMap::from([(96, 90000)]));
        assert_eq!(association.clock_rate_for(96), Some(90000));
    }

    #[test]
    fn test_parse_map() -> Result<()> {
        let pt: PayloadTypeMap = parse_map("96:106, 97:107")?;
        assert_eq!(pt, PayloadTypeMap::from([(96, 106), (97, 107)]));

        let ssrc: SsrcMap = parse_map("1234567=7654321;1=2;")?;
        assert_eq!(ssrc, SsrcMap::from([(1234567, 7654321), (1, 2)]));

        let empty: ClockRateMap = parse_map("  ")?;
        assert!(empty.is_empty());

        Ok(())
    }

    #[test]
    fn test_parse_map_invalid() {
        assert_eq!(
            parse_map::<u8, u8>("96"),
            Err(Error::ErrInvalidMapEntry("96".to_string()))
        );
        assert_eq!(
            parse_map::<u8, u8>("96:300"),
            Err(Error::ErrInvalidMapEntry("96:300".to_string()))
        );
    }
}
