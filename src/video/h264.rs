//! H.264 Annex-B bitstream helpers
//!
//! Hardware encoders emit an Annex-B elementary stream: NAL units separated by
//! `00 00 00 01` (or the short `00 00 01`) start codes. These helpers split such
//! a buffer into units and classify them by the low five bits of the NAL header.

/// 4-byte Annex-B start code
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// H.264 NAL unit types the pipeline cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    NonIdrSlice,
    IdrSlice,
    Sei,
    /// Sequence parameter set (parameter-set-A)
    Sps,
    /// Picture parameter set (parameter-set-B)
    Pps,
    AccessUnitDelimiter,
    Filler,
    Other(u8),
}

impl NalUnitType {
    /// Classify from the first byte of a NAL unit (the NAL header)
    pub fn from_header(header: u8) -> Self {
        match header & 0x1F {
            1 => NalUnitType::NonIdrSlice,
            5 => NalUnitType::IdrSlice,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::AccessUnitDelimiter,
            12 => NalUnitType::Filler,
            other => NalUnitType::Other(other),
        }
    }
}

/// Length of the start code at `pos`, if one begins there
fn start_code_len(data: &[u8], pos: usize) -> Option<usize> {
    let rest = &data[pos..];
    if rest.len() >= 4 && rest[..4] == START_CODE {
        Some(4)
    } else if rest.len() >= 3 && rest[..3] == [0, 0, 1] {
        Some(3)
    } else {
        None
    }
}

/// Iterator over the NAL units of an Annex-B buffer, start codes excluded
///
/// Bytes before the first start code are skipped; empty units are never yielded.
pub struct NalUnits<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> NalUnits<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for NalUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.data;

        loop {
            // Find the next start code
            let nal_start = loop {
                if self.pos >= data.len() {
                    return None;
                }
                match start_code_len(data, self.pos) {
                    Some(len) => break self.pos + len,
                    None => self.pos += 1,
                }
            };

            // The unit ends at the following start code, or at the end of the buffer
            let mut nal_end = data.len();
            let mut j = nal_start;
            while j + 3 <= data.len() {
                if start_code_len(data, j).is_some() {
                    nal_end = j;
                    break;
                }
                j += 1;
            }
            self.pos = nal_end;

            if nal_end > nal_start {
                return Some(&data[nal_start..nal_end]);
            }
        }
    }
}

/// Split an Annex-B buffer into NAL units
pub fn nal_units(data: &[u8]) -> NalUnits<'_> {
    NalUnits::new(data)
}

/// Whether the buffer begins with a 4-byte start code
pub fn has_start_code_prefix(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == START_CODE
}

/// Drop a leading 4-byte start code, if present
pub fn strip_start_code(data: &[u8]) -> &[u8] {
    if has_start_code_prefix(data) {
        &data[4..]
    } else {
        data
    }
}

/// Check if an access unit contains an IDR slice
pub fn is_keyframe(data: &[u8]) -> bool {
    nal_units(data).any(|nal| NalUnitType::from_header(nal[0]) == NalUnitType::IdrSlice)
}

/// Parse profile-level-id from an SPS NAL unit (without start code)
///
/// Returns a 6-character hex string like "42001f" (Baseline L3.1):
/// - Byte 0: NAL header (0x67 for SPS)
/// - Byte 1: profile_idc
/// - Byte 2: constraint_set_flags
/// - Byte 3: level_idc
pub fn parse_profile_level_id(sps: &[u8]) -> Option<String> {
    if sps.len() < 4 || NalUnitType::from_header(sps[0]) != NalUnitType::Sps {
        return None;
    }
    Some(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 6] = [0x67, 0x42, 0x00, 0x1f, 0xe9, 0x02];
    const PPS: [u8; 4] = [0x68, 0xce, 0x3c, 0x80];

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(unit);
        }
        out
    }

    #[test]
    fn test_nal_type_uses_low_five_bits() {
        assert_eq!(NalUnitType::from_header(0x67), NalUnitType::Sps);
        assert_eq!(NalUnitType::from_header(0x27), NalUnitType::Sps);
        assert_eq!(NalUnitType::from_header(0x68), NalUnitType::Pps);
        assert_eq!(NalUnitType::from_header(0x65), NalUnitType::IdrSlice);
        assert_eq!(NalUnitType::from_header(0x41), NalUnitType::NonIdrSlice);
        assert_eq!(NalUnitType::from_header(0x7e), NalUnitType::Other(30));
    }

    #[test]
    fn test_split_units() {
        let data = annexb(&[&SPS, &PPS]);
        let units: Vec<&[u8]> = nal_units(&data).collect();
        assert_eq!(units, vec![&SPS[..], &PPS[..]]);
    }

    #[test]
    fn test_split_mixed_start_codes_and_leading_garbage() {
        let mut data = vec![0xff, 0x00];
        data.extend_from_slice(&[0, 0, 1]);
        data.extend_from_slice(&PPS);
        data.extend_from_slice(&START_CODE);
        data.extend_from_slice(&SPS);
        let units: Vec<&[u8]> = nal_units(&data).collect();
        assert_eq!(units, vec![&PPS[..], &SPS[..]]);
    }

    #[test]
    fn test_empty_units_skipped() {
        let mut data = START_CODE.to_vec();
        data.extend_from_slice(&START_CODE);
        data.extend_from_slice(&PPS);
        let units: Vec<&[u8]> = nal_units(&data).collect();
        assert_eq!(units, vec![&PPS[..]]);
        assert_eq!(nal_units(&START_CODE).count(), 0);
        assert_eq!(nal_units(&[]).count(), 0);
    }

    #[test]
    fn test_long_run_of_start_codes() {
        let mut data = START_CODE.repeat(500_000);
        assert_eq!(nal_units(&data).count(), 0);

        data.extend_from_slice(&SPS);
        let units: Vec<&[u8]> = nal_units(&data).collect();
        assert_eq!(units, vec![&SPS[..]]);
    }

    #[test]
    fn test_strip_start_code() {
        let data = annexb(&[&SPS]);
        assert_eq!(strip_start_code(&data), &SPS[..]);
        assert_eq!(strip_start_code(&SPS), &SPS[..]);
    }

    #[test]
    fn test_keyframe_detection() {
        let idr = [0x65, 0x88, 0x84];
        let p = [0x41, 0x9a, 0x02];
        assert!(is_keyframe(&annexb(&[&SPS, &PPS, &idr])));
        assert!(!is_keyframe(&annexb(&[&p])));
    }

    #[test]
    fn test_profile_level_id() {
        assert_eq!(parse_profile_level_id(&SPS).as_deref(), Some("42001f"));
        assert_eq!(parse_profile_level_id(&PPS), None);
        assert_eq!(parse_profile_level_id(&[0x67, 0x42]), None);
    }
}
