//! Codec configuration record recovered from the encoder

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::h264::{parse_profile_level_id, NalUnitType};
use crate::error::{AppError, Result};

/// H.264 parameter sets (SPS = parameter-set-A, PPS = parameter-set-B)
///
/// Both sets are always present: the only constructor validates them, and the
/// value is immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParameterSet {
    sps: Bytes,
    pps: Bytes,
    profile_level_id: String,
}

impl CodecParameterSet {
    /// Build from raw NAL units without start codes
    pub fn new(sps: impl Into<Bytes>, pps: impl Into<Bytes>) -> Result<Self> {
        let sps = sps.into();
        let pps = pps.into();

        let profile_level_id = parse_profile_level_id(&sps).ok_or_else(|| {
            AppError::Codec(format!("Malformed SPS ({} bytes)", sps.len()))
        })?;
        if pps.is_empty() || NalUnitType::from_header(pps[0]) != NalUnitType::Pps {
            return Err(AppError::Codec(format!(
                "Malformed PPS ({} bytes)",
                pps.len()
            )));
        }

        Ok(Self {
            sps,
            pps,
            profile_level_id,
        })
    }

    /// Rebuild from the base64 form used by session descriptions and the store
    pub fn from_base64(sps: &str, pps: &str) -> Result<Self> {
        let decode = |name: &str, value: &str| {
            STANDARD
                .decode(value)
                .map_err(|e| AppError::Codec(format!("Invalid base64 {}: {}", name, e)))
        };
        Self::new(decode("SPS", sps)?, decode("PPS", pps)?)
    }

    pub fn sps(&self) -> &Bytes {
        &self.sps
    }

    pub fn pps(&self) -> &Bytes {
        &self.pps
    }

    /// Hex of SPS bytes 1..4 (profile_idc, constraint flags, level_idc)
    pub fn profile_level_id(&self) -> &str {
        &self.profile_level_id
    }

    pub fn sps_base64(&self) -> String {
        STANDARD.encode(&self.sps)
    }

    pub fn pps_base64(&self) -> String {
        STANDARD.encode(&self.pps)
    }

    /// `sprop-parameter-sets` value: `base64(SPS),base64(PPS)`
    pub fn sprop_parameter_sets(&self) -> String {
        format!("{},{}", self.sps_base64(), self.pps_base64())
    }

    pub fn to_record(&self) -> ParameterSetRecord {
        ParameterSetRecord {
            sps: self.sps_base64(),
            pps: self.pps_base64(),
            profile_level_id: self.profile_level_id.clone(),
        }
    }
}

/// Serializable form of [`CodecParameterSet`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSetRecord {
    pub sps: String,
    pub pps: String,
    pub profile_level_id: String,
}

impl TryFrom<ParameterSetRecord> for CodecParameterSet {
    type Error = AppError;

    fn try_from(record: ParameterSetRecord) -> Result<Self> {
        CodecParameterSet::from_base64(&record.sps, &record.pps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 6] = [0x67, 0x42, 0x80, 0x1e, 0xda, 0x02];
    const PPS: [u8; 4] = [0x68, 0xce, 0x06, 0xe2];

    #[test]
    fn test_profile_level_id_from_sps() {
        let params = CodecParameterSet::new(SPS.to_vec(), PPS.to_vec()).unwrap();
        assert_eq!(params.profile_level_id(), "42801e");
        assert_eq!(params.sps().as_ref(), &SPS);
        assert_eq!(params.pps().as_ref(), &PPS);
    }

    #[test]
    fn test_rejects_partial_or_swapped_sets() {
        assert!(CodecParameterSet::new(SPS.to_vec(), Vec::new()).is_err());
        assert!(CodecParameterSet::new(Vec::new(), PPS.to_vec()).is_err());
        assert!(CodecParameterSet::new(PPS.to_vec(), SPS.to_vec()).is_err());
    }

    #[test]
    fn test_sprop_parameter_sets() {
        let params = CodecParameterSet::new(SPS.to_vec(), PPS.to_vec()).unwrap();
        assert_eq!(params.sprop_parameter_sets(), "Z0KAHtoC,aM4G4g==");
    }

    #[test]
    fn test_record_conversion() {
        let params = CodecParameterSet::new(SPS.to_vec(), PPS.to_vec()).unwrap();
        let record = params.to_record();
        let back = CodecParameterSet::try_from(record).unwrap();
        assert_eq!(back, params);
        assert!(CodecParameterSet::from_base64("!!", "aM4G4g==").is_err());
    }
}
