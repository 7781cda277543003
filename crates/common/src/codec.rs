//! Codec selection with per-codec parameter sets.
//!
//! Each variant carries only the parameters that make sense for that codec,
//! so a configuration can never hold an AVC profile for an MPEG-4 session.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Codec the component is instantiated for, with its parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Codec {
    Mpeg4(Mpeg4Params),
    H263(H263Params),
    Avc(AvcParams),
    Vp8(Vp8Params),
}

impl Codec {
    /// Human-readable codec name (for display/logging).
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Mpeg4(_) => "MPEG-4 Part 2",
            Self::H263(_) => "H.263",
            Self::Avc(_) => "H.264/AVC",
            Self::Vp8(_) => "VP8",
        }
    }

    /// MIME type of the produced elementary stream.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Mpeg4(_) => "video/mp4v-es",
            Self::H263(_) => "video/3gpp",
            Self::Avc(_) => "video/avc",
            Self::Vp8(_) => "video/x-vnd.on2.vp8",
        }
    }

    /// Number of P frames between two intra frames.
    pub fn intra_period(&self) -> u32 {
        match self {
            Self::Mpeg4(p) => p.p_frames,
            Self::H263(p) => p.p_frames,
            Self::Avc(p) => p.p_frames,
            Self::Vp8(p) => p.p_frames,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Mpeg4(p) => p.validate(),
            Self::H263(p) => p.validate(),
            Self::Avc(p) => p.validate(),
            Self::Vp8(p) => p.validate(),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::Avc(AvcParams::default())
    }
}

// ---------------------------------------------------------------------------
// MPEG-4
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mpeg4Profile {
    Simple,
    AdvancedSimple,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mpeg4Params {
    pub profile: Mpeg4Profile,
    /// Level 0..=5.
    pub level: u8,
    pub p_frames: u32,
    pub time_increment_resolution: u32,
    /// Emit short-header (H.263 baseline compatible) bitstream.
    pub short_header: bool,
}

impl Default for Mpeg4Params {
    fn default() -> Self {
        Self {
            profile: Mpeg4Profile::Simple,
            level: 3,
            p_frames: 29,
            time_increment_resolution: 30,
            short_header: false,
        }
    }
}

impl Mpeg4Params {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.level > 5 {
            return Err(ConfigError::Codec(format!(
                "MPEG-4 level {} out of range 0..=5",
                self.level
            )));
        }
        if self.time_increment_resolution == 0 {
            return Err(ConfigError::Codec(
                "MPEG-4 time increment resolution must be non-zero".into(),
            ));
        }
        if self.short_header && self.profile != Mpeg4Profile::Simple {
            return Err(ConfigError::Codec(
                "short header requires the Simple profile".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// H.263
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum H263Profile {
    Baseline,
    ISWV2,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct H263Params {
    pub profile: H263Profile,
    /// One of 10, 20, 30, 40, 45, 50, 60, 70.
    pub level: u8,
    pub p_frames: u32,
}

impl Default for H263Params {
    fn default() -> Self {
        Self {
            profile: H263Profile::Baseline,
            level: 10,
            p_frames: 29,
        }
    }
}

impl H263Params {
    const LEVELS: [u8; 8] = [10, 20, 30, 40, 45, 50, 60, 70];

    fn validate(&self) -> Result<(), ConfigError> {
        if !Self::LEVELS.contains(&self.level) {
            return Err(ConfigError::Codec(format!(
                "H.263 level {} is not a defined level",
                self.level
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AVC
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvcProfile {
    Baseline,
    Main,
    High,
}

impl AvcProfile {
    /// `profile_idc` as written into the sequence parameter set.
    pub fn profile_idc(self) -> u8 {
        match self {
            Self::Baseline => 66,
            Self::Main => 77,
            Self::High => 100,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntropyCoding {
    Cavlc,
    Cabac,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvcParams {
    pub profile: AvcProfile,
    /// `level_idc` (e.g. 31 for level 3.1).
    pub level: u8,
    pub p_frames: u32,
    pub b_frames: u32,
    pub entropy: EntropyCoding,
    /// Repeat SPS/PPS in front of every IDR frame.
    pub inband_headers: bool,
}

impl Default for AvcParams {
    fn default() -> Self {
        Self {
            profile: AvcProfile::Baseline,
            level: 31,
            p_frames: 29,
            b_frames: 0,
            entropy: EntropyCoding::Cavlc,
            inband_headers: false,
        }
    }
}

impl AvcParams {
    const LEVELS: [u8; 16] = [10, 9, 11, 12, 13, 20, 21, 22, 30, 31, 32, 40, 41, 42, 50, 51];

    fn validate(&self) -> Result<(), ConfigError> {
        if !Self::LEVELS.contains(&self.level) {
            return Err(ConfigError::Codec(format!(
                "AVC level_idc {} is not a defined level",
                self.level
            )));
        }
        if self.profile == AvcProfile::Baseline {
            if self.b_frames > 0 {
                return Err(ConfigError::Codec(
                    "B frames are not allowed in the Baseline profile".into(),
                ));
            }
            if self.entropy == EntropyCoding::Cabac {
                return Err(ConfigError::Codec(
                    "CABAC is not allowed in the Baseline profile".into(),
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// VP8
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vp8Params {
    /// Profile 0..=3.
    pub profile: u8,
    pub p_frames: u32,
}

impl Default for Vp8Params {
    fn default() -> Self {
        Self {
            profile: 0,
            p_frames: 29,
        }
    }
}

impl Vp8Params {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.profile > 3 {
            return Err(ConfigError::Codec(format!(
                "VP8 profile {} out of range 0..=3",
                self.profile
            )));
        }
        Ok(())
    }
}
