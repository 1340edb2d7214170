//! Colour space descriptors carried by bitmap specs and encoder tags.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Colour primaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primaries {
    Bt709,
    P3D65,
    Bt2020,
}

/// Transfer characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transfer {
    Srgb,
    Bt1886,
    Linear,
    Pq,
    Hlg,
}

impl Primaries {
    pub fn label(self) -> &'static str {
        match self {
            Self::Bt709 => "BT.709",
            Self::P3D65 => "P3-D65",
            Self::Bt2020 => "BT.2020",
        }
    }

    /// Name understood by ffmpeg's `-color_primaries`.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Bt709 => "bt709",
            Self::P3D65 => "smpte432",
            Self::Bt2020 => "bt2020",
        }
    }
}

impl Transfer {
    pub fn label(self) -> &'static str {
        match self {
            Self::Srgb => "sRGB",
            Self::Bt1886 => "BT.1886",
            Self::Linear => "Linear",
            Self::Pq => "PQ",
            Self::Hlg => "HLG",
        }
    }

    /// Name understood by ffmpeg's `-color_trc`.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Srgb => "iec61966-2-1",
            Self::Bt1886 => "bt709",
            Self::Linear => "linear",
            Self::Pq => "smpte2084",
            Self::Hlg => "arib-std-b67",
        }
    }

    pub fn is_hdr(self) -> bool {
        matches!(self, Self::Pq | Self::Hlg)
    }
}

impl fmt::Display for Primaries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Primaries plus transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorSpace {
    pub primaries: Primaries,
    pub transfer: Transfer,
}

impl ColorSpace {
    pub const SRGB: ColorSpace = ColorSpace {
        primaries: Primaries::Bt709,
        transfer: Transfer::Srgb,
    };

    pub const REC709: ColorSpace = ColorSpace {
        primaries: Primaries::Bt709,
        transfer: Transfer::Bt1886,
    };

    /// Linear BT.709, used for alpha-only passes.
    pub const BLENDING: ColorSpace = ColorSpace {
        primaries: Primaries::Bt709,
        transfer: Transfer::Linear,
    };

    pub const fn new(primaries: Primaries, transfer: Transfer) -> Self {
        Self {
            primaries,
            transfer,
        }
    }
}

impl Default for ColorSpace {
    fn default() -> Self {
        Self::SRGB
    }
}
