//! Typed export properties and their registry.
//!
//! A [`Property`] is a named setting with a fixed list of standard options and a
//! standard default. Properties are statics; two properties are the same key
//! exactly when their names match, and names are unique across [`ALL_PROPERTIES`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

use crate::bitmap::Scan;
use crate::color::{Primaries, Transfer};

/// A value a property can hold, in type-erased form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Int(i32),
    Bool(bool),
    Scan(Scan),
    Channels(Channels),
    Primaries(Primaries),
    Transfer(Transfer),
    ColorPreset(ColorPreset),
    ProResProfile(ProResProfile),
    DnxhrProfile(DnxhrProfile),
    TiffCompression(TiffCompression),
    ExrCompression(ExrCompression),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Scan(v) => write!(f, "{v}"),
            Self::Channels(v) => write!(f, "{v}"),
            Self::Primaries(v) => write!(f, "{v}"),
            Self::Transfer(v) => write!(f, "{v}"),
            Self::ColorPreset(v) => write!(f, "{v}"),
            Self::ProResProfile(v) => write!(f, "{v}"),
            Self::DnxhrProfile(v) => write!(f, "{v}"),
            Self::TiffCompression(v) => write!(f, "{v}"),
            Self::ExrCompression(v) => write!(f, "{v}"),
        }
    }
}

/// Concrete types that can be stored under a [`Property`].
pub trait PropertyValue:
    Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    fn into_value(self) -> Value;
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! impl_property_value {
    ($ty:ty, $variant:ident) => {
        impl PropertyValue for $ty {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_property_value!(i32, Int);
impl_property_value!(bool, Bool);
impl_property_value!(Scan, Scan);
impl_property_value!(Channels, Channels);
impl_property_value!(Primaries, Primaries);
impl_property_value!(Transfer, Transfer);
impl_property_value!(ColorPreset, ColorPreset);
impl_property_value!(ProResProfile, ProResProfile);
impl_property_value!(DnxhrProfile, DnxhrProfile);
impl_property_value!(TiffCompression, TiffCompression);
impl_property_value!(ExrCompression, ExrCompression);

/// A typed, named setting.
#[derive(Debug)]
pub struct Property<T: 'static> {
    name: &'static str,
    standard_options: &'static [T],
    standard_default: T,
}

impl<T: PropertyValue> Property<T> {
    pub const fn new(name: &'static str, standard_options: &'static [T], standard_default: T) -> Self {
        Self {
            name,
            standard_options,
            standard_default,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn standard_options(&self) -> &'static [T] {
        self.standard_options
    }

    pub fn standard_default(&self) -> T {
        self.standard_default
    }

    /// Position of `value` among the standard options; unknown values sort last.
    pub fn rank(&self, value: T) -> usize {
        self.standard_options
            .iter()
            .position(|v| *v == value)
            .unwrap_or(usize::MAX)
    }
}

/// Type-erased view of a property, for callers that iterate a format's settings.
pub trait AnyProperty: Send + Sync {
    fn name(&self) -> &'static str;
    fn standard_values(&self) -> Vec<Value>;
    fn standard_default_value(&self) -> Value;

    /// Parse one of the standard option labels, ignoring ASCII case.
    fn parse_value(&self, text: &str) -> Option<Value> {
        let text = text.trim();
        self.standard_values()
            .into_iter()
            .find(|v| v.to_string().eq_ignore_ascii_case(text))
    }

    /// Position of `value` among the standard options; unknown values sort last.
    fn rank_value(&self, value: Value) -> usize {
        self.standard_values()
            .iter()
            .position(|v| *v == value)
            .unwrap_or(usize::MAX)
    }
}

impl<T: PropertyValue> AnyProperty for Property<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn standard_values(&self) -> Vec<Value> {
        self.standard_options.iter().map(|v| v.into_value()).collect()
    }

    fn standard_default_value(&self) -> Value {
        self.standard_default.into_value()
    }
}

impl<T> fmt::Display for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Which channels an export writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channels {
    Color,
    ColorAndAlpha,
    /// Matte: only the alpha channel, written as gray.
    Alpha,
}

impl fmt::Display for Channels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Color => "Color",
            Self::ColorAndAlpha => "Color+Alpha",
            Self::Alpha => "Alpha",
        })
    }
}

/// Colour tagging bundles offered by video containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorPreset {
    Rec709,
    Srgb,
    Rec2020Pq,
    Rec2020Hlg,
}

impl ColorPreset {
    pub fn primaries(self) -> Primaries {
        match self {
            Self::Rec709 | Self::Srgb => Primaries::Bt709,
            Self::Rec2020Pq | Self::Rec2020Hlg => Primaries::Bt2020,
        }
    }

    pub fn transfer(self) -> Transfer {
        match self {
            Self::Rec709 => Transfer::Bt1886,
            Self::Srgb => Transfer::Srgb,
            Self::Rec2020Pq => Transfer::Pq,
            Self::Rec2020Hlg => Transfer::Hlg,
        }
    }

    /// YUV matrix name understood by ffmpeg's `-colorspace`.
    pub fn ffmpeg_matrix(self) -> &'static str {
        match self {
            Self::Rec709 | Self::Srgb => "bt709",
            Self::Rec2020Pq | Self::Rec2020Hlg => "bt2020nc",
        }
    }
}

impl fmt::Display for ColorPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rec709 => "Rec.709",
            Self::Srgb => "sRGB",
            Self::Rec2020Pq => "Rec.2020 PQ",
            Self::Rec2020Hlg => "Rec.2020 HLG",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProResProfile {
    Proxy,
    Lt,
    Standard,
    Hq,
    P4444,
    P4444Xq,
}

impl ProResProfile {
    pub const ALL_422: [ProResProfile; 4] = [Self::Proxy, Self::Lt, Self::Standard, Self::Hq];

    /// Value of the ffmpeg ProRes encoders' `profile` option.
    pub fn ffmpeg_profile(self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::Lt => "lt",
            Self::Standard => "standard",
            Self::Hq => "hq",
            Self::P4444 => "4444",
            Self::P4444Xq => "4444xq",
        }
    }

    pub fn is_422(self) -> bool {
        Self::ALL_422.contains(&self)
    }
}

impl fmt::Display for ProResProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Proxy => "422 Proxy",
            Self::Lt => "422 LT",
            Self::Standard => "422",
            Self::Hq => "422 HQ",
            Self::P4444 => "4444",
            Self::P4444Xq => "4444 XQ",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnxhrProfile {
    Lb,
    Sq,
    Hq,
    Hqx,
    Dnx444,
}

impl DnxhrProfile {
    pub fn ffmpeg_profile(self) -> &'static str {
        match self {
            Self::Lb => "dnxhr_lb",
            Self::Sq => "dnxhr_sq",
            Self::Hq => "dnxhr_hq",
            Self::Hqx => "dnxhr_hqx",
            Self::Dnx444 => "dnxhr_444",
        }
    }
}

impl fmt::Display for DnxhrProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lb => "LB",
            Self::Sq => "SQ",
            Self::Hq => "HQ",
            Self::Hqx => "HQX",
            Self::Dnx444 => "444",
        })
    }
}

/// Lossless TIFF compression schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiffCompression {
    None,
    PackBits,
    Lzw,
    Deflate,
}

impl fmt::Display for TiffCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "None",
            Self::PackBits => "PackBits",
            Self::Lzw => "LZW",
            Self::Deflate => "Deflate",
        })
    }
}

/// Lossless OpenEXR compression schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExrCompression {
    None,
    Rle,
    /// Zip over single scanlines.
    Zips,
    /// Zip over blocks of 16 scanlines.
    Zip,
}

impl fmt::Display for ExrCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "None",
            Self::Rle => "RLE",
            Self::Zips => "ZIPS",
            Self::Zip => "ZIP",
        })
    }
}

pub static RESOLUTION_SCALING_LOG2: Property<i32> =
    Property::new("resolution_scaling_log2", &[-2, -1, 0, 1, 2], 0);

pub static FPS_SCALING: Property<i32> = Property::new("fps_scaling", &[1, 2, 3, 4], 1);

pub static SCAN: Property<Scan> = Property::new(
    "scan",
    &[
        Scan::Progressive,
        Scan::InterlacedTopFieldFirst,
        Scan::InterlacedBottomFieldFirst,
    ],
    Scan::Progressive,
);

pub static CHANNELS: Property<Channels> = Property::new(
    "channels",
    &[Channels::Color, Channels::ColorAndAlpha, Channels::Alpha],
    Channels::Color,
);

pub static DEPTH: Property<i32> = Property::new("depth", &[8, 10, 12, 16, 32], 8);

pub static PRIMARIES: Property<Primaries> = Property::new(
    "primaries",
    &[Primaries::Bt709, Primaries::P3D65, Primaries::Bt2020],
    Primaries::Bt709,
);

pub static TRANSFER: Property<Transfer> = Property::new(
    "transfer",
    &[
        Transfer::Srgb,
        Transfer::Bt1886,
        Transfer::Linear,
        Transfer::Pq,
        Transfer::Hlg,
    ],
    Transfer::Srgb,
);

pub static HDR: Property<bool> = Property::new("hdr", &[false, true], false);

pub static COLOR_PRESET: Property<ColorPreset> = Property::new(
    "color_preset",
    &[
        ColorPreset::Rec709,
        ColorPreset::Srgb,
        ColorPreset::Rec2020Pq,
        ColorPreset::Rec2020Hlg,
    ],
    ColorPreset::Rec709,
);

pub static PRORES_PROFILE: Property<ProResProfile> = Property::new(
    "prores_profile",
    &[
        ProResProfile::Proxy,
        ProResProfile::Lt,
        ProResProfile::Standard,
        ProResProfile::Hq,
        ProResProfile::P4444,
        ProResProfile::P4444Xq,
    ],
    ProResProfile::Hq,
);

pub static DNXHR_PROFILE: Property<DnxhrProfile> = Property::new(
    "dnxhr_profile",
    &[
        DnxhrProfile::Lb,
        DnxhrProfile::Sq,
        DnxhrProfile::Hq,
        DnxhrProfile::Hqx,
        DnxhrProfile::Dnx444,
    ],
    DnxhrProfile::Hq,
);

pub static TIFF_COMPRESSION: Property<TiffCompression> = Property::new(
    "tiff_compression",
    &[
        TiffCompression::None,
        TiffCompression::PackBits,
        TiffCompression::Lzw,
        TiffCompression::Deflate,
    ],
    TiffCompression::Lzw,
);

pub static EXR_COMPRESSION: Property<ExrCompression> = Property::new(
    "exr_compression",
    &[
        ExrCompression::None,
        ExrCompression::Rle,
        ExrCompression::Zips,
        ExrCompression::Zip,
    ],
    ExrCompression::Zip,
);

/// Every registered property, in display order.
pub static ALL_PROPERTIES: [&(dyn AnyProperty); 13] = [
    &RESOLUTION_SCALING_LOG2,
    &FPS_SCALING,
    &SCAN,
    &CHANNELS,
    &DEPTH,
    &PRIMARIES,
    &TRANSFER,
    &HDR,
    &COLOR_PRESET,
    &PRORES_PROFILE,
    &DNXHR_PROFILE,
    &TIFF_COMPRESSION,
    &EXR_COMPRESSION,
];

pub fn property_by_name(name: &str) -> Option<&'static dyn AnyProperty> {
    ALL_PROPERTIES.iter().copied().find(|p| p.name() == name)
}
