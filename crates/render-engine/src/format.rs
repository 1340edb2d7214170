//! Export formats and their registry.
//!
//! Every format owns the [`Assortment`] of configs it accepts. The registry is
//! built once and never changes.

use std::sync::OnceLock;

use serde::Serialize;

use reelout_common::{DeliveryError, DeliveryResult};
use reelout_render_model::{
    AnyProperty, Assortment, Channels, Config, DnxhrProfile, Property, PropertyValue,
    ProResProfile, Resolution, Scan, Transfer, ALL_PROPERTIES, CHANNELS, COLOR_PRESET, DEPTH,
    DNXHR_PROFILE, EXR_COMPRESSION, FPS_SCALING, HDR, PRIMARIES, PRORES_PROFILE,
    RESOLUTION_SCALING_LOG2, SCAN, TIFF_COMPRESSION, TRANSFER,
};

use crate::bitmap_writer::SequenceCodec;
use crate::container::{ContainerCodec, VideoContainerRenderJob};
use crate::job::{format_frame_filename, RenderInputs, RenderJob};
use crate::sequence::ImageSequenceRenderJob;
use crate::tape_timeline::{TapeTimelineRenderJob, TimelineKind};

/// What a format writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "codec")]
pub enum FormatKind {
    ImageSequence(SequenceCodec),
    VideoContainer(ContainerCodec),
    TapeTimeline(TimelineKind),
}

/// Limits on the output resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DimensionConstraints {
    pub width_mod2: bool,
    pub height_mod2: bool,
    pub min_width: Option<u32>,
    pub min_height: Option<u32>,
}

impl DimensionConstraints {
    pub fn check(&self, resolution: Resolution) -> DeliveryResult<()> {
        let Resolution { width, height } = resolution;
        if self.width_mod2 && width % 2 != 0 {
            return Err(DeliveryError::configuration(format!("width {width} must be even")));
        }
        if self.height_mod2 && height % 2 != 0 {
            return Err(DeliveryError::configuration(format!("height {height} must be even")));
        }
        if let Some(min) = self.min_width.filter(|min| width < *min) {
            return Err(DeliveryError::configuration(format!(
                "width {width} is below the minimum of {min}"
            )));
        }
        if let Some(min) = self.min_height.filter(|min| height < *min) {
            return Err(DeliveryError::configuration(format!(
                "height {height} is below the minimum of {min}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RenderFormat {
    label: String,
    aux_label: Option<&'static str>,
    kind: FormatKind,
    file_exts: Vec<&'static str>,
    assortment: Assortment,
    constraints: DimensionConstraints,
}

impl RenderFormat {
    /// A numbered image sequence format with a caller-defined assortment,
    /// used as given.
    pub fn image_sequence(label: impl Into<String>, codec: SequenceCodec, assortment: Assortment) -> Self {
        Self {
            label: label.into(),
            aux_label: None,
            kind: FormatKind::ImageSequence(codec),
            file_exts: sequence_exts(codec).to_vec(),
            assortment,
            constraints: DimensionConstraints::default(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn aux_label(&self) -> Option<&str> {
        self.aux_label
    }

    pub fn kind(&self) -> FormatKind {
        self.kind
    }

    /// Whether the format writes a directory of numbered files.
    pub fn is_file_sequence(&self) -> bool {
        matches!(self.kind, FormatKind::ImageSequence(_))
    }

    pub fn file_exts(&self) -> &[&'static str] {
        &self.file_exts
    }

    pub fn default_file_ext(&self) -> &'static str {
        self.file_exts.first().copied().unwrap_or("")
    }

    /// Whether the format can embed an alpha channel next to colour.
    pub fn supports_alpha(&self) -> bool {
        self.assortment
            .configs()
            .iter()
            .any(|c| c.get(&CHANNELS) == Some(Channels::ColorAndAlpha))
    }

    pub fn assortment(&self) -> &Assortment {
        &self.assortment
    }

    pub fn constraints(&self) -> DimensionConstraints {
        self.constraints
    }

    /// See [`Assortment::options`].
    pub fn options<T: PropertyValue>(
        &self,
        property: &Property<T>,
        base: &Config,
        discard: &[&dyn AnyProperty],
    ) -> Vec<T> {
        self.assortment.options(property, base, discard)
    }

    pub fn default_value<T: PropertyValue>(&self, property: &Property<T>) -> T {
        self.assortment.default_value(property)
    }

    pub fn default_config(&self) -> &Config {
        self.assortment.default_config()
    }

    pub fn contains(&self, config: &Config) -> bool {
        self.assortment.contains(config)
    }

    pub fn check_resolution(&self, resolution: Resolution) -> DeliveryResult<()> {
        self.constraints.check(resolution)
    }

    /// Build the job that renders `inputs` with `config`.
    pub fn create_render_job(
        &self,
        config: &Config,
        inputs: RenderInputs,
    ) -> DeliveryResult<Box<dyn RenderJob>> {
        if !self.contains(config) {
            return Err(DeliveryError::configuration(format!(
                "{config} is not a legal config of {}",
                self.label
            )));
        }
        let job: Box<dyn RenderJob> = match self.kind {
            FormatKind::ImageSequence(codec) => {
                let pattern = inputs
                    .filename_pattern
                    .clone()
                    .unwrap_or_else(|| format!("frame_%06d.{}", self.default_file_ext()));
                format_frame_filename(&pattern, 1)?;
                Box::new(ImageSequenceRenderJob::new(codec, config.clone(), inputs, pattern))
            }
            FormatKind::VideoContainer(codec) => {
                let scaling = 2f64.powi(config.get_or_default(&RESOLUTION_SCALING_LOG2));
                self.check_resolution(inputs.video.resolution().scaled(scaling))?;
                Box::new(VideoContainerRenderJob::new(codec, config.clone(), inputs))
            }
            FormatKind::TapeTimeline(kind) => {
                Box::new(TapeTimelineRenderJob::new(kind, config.clone(), inputs))
            }
        };
        Ok(job)
    }

    /// Serializable overview, with options listed around the default config.
    pub fn summary(&self) -> FormatSummary {
        let base = self.default_config();
        let properties = ALL_PROPERTIES
            .iter()
            .filter(|p| self.assortment.mentions(**p))
            .map(|p| PropertySummary {
                name: p.name(),
                default: base
                    .value_of(*p)
                    .unwrap_or_else(|| p.standard_default_value())
                    .to_string(),
                options: self
                    .assortment
                    .options_any(*p, base, &[])
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            })
            .collect();
        FormatSummary {
            label: self.label.clone(),
            aux_label: self.aux_label,
            kind: self.kind,
            file_exts: self.file_exts.clone(),
            file_sequence: self.is_file_sequence(),
            supports_alpha: self.supports_alpha(),
            constraints: self.constraints,
            properties,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PropertySummary {
    pub name: &'static str,
    pub default: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatSummary {
    pub label: String,
    pub aux_label: Option<&'static str>,
    pub kind: FormatKind,
    pub file_exts: Vec<&'static str>,
    pub file_sequence: bool,
    pub supports_alpha: bool,
    pub constraints: DimensionConstraints,
    pub properties: Vec<PropertySummary>,
}

fn sequence_exts(codec: SequenceCodec) -> &'static [&'static str] {
    match codec {
        SequenceCodec::Png => &["png"],
        SequenceCodec::Tiff => &["tiff", "tif"],
        SequenceCodec::Exr => &["exr"],
    }
}

fn choice<T: PropertyValue>(property: &Property<T>, options: &[T]) -> Assortment {
    Assortment::choice(property, options)
}

fn choice_all<T: PropertyValue>(property: &Property<T>) -> Assortment {
    Assortment::choice_all(property)
}

fn fixed<T: PropertyValue>(property: &Property<T>, value: T) -> Assortment {
    Assortment::fixed(property, value)
}

fn sequence_format(label: &str, codec: SequenceCodec, assortment: Assortment) -> RenderFormat {
    RenderFormat::image_sequence(
        label,
        codec,
        assortment * choice_all(&RESOLUTION_SCALING_LOG2) * choice_all(&FPS_SCALING) * choice_all(&SCAN),
    )
}

/// Colour or matte at 8 or 16 bits per component.
fn integer_channels_and_depth() -> Assortment {
    let color = choice(&CHANNELS, &[Channels::Color, Channels::ColorAndAlpha])
        * choice_all(&PRIMARIES)
        * choice_all(&TRANSFER);
    (color + fixed(&CHANNELS, Channels::Alpha)) * choice(&DEPTH, &[8, 16])
}

fn png_sequence() -> RenderFormat {
    sequence_format("PNG", SequenceCodec::Png, integer_channels_and_depth())
}

fn tiff_sequence() -> RenderFormat {
    sequence_format(
        "TIFF",
        SequenceCodec::Tiff,
        integer_channels_and_depth() * choice_all(&TIFF_COMPRESSION),
    )
}

fn exr_sequence() -> RenderFormat {
    let color = choice(&CHANNELS, &[Channels::Color, Channels::ColorAndAlpha])
        * choice_all(&PRIMARIES)
        * fixed(&TRANSFER, Transfer::Linear)
        * choice_all(&HDR);
    sequence_format(
        "EXR",
        SequenceCodec::Exr,
        Assortment::choice_with_default(&DEPTH, &[16, 32], 32)
            * choice_all(&EXR_COMPRESSION)
            * (color + fixed(&CHANNELS, Channels::Alpha)),
    )
}

fn container_format(
    label: &str,
    codec: ContainerCodec,
    file_exts: &[&'static str],
    assortment: Assortment,
    constraints: DimensionConstraints,
) -> RenderFormat {
    RenderFormat {
        label: label.to_string(),
        aux_label: None,
        kind: FormatKind::VideoContainer(codec),
        file_exts: file_exts.to_vec(),
        assortment: assortment * choice_all(&RESOLUTION_SCALING_LOG2) * choice_all(&FPS_SCALING),
        constraints,
    }
}

fn opaque_channels_and_preset() -> Assortment {
    choice(&CHANNELS, &[Channels::Color]) * choice_all(&COLOR_PRESET)
        + fixed(&CHANNELS, Channels::Alpha)
}

fn all_channels_and_preset() -> Assortment {
    choice(&CHANNELS, &[Channels::Color, Channels::ColorAndAlpha]) * choice_all(&COLOR_PRESET)
        + fixed(&CHANNELS, Channels::Alpha)
}

fn h26x_format(label: &str, codec: ContainerCodec) -> RenderFormat {
    container_format(
        label,
        codec,
        &["mp4", "mov", "mkv"],
        opaque_channels_and_preset() * choice(&DEPTH, &[8, 10]) * fixed(&SCAN, Scan::Progressive),
        DimensionConstraints {
            width_mod2: true,
            height_mod2: true,
            ..Default::default()
        },
    )
}

fn prores_format() -> RenderFormat {
    container_format(
        "ProRes",
        ContainerCodec::ProRes,
        &["mov"],
        all_channels_and_preset() * fixed(&DEPTH, 10) * choice_all(&SCAN) * choice_all(&PRORES_PROFILE)
            - fixed(&CHANNELS, Channels::ColorAndAlpha) * choice(&PRORES_PROFILE, &ProResProfile::ALL_422),
        DimensionConstraints {
            width_mod2: true,
            ..Default::default()
        },
    )
}

fn dnxhr_format() -> RenderFormat {
    let profiles = choice(
        &DNXHR_PROFILE,
        &[DnxhrProfile::Lb, DnxhrProfile::Sq, DnxhrProfile::Hq],
    ) * fixed(&DEPTH, 8)
        + choice(&DNXHR_PROFILE, &[DnxhrProfile::Hqx, DnxhrProfile::Dnx444]) * fixed(&DEPTH, 10);
    container_format(
        "DNxHR",
        ContainerCodec::Dnxhr,
        &["mxf", "mov"],
        opaque_channels_and_preset() * fixed(&SCAN, Scan::Progressive) * profiles,
        DimensionConstraints {
            min_width: Some(256),
            min_height: Some(120),
            ..Default::default()
        },
    )
}

fn timeline_format(ext: &'static str, aux_label: Option<&'static str>, kind: TimelineKind) -> RenderFormat {
    RenderFormat {
        label: ext.to_uppercase(),
        aux_label,
        kind: FormatKind::TapeTimeline(kind),
        file_exts: vec![ext],
        assortment: choice_all(&FPS_SCALING) * choice_all(&SCAN),
        constraints: DimensionConstraints::default(),
    }
}

/// Every built-in format, in display order.
pub fn render_formats() -> &'static [RenderFormat] {
    static FORMATS: OnceLock<Vec<RenderFormat>> = OnceLock::new();
    FORMATS.get_or_init(|| {
        vec![
            png_sequence(),
            tiff_sequence(),
            exr_sequence(),
            h26x_format("H.264", ContainerCodec::H264),
            h26x_format("H.265", ContainerCodec::H265),
            prores_format(),
            dnxhr_format(),
            timeline_format("csv", None, TimelineKind::Csv),
            timeline_format("edl", Some("CMX3600"), TimelineKind::Edl),
            timeline_format("otio", Some("OpenTimelineIO"), TimelineKind::Otio),
            timeline_format("fcpxml", Some("Final Cut Pro X XML"), TimelineKind::Fcpxml),
            timeline_format("xml", Some("Final Cut Pro 7 XML"), TimelineKind::Xml),
        ]
    })
}

/// Look up a built-in format by label, ignoring case and dots (`h264` finds `H.264`).
pub fn render_format_by_label(label: &str) -> Option<&'static RenderFormat> {
    let wanted = label.replace('.', "");
    render_formats()
        .iter()
        .find(|f| f.label.replace('.', "").eq_ignore_ascii_case(&wanted))
}

/// Built-in formats that write files with extension `ext`.
pub fn render_formats_for_ext(ext: &str) -> Vec<&'static RenderFormat> {
    let ext = ext.trim_start_matches('.');
    render_formats()
        .iter()
        .filter(|f| f.file_exts.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .collect()
}
