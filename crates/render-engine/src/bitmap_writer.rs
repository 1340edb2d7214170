//! Per-frame still image writers for file sequences.
//!
//! PNG goes through the `image` crate. TIFF and EXR talk to the `tiff` and
//! `exr` encoders directly, since `image` exposes neither compression nor
//! half floats.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use exr::compression::Compression as ExrScheme;
use exr::prelude::{
    f16, AnyChannel, AnyChannels, Encoding, FlatSamples, Image, Layer, LayerAttributes,
    WritableImage,
};
use image::{DynamicImage, ImageBuffer, ImageFormat};
use serde::Serialize;
use tiff::encoder::compression::{Deflate, DeflateLevel, Lzw, Packbits, Uncompressed};
use tiff::encoder::{colortype, TiffEncoder, TiffValue};

use reelout_common::{DeliveryError, DeliveryResult};
use reelout_render_model::{
    Bitmap, ChannelLayout, ExrCompression, TiffCompression, EXR_COMPRESSION, TIFF_COMPRESSION,
};

/// Still image codec of a file sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceCodec {
    Png,
    Tiff,
    Exr,
}

impl SequenceCodec {
    /// Sample depths the codec can store. EXR stores 16 as half float.
    pub fn supports_depth(self, depth: i32) -> bool {
        match self {
            Self::Png | Self::Tiff => depth == 8 || depth == 16,
            Self::Exr => depth == 16 || depth == 32,
        }
    }
}

/// Writes one bitmap to one file. Shared by all workers of a sequence job.
pub trait BitmapWriter: Send + Sync {
    fn write(&self, bitmap: &Bitmap, path: &Path) -> DeliveryResult<()>;
}

/// [`BitmapWriter`] for the built-in sequence codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFileWriter {
    codec: SequenceCodec,
    depth: i32,
    tiff_compression: TiffCompression,
    exr_compression: ExrCompression,
}

impl ImageFileWriter {
    pub fn new(codec: SequenceCodec, depth: i32) -> DeliveryResult<Self> {
        if !codec.supports_depth(depth) {
            return Err(DeliveryError::configuration(format!(
                "{codec:?} cannot store {depth}-bit samples"
            )));
        }
        Ok(Self {
            codec,
            depth,
            tiff_compression: TIFF_COMPRESSION.standard_default(),
            exr_compression: EXR_COMPRESSION.standard_default(),
        })
    }

    pub fn with_tiff_compression(mut self, compression: TiffCompression) -> Self {
        self.tiff_compression = compression;
        self
    }

    pub fn with_exr_compression(mut self, compression: ExrCompression) -> Self {
        self.exr_compression = compression;
        self
    }

    fn to_png_image(&self, bitmap: &Bitmap) -> DeliveryResult<DynamicImage> {
        let (w, h) = (bitmap.width(), bitmap.height());
        let layout = bitmap.layout();
        let unfit = || {
            DeliveryError::image(format!(
                "{w}x{h} {layout:?} bitmap does not fit an image buffer"
            ))
        };

        if self.depth == 8 {
            let data = interleave(bitmap, quantize_u8);
            let image = match layout {
                ChannelLayout::Gray => {
                    DynamicImage::ImageLuma8(ImageBuffer::from_raw(w, h, data).ok_or_else(unfit)?)
                }
                ChannelLayout::GrayAlpha => {
                    DynamicImage::ImageLumaA8(ImageBuffer::from_raw(w, h, data).ok_or_else(unfit)?)
                }
                ChannelLayout::Rgb => {
                    DynamicImage::ImageRgb8(ImageBuffer::from_raw(w, h, data).ok_or_else(unfit)?)
                }
                ChannelLayout::Rgba => {
                    DynamicImage::ImageRgba8(ImageBuffer::from_raw(w, h, data).ok_or_else(unfit)?)
                }
            };
            return Ok(image);
        }

        let data = interleave(bitmap, quantize_u16);
        Ok(match layout {
            ChannelLayout::Gray => {
                DynamicImage::ImageLuma16(ImageBuffer::from_raw(w, h, data).ok_or_else(unfit)?)
            }
            ChannelLayout::GrayAlpha => {
                DynamicImage::ImageLumaA16(ImageBuffer::from_raw(w, h, data).ok_or_else(unfit)?)
            }
            ChannelLayout::Rgb => {
                DynamicImage::ImageRgb16(ImageBuffer::from_raw(w, h, data).ok_or_else(unfit)?)
            }
            ChannelLayout::Rgba => {
                DynamicImage::ImageRgba16(ImageBuffer::from_raw(w, h, data).ok_or_else(unfit)?)
            }
        })
    }

    fn write_png(&self, bitmap: &Bitmap, path: &Path) -> DeliveryResult<()> {
        self.to_png_image(bitmap)?
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| encode_error(path, e))
    }

    fn write_tiff(&self, bitmap: &Bitmap, path: &Path) -> DeliveryResult<()> {
        let (w, h) = (bitmap.width(), bitmap.height());
        let mut encoder =
            TiffEncoder::new(BufWriter::new(File::create(path)?)).map_err(|e| encode_error(path, e))?;
        let scheme = self.tiff_compression;
        // TIFF has no gray+alpha color type, so that layout widens to RGBA.
        let gray_alpha = [0, 0, 0, 1];
        let result = match (bitmap.layout(), self.depth) {
            (ChannelLayout::Gray, 8) => {
                tiff_image::<colortype::Gray8>(&mut encoder, w, h, scheme, &interleave(bitmap, quantize_u8))
            }
            (ChannelLayout::Gray, _) => {
                tiff_image::<colortype::Gray16>(&mut encoder, w, h, scheme, &interleave(bitmap, quantize_u16))
            }
            (ChannelLayout::GrayAlpha, 8) => tiff_image::<colortype::RGBA8>(
                &mut encoder,
                w,
                h,
                scheme,
                &interleave_as(bitmap, &gray_alpha, quantize_u8),
            ),
            (ChannelLayout::GrayAlpha, _) => tiff_image::<colortype::RGBA16>(
                &mut encoder,
                w,
                h,
                scheme,
                &interleave_as(bitmap, &gray_alpha, quantize_u16),
            ),
            (ChannelLayout::Rgb, 8) => {
                tiff_image::<colortype::RGB8>(&mut encoder, w, h, scheme, &interleave(bitmap, quantize_u8))
            }
            (ChannelLayout::Rgb, _) => {
                tiff_image::<colortype::RGB16>(&mut encoder, w, h, scheme, &interleave(bitmap, quantize_u16))
            }
            (ChannelLayout::Rgba, 8) => {
                tiff_image::<colortype::RGBA8>(&mut encoder, w, h, scheme, &interleave(bitmap, quantize_u8))
            }
            (ChannelLayout::Rgba, _) => {
                tiff_image::<colortype::RGBA16>(&mut encoder, w, h, scheme, &interleave(bitmap, quantize_u16))
            }
        };
        result.map_err(|e| encode_error(path, e))
    }

    fn write_exr(&self, bitmap: &Bitmap, path: &Path) -> DeliveryResult<()> {
        let (w, h) = (bitmap.width() as usize, bitmap.height() as usize);
        // Mattes are replicated into RGB so that every viewer shows them.
        let sources: &[(&str, usize)] = match bitmap.layout() {
            ChannelLayout::Gray => &[("R", 0), ("G", 0), ("B", 0)],
            ChannelLayout::GrayAlpha => &[("R", 0), ("G", 0), ("B", 0), ("A", 1)],
            ChannelLayout::Rgb => &[("R", 0), ("G", 1), ("B", 2)],
            ChannelLayout::Rgba => &[("R", 0), ("G", 1), ("B", 2), ("A", 3)],
        };
        let half = self.depth == 16;
        let channels: Vec<AnyChannel<FlatSamples>> = sources
            .iter()
            .map(|&(name, plane)| {
                let plane = bitmap.plane(plane);
                let samples = if half {
                    FlatSamples::F16(plane.iter().map(|v| f16::from_f32(*v)).collect())
                } else {
                    FlatSamples::F32(plane.to_vec())
                };
                AnyChannel::new(name, samples)
            })
            .collect();

        let encoding = Encoding {
            compression: exr_scheme(self.exr_compression),
            ..Encoding::UNCOMPRESSED
        };
        let layer = Layer::new(
            (w, h),
            LayerAttributes::named("rgba"),
            encoding,
            AnyChannels::sort(channels.into()),
        );
        Image::from_layer(layer)
            .write()
            .to_file(path)
            .map_err(|e| encode_error(path, e))
    }
}

impl BitmapWriter for ImageFileWriter {
    fn write(&self, bitmap: &Bitmap, path: &Path) -> DeliveryResult<()> {
        match self.codec {
            SequenceCodec::Png => self.write_png(bitmap, path),
            SequenceCodec::Tiff => self.write_tiff(bitmap, path),
            SequenceCodec::Exr => self.write_exr(bitmap, path),
        }
    }
}

fn encode_error(path: &Path, err: impl std::fmt::Display) -> DeliveryError {
    DeliveryError::image(format!("{}: {err}", path.display()))
}

fn tiff_image<C>(
    encoder: &mut TiffEncoder<BufWriter<File>>,
    width: u32,
    height: u32,
    scheme: TiffCompression,
    data: &[C::Inner],
) -> tiff::TiffResult<()>
where
    C: colortype::ColorType,
    [C::Inner]: TiffValue,
{
    match scheme {
        TiffCompression::None => {
            encoder.write_image_with_compression::<C, _>(width, height, Uncompressed, data)
        }
        TiffCompression::PackBits => {
            encoder.write_image_with_compression::<C, _>(width, height, Packbits, data)
        }
        TiffCompression::Lzw => encoder.write_image_with_compression::<C, _>(width, height, Lzw, data),
        TiffCompression::Deflate => encoder.write_image_with_compression::<C, _>(
            width,
            height,
            Deflate::with_level(DeflateLevel::Balanced),
            data,
        ),
    }
}

fn exr_scheme(compression: ExrCompression) -> ExrScheme {
    match compression {
        ExrCompression::None => ExrScheme::Uncompressed,
        ExrCompression::Rle => ExrScheme::RLE,
        ExrCompression::Zips => ExrScheme::ZIP1,
        ExrCompression::Zip => ExrScheme::ZIP16,
    }
}

fn quantize_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn quantize_u16(v: f32) -> u16 {
    (v.clamp(0.0, 1.0) * 65535.0).round() as u16
}

/// Planar to interleaved samples.
fn interleave<T>(bitmap: &Bitmap, convert: impl Fn(f32) -> T) -> Vec<T> {
    let channels: Vec<usize> = (0..bitmap.layout().channel_count()).collect();
    interleave_as(bitmap, &channels, convert)
}

/// Interleave the given source channels per pixel; channel indices may repeat.
fn interleave_as<T>(bitmap: &Bitmap, channels: &[usize], convert: impl Fn(f32) -> T) -> Vec<T> {
    let pixels = bitmap.spec().resolution.pixel_count();
    let planes: Vec<&[f32]> = channels.iter().map(|&c| bitmap.plane(c)).collect();
    let mut out = Vec::with_capacity(pixels * channels.len());
    for i in 0..pixels {
        for plane in &planes {
            out.push(convert(plane[i]));
        }
    }
    out
}
