//! Pixel data ingestion and normalization.
//!
//! Takes raw Pixel Data bytes plus the image module attributes supplied by
//! the SCU and produces an 8-bit raster (`L` or `RGB`) ready for page
//! composition: unpack to native width, signed-to-unsigned shift,
//! photometric fixup (MONOCHROME1 inversion, YBR to RGB, palette lookup),
//! VOI windowing or min-max rescale, downcast, plane de-interleaving.
//!
//! The pipeline is best-effort: geometry mismatches are repaired with a
//! warning; only an unknown photometric interpretation is fatal.

use image::{GrayImage, RgbImage};
use tracing::warn;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotometricInterpretation {
    Monochrome1,
    Monochrome2,
    Rgb,
    YbrFull,
    YbrFull422,
    PaletteColor,
}

impl PhotometricInterpretation {
    pub fn parse(value: &str) -> Result<Self, PipelineError> {
        match value.trim().trim_end_matches('\0').trim() {
            "MONOCHROME1" => Ok(Self::Monochrome1),
            "MONOCHROME2" => Ok(Self::Monochrome2),
            "RGB" => Ok(Self::Rgb),
            "YBR_FULL" => Ok(Self::YbrFull),
            "YBR_FULL_422" => Ok(Self::YbrFull422),
            "PALETTE COLOR" => Ok(Self::PaletteColor),
            other => Err(PipelineError::UnsupportedPixelEncoding(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monochrome1 => "MONOCHROME1",
            Self::Monochrome2 => "MONOCHROME2",
            Self::Rgb => "RGB",
            Self::YbrFull => "YBR_FULL",
            Self::YbrFull422 => "YBR_FULL_422",
            Self::PaletteColor => "PALETTE COLOR",
        }
    }
}

/// Palette Color lookup data, one table per channel.
#[derive(Debug, Clone)]
pub struct PaletteLut {
    /// first input value mapped by the tables
    pub first_entry: u16,
    pub red: Vec<u16>,
    pub green: Vec<u16>,
    pub blue: Vec<u16>,
    /// bits per table entry (8 or 16)
    pub entry_bits: u16,
}

impl PaletteLut {
    fn lookup(&self, table: &[u16], value: u16) -> u8 {
        if table.is_empty() {
            return 0;
        }
        let index = (value.saturating_sub(self.first_entry) as usize).min(table.len() - 1);
        let entry = table[index];
        if self.entry_bits > 8 {
            (entry >> 8) as u8
        } else {
            entry as u8
        }
    }

    fn rgb(&self, value: u16) -> [u8; 3] {
        [
            self.lookup(&self.red, value),
            self.lookup(&self.green, value),
            self.lookup(&self.blue, value),
        ]
    }
}

/// The image module attributes that drive the pipeline.
#[derive(Debug, Clone)]
pub struct ImageAttributes {
    pub rows: u32,
    pub columns: u32,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub high_bit: u16,
    pub pixel_representation: u16,
    pub photometric_interpretation: PhotometricInterpretation,
    pub samples_per_pixel: u16,
    pub planar_configuration: u16,
    pub window_center: Option<f64>,
    pub window_width: Option<f64>,
    pub palette: Option<PaletteLut>,
}

impl ImageAttributes {
    /// Bytes the Pixel Data must hold for this geometry.
    pub fn expected_bytes(&self) -> usize {
        self.rows as usize
            * self.columns as usize
            * self.samples_per_pixel as usize
            * self.bits_allocated.div_ceil(8) as usize
    }

    fn validate(&self) -> Result<(), PipelineError> {
        let bits_ok = matches!(self.bits_allocated, 8 | 16);
        let samples_ok = matches!(self.samples_per_pixel, 1 | 3);
        if self.rows == 0
            || self.columns == 0
            || !bits_ok
            || !samples_ok
            || self.bits_stored == 0
            || self.bits_stored > self.bits_allocated
        {
            return Err(PipelineError::InvalidGeometry {
                rows: self.rows,
                columns: self.columns,
                samples_per_pixel: self.samples_per_pixel,
                bits_allocated: self.bits_allocated,
            });
        }
        Ok(())
    }
}

/// A normalized 8-bit raster.
#[derive(Debug, Clone)]
pub enum Raster {
    Gray(GrayImage),
    Rgb(RgbImage),
}

impl Raster {
    pub fn width(&self) -> u32 {
        match self {
            Raster::Gray(img) => img.width(),
            Raster::Rgb(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Raster::Gray(img) => img.height(),
            Raster::Rgb(img) => img.height(),
        }
    }

    pub fn is_gray(&self) -> bool {
        matches!(self, Raster::Gray(_))
    }

    /// Invert every sample (REVERSE polarity).
    pub fn invert(&mut self) {
        match self {
            Raster::Gray(img) => {
                for px in img.pixels_mut() {
                    px.0[0] = 255 - px.0[0];
                }
            }
            Raster::Rgb(img) => {
                for px in img.pixels_mut() {
                    for ch in &mut px.0 {
                        *ch = 255 - *ch;
                    }
                }
            }
        }
    }
}

/// Run the full pipeline over one frame of pixel data.
pub fn decode(attrs: &ImageAttributes, pixel_data: &[u8]) -> Result<Raster, PipelineError> {
    attrs.validate()?;
    if pixel_data.is_empty() {
        return Err(PipelineError::EmptyPixelData);
    }

    match attrs.samples_per_pixel {
        1 => decode_single_sample(attrs, pixel_data),
        _ => decode_color(attrs, pixel_data),
    }
}

/// Unpack bytes into samples of the native width, truncating or zero-padding
/// to the expected count.
fn unpack(attrs: &ImageAttributes, pixel_data: &[u8], expected: usize) -> Vec<u16> {
    let mut samples: Vec<u16> = if attrs.bits_allocated <= 8 {
        pixel_data.iter().map(|&b| b as u16).collect()
    } else {
        pixel_data
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    };

    if samples.len() != expected {
        warn!(
            got = samples.len(),
            expected, "pixel data length does not match image geometry"
        );
        samples.resize(expected, 0);
    }
    samples
}

/// Mask each sample to Bits Stored and map signed values to offset binary.
fn normalize_samples(attrs: &ImageAttributes, samples: &mut [u16]) {
    let mask: u32 = (1u32 << attrs.bits_stored) - 1;
    let half: u32 = 1u32 << (attrs.bits_stored - 1);
    for v in samples.iter_mut() {
        let mut value = *v as u32 & mask;
        if attrs.pixel_representation == 1 {
            value = (value + half) & mask;
        }
        *v = value as u16;
    }
}

fn decode_single_sample(
    attrs: &ImageAttributes,
    pixel_data: &[u8],
) -> Result<Raster, PipelineError> {
    let expected = attrs.rows as usize * attrs.columns as usize;
    let mut samples = unpack(attrs, pixel_data, expected);
    normalize_samples(attrs, &mut samples);

    let max_value = ((1u32 << attrs.bits_stored) - 1) as u16;

    match attrs.photometric_interpretation {
        PhotometricInterpretation::Monochrome1 => {
            for v in samples.iter_mut() {
                *v = max_value - *v;
            }
        }
        PhotometricInterpretation::PaletteColor => {
            if let Some(palette) = &attrs.palette {
                let mut out = RgbImage::new(attrs.columns, attrs.rows);
                for (px, &v) in out.pixels_mut().zip(samples.iter()) {
                    px.0 = palette.rgb(v);
                }
                return Ok(Raster::Rgb(out));
            }
            // no lookup tables were supplied: render as grayscale
            warn!("PALETTE COLOR without lookup tables, rendering as grayscale");
        }
        _ => {}
    }

    let bytes = match (attrs.window_center, attrs.window_width) {
        (Some(center), Some(width)) if width > 0.0 => apply_window(&samples, center, width),
        _ => rescale_min_max(&samples, attrs.bits_stored),
    };

    let img = GrayImage::from_raw(attrs.columns, attrs.rows, bytes)
        .expect("raster buffer sized from geometry");
    Ok(Raster::Gray(img))
}

fn decode_color(attrs: &ImageAttributes, pixel_data: &[u8]) -> Result<Raster, PipelineError> {
    if attrs.photometric_interpretation == PhotometricInterpretation::YbrFull422 {
        return decode_ybr_422(attrs, pixel_data);
    }

    let pixels = attrs.rows as usize * attrs.columns as usize;
    let expected = pixels * 3;
    let mut samples = unpack(attrs, pixel_data, expected);
    normalize_samples(attrs, &mut samples);

    if attrs.planar_configuration == 1 {
        samples = interleave_planes(&samples, pixels);
    }

    let shift = attrs.bits_stored.saturating_sub(8);
    let mut bytes: Vec<u8> = samples.iter().map(|&v| (v >> shift) as u8).collect();

    if attrs.photometric_interpretation == PhotometricInterpretation::YbrFull {
        for triplet in bytes.chunks_exact_mut(3) {
            let [y, cb, cr] = [triplet[0], triplet[1], triplet[2]];
            let rgb = ybr_to_rgb(y, cb, cr);
            triplet.copy_from_slice(&rgb);
        }
    }

    let img = RgbImage::from_raw(attrs.columns, attrs.rows, bytes)
        .expect("raster buffer sized from geometry");
    Ok(Raster::Rgb(img))
}

/// YBR_FULL_422 stores Y0 Y1 Cb Cr per horizontal pixel pair.
fn decode_ybr_422(attrs: &ImageAttributes, pixel_data: &[u8]) -> Result<Raster, PipelineError> {
    let pixels = attrs.rows as usize * attrs.columns as usize;
    let expected = pixels * 2;
    let mut data = pixel_data.to_vec();
    if data.len() != expected {
        warn!(
            got = data.len(),
            expected, "pixel data length does not match 4:2:2 geometry"
        );
        data.resize(expected, 0);
    }

    let mut bytes = Vec::with_capacity(pixels * 3);
    for quad in data.chunks_exact(4) {
        let [y0, y1, cb, cr] = [quad[0], quad[1], quad[2], quad[3]];
        bytes.extend_from_slice(&ybr_to_rgb(y0, cb, cr));
        bytes.extend_from_slice(&ybr_to_rgb(y1, cb, cr));
    }
    bytes.resize(pixels * 3, 0);

    let img = RgbImage::from_raw(attrs.columns, attrs.rows, bytes)
        .expect("raster buffer sized from geometry");
    Ok(Raster::Rgb(img))
}

/// ITU-R BT.601 full-range YCbCr to RGB.
fn ybr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = y as f32;
    let cb = cb as f32 - 128.0;
    let cr = cr as f32 - 128.0;
    let r = y + 1.402 * cr;
    let g = y - 0.344136 * cb - 0.714136 * cr;
    let b = y + 1.772 * cb;
    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// R1 R2 ... G1 G2 ... B1 B2 ... to R1 G1 B1 R2 G2 B2 ...
fn interleave_planes(samples: &[u16], pixels: usize) -> Vec<u16> {
    let mut out = vec![0u16; pixels * 3];
    for i in 0..pixels {
        out[i * 3] = samples[i];
        out[i * 3 + 1] = samples[pixels + i];
        out[i * 3 + 2] = samples[pixels * 2 + i];
    }
    out
}

/// Linear VOI window (PS3.3 C.11.2.1.2).
fn apply_window(samples: &[u16], center: f64, width: f64) -> Vec<u8> {
    let lower = center - 0.5 - (width - 1.0) / 2.0;
    let upper = center - 0.5 + (width - 1.0) / 2.0;
    samples
        .iter()
        .map(|&v| {
            let v = v as f64;
            if v <= lower {
                0
            } else if v > upper {
                255
            } else {
                (((v - (center - 0.5)) / (width - 1.0) + 0.5) * 255.0).round() as u8
            }
        })
        .collect()
}

/// Min-anchored, max-normalized rescale to 0..255.
///
/// An all-zero image stays uniform zero; any other constant image keeps its
/// level (so an inverted all-zero MONOCHROME1 frame renders white).
fn rescale_min_max(samples: &[u16], bits_stored: u16) -> Vec<u8> {
    let min = samples.iter().copied().min().unwrap_or(0);
    let max = samples.iter().copied().max().unwrap_or(0);
    if min == max {
        let shift = bits_stored.saturating_sub(8);
        return vec![(max >> shift) as u8; samples.len()];
    }
    let range = (max - min) as f64;
    samples
        .iter()
        .map(|&v| (((v - min) as f64 / range) * 255.0).round() as u8)
        .collect()
}
