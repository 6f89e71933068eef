//! Film page assembly.
//!
//! Turns a completed Film Box (layout, film attributes, image slots) into a
//! single raster page: one cell per Image Box, scaled to fit and centered,
//! with placeholders for slots that never received pixel data.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use tracing::warn;

use crate::layout::Cell;
use crate::pixel::{self, Raster};
use crate::store::{BorderDensity, FilmOrientation, FilmSnapshot, MagnificationType, Polarity};

/// Film pages are rendered at 300 DPI.
pub const DPI: u32 = 300;

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const DARK: Rgb<u8> = Rgb([40, 40, 40]);
const LIGHT: Rgb<u8> = Rgb([230, 230, 230]);

/// A finished page plus a flag for any slot that was rendered best-effort.
#[derive(Debug)]
pub struct AssembledPage {
    pub raster: Raster,
    pub warnings: bool,
}

/// Page dimensions in pixels for a film size identifier at [`DPI`].
///
/// Unknown identifiers fall back to A4.
pub fn page_size(film_size_id: &str, orientation: FilmOrientation) -> (u32, u32) {
    let id = film_size_id.trim().trim_end_matches('\0').trim();
    let (w, h) = match id {
        "A4" | "" => (2480, 3508),
        "A3" => (3508, 4961),
        "8INX10IN" => (2400, 3000),
        "8_5INX11IN" => (2550, 3300),
        "10INX12IN" => (3000, 3600),
        "10INX14IN" => (3000, 4200),
        "11INX14IN" => (3300, 4200),
        "14INX14IN" => (4200, 4200),
        "14INX17IN" => (4200, 5100),
        "24CMX24CM" => (2835, 2835),
        "24CMX30CM" => (2835, 3543),
        other => {
            warn!(film_size_id = other, "unknown film size, using A4");
            (2480, 3508)
        }
    };
    match orientation {
        FilmOrientation::Portrait => (w, h),
        FilmOrientation::Landscape => (h, w),
    }
}

/// Compose the film page for a snapshotted Film Box.
pub fn assemble(film: &FilmSnapshot) -> AssembledPage {
    let (width, height) = page_size(&film.film_size_id, film.orientation);
    let cells = film.format.cells(width, height);

    let mut warnings = false;
    let mut any_color = false;
    let mut decoded: Vec<Option<Raster>> = Vec::with_capacity(film.slots.len());
    for slot in &film.slots {
        let raster = match &slot.image {
            Some(content) => match pixel::decode(&content.attrs, &content.pixel_data) {
                Ok(mut raster) => {
                    if slot.polarity == Polarity::Reverse {
                        raster.invert();
                    }
                    Some(raster)
                }
                Err(e) => {
                    warn!(
                        film_box = %film.film_box_uid,
                        position = slot.position,
                        error = %e,
                        "image slot could not be decoded, drawing placeholder"
                    );
                    warnings = true;
                    None
                }
            },
            None => None,
        };
        if let Some(raster) = &raster {
            any_color |= !raster.is_gray();
        }
        decoded.push(raster);
    }

    let mut canvas = RgbImage::from_pixel(width, height, WHITE);

    for (index, (slot, raster)) in film.slots.iter().zip(decoded).enumerate() {
        let Some(cell) = cells.get(index).copied() else {
            // more slots than the layout defines; create() prevents this
            warn!(position = slot.position, "image slot without a layout cell");
            warnings = true;
            continue;
        };
        match raster {
            Some(raster) => {
                let magnification = slot.magnification.unwrap_or(film.magnification);
                draw_image(&mut canvas, cell, &raster, magnification);
            }
            None => draw_placeholder(&mut canvas, cell, slot.position),
        }
        if let Some(density) = film.border_density {
            outline_rect(&mut canvas, cell, 2, border_color(density));
        }
    }

    if film.trim {
        draw_trim_marks(&mut canvas);
    }

    let raster = if any_color {
        Raster::Rgb(canvas)
    } else {
        // every slot was grayscale (or empty) and decoration is neutral,
        // so collapse to a single channel
        let gray = GrayImage::from_fn(width, height, |x, y| {
            image::Luma([canvas.get_pixel(x, y).0[0]])
        });
        Raster::Gray(gray)
    };

    AssembledPage { raster, warnings }
}

fn resize_filter(magnification: MagnificationType) -> FilterType {
    match magnification {
        MagnificationType::None | MagnificationType::Replicate => FilterType::Nearest,
        MagnificationType::Bilinear => FilterType::Triangle,
        MagnificationType::Cubic => FilterType::CatmullRom,
    }
}

fn draw_image(canvas: &mut RgbImage, cell: Cell, raster: &Raster, magnification: MagnificationType) {
    let (iw, ih) = (raster.width(), raster.height());
    if iw == 0 || ih == 0 || cell.width == 0 || cell.height == 0 {
        return;
    }

    let fit = f64::min(
        cell.width as f64 / iw as f64,
        cell.height as f64 / ih as f64,
    );
    let scale = match magnification {
        // REPLICATE pins the factor to a whole number of source pixels
        MagnificationType::Replicate if fit >= 1.0 => fit.floor(),
        _ => fit,
    };
    let out_w = ((iw as f64 * scale).round() as u32).clamp(1, cell.width);
    let out_h = ((ih as f64 * scale).round() as u32).clamp(1, cell.height);

    let rgb = match raster {
        Raster::Gray(img) => DynamicImage::ImageLuma8(img.clone()).to_rgb8(),
        Raster::Rgb(img) => img.clone(),
    };
    let scaled = imageops::resize(&rgb, out_w, out_h, resize_filter(magnification));

    let x0 = cell.x + (cell.width - out_w) / 2;
    let y0 = cell.y + (cell.height - out_h) / 2;
    imageops::overlay(canvas, &scaled, x0 as i64, y0 as i64);
}

/// An empty slot renders as a light box with its image position number.
fn draw_placeholder(canvas: &mut RgbImage, cell: Cell, position: u16) {
    let inset = (cell.width.min(cell.height) / 20).max(4);
    let inner = Cell {
        x: cell.x + inset,
        y: cell.y + inset,
        width: cell.width.saturating_sub(inset * 2),
        height: cell.height.saturating_sub(inset * 2),
    };
    fill_rect(canvas, inner, LIGHT);
    outline_rect(canvas, inner, 2, DARK);
    draw_number(canvas, inner, position, DARK);
}

fn fill_rect(canvas: &mut RgbImage, rect: Cell, color: Rgb<u8>) {
    for y in rect.y..(rect.y + rect.height).min(canvas.height()) {
        for x in rect.x..(rect.x + rect.width).min(canvas.width()) {
            canvas.put_pixel(x, y, color);
        }
    }
}

fn outline_rect(canvas: &mut RgbImage, rect: Cell, thickness: u32, color: Rgb<u8>) {
    let t = thickness.min(rect.width / 2).min(rect.height / 2).max(1);
    fill_rect(
        canvas,
        Cell {
            height: t,
            ..rect
        },
        color,
    );
    fill_rect(
        canvas,
        Cell {
            y: rect.y + rect.height - t,
            height: t,
            ..rect
        },
        color,
    );
    fill_rect(
        canvas,
        Cell {
            width: t,
            ..rect
        },
        color,
    );
    fill_rect(
        canvas,
        Cell {
            x: rect.x + rect.width - t,
            width: t,
            ..rect
        },
        color,
    );
}

fn border_color(density: BorderDensity) -> Rgb<u8> {
    match density {
        BorderDensity::Black => Rgb([0, 0, 0]),
        BorderDensity::White => WHITE,
        // numeric density is hundredths of optical density; OD 1.0 and
        // above prints effectively black
        BorderDensity::Density(d) if d >= 100 => Rgb([0, 0, 0]),
        BorderDensity::Density(_) => WHITE,
    }
}

fn draw_trim_marks(canvas: &mut RgbImage) {
    let (w, h) = canvas.dimensions();
    let len = (w.min(h) / 40).max(16);
    let t = 3;
    let black = Rgb([0, 0, 0]);
    for &(cx, cy) in &[(0, 0), (w - len, 0), (0, h - len), (w - len, h - len)] {
        fill_rect(
            canvas,
            Cell {
                x: cx,
                y: if cy == 0 { 0 } else { h - t },
                width: len,
                height: t,
            },
            black,
        );
        fill_rect(
            canvas,
            Cell {
                x: if cx == 0 { 0 } else { w - t },
                y: cy,
                width: t,
                height: len,
            },
            black,
        );
    }
}

/// 3x5 digit glyphs, one row per byte, three low bits used.
const DIGIT_ROWS: [[u8; 5]; 10] = [
    [0b111, 0b101, 0b101, 0b101, 0b111],
    [0b010, 0b110, 0b010, 0b010, 0b111],
    [0b111, 0b001, 0b111, 0b100, 0b111],
    [0b111, 0b001, 0b111, 0b001, 0b111],
    [0b101, 0b101, 0b111, 0b001, 0b001],
    [0b111, 0b100, 0b111, 0b001, 0b111],
    [0b111, 0b100, 0b111, 0b101, 0b111],
    [0b111, 0b001, 0b001, 0b001, 0b001],
    [0b111, 0b101, 0b111, 0b101, 0b111],
    [0b111, 0b101, 0b111, 0b001, 0b111],
];

fn draw_number(canvas: &mut RgbImage, rect: Cell, value: u16, color: Rgb<u8>) {
    let digits: Vec<usize> = value
        .to_string()
        .bytes()
        .map(|b| (b - b'0') as usize)
        .collect();
    let scale = (rect.height / 24).clamp(2, 24);
    let glyph_w = 3 * scale;
    let glyph_h = 5 * scale;
    let advance = glyph_w + scale;
    let total_w = advance * digits.len() as u32 - scale;
    if total_w > rect.width || glyph_h > rect.height {
        return;
    }
    let mut x0 = rect.x + (rect.width - total_w) / 2;
    let y0 = rect.y + (rect.height - glyph_h) / 2;
    for digit in digits {
        for (row, bits) in DIGIT_ROWS[digit].iter().enumerate() {
            for col in 0..3u32 {
                if bits & (0b100 >> col) != 0 {
                    fill_rect(
                        canvas,
                        Cell {
                            x: x0 + col * scale,
                            y: y0 + row as u32 * scale,
                            width: scale,
                            height: scale,
                        },
                        color,
                    );
                }
            }
        }
        x0 += advance;
    }
}
