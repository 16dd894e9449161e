//! Label fonts.
//!
//! A TrueType font (via `ab_glyph`) when the operator configures one,
//! otherwise a built-in 5x7 bitmap font that renders upper-case glyphs.

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};

const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;

/// Font used for label chips
#[derive(Clone)]
pub enum LabelFont {
    /// Built-in bitmap font, each glyph pixel drawn as `scale` x `scale`
    Bitmap { scale: u32 },
    TrueType { font: FontArc, scale: PxScale },
}

impl Default for LabelFont {
    fn default() -> Self {
        LabelFont::Bitmap { scale: 2 }
    }
}

impl std::fmt::Debug for LabelFont {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelFont::Bitmap { scale } => write!(f, "Bitmap(x{})", scale),
            LabelFont::TrueType { scale, .. } => write!(f, "TrueType({}px)", scale.y),
        }
    }
}

impl LabelFont {
    /// Load a TTF/OTF file at `px` pixels.
    pub fn load(path: &Path, px: f32) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("read font {}", path.display()))?;
        let font = FontArc::try_from_vec(data)
            .with_context(|| format!("parse font {}", path.display()))?;
        Ok(LabelFont::TrueType {
            font,
            scale: PxScale::from(px),
        })
    }

    /// Rendered width and height of `text` in pixels.
    pub fn measure(&self, text: &str) -> (u32, u32) {
        match self {
            LabelFont::Bitmap { scale } => {
                let chars = text.chars().count() as u32;
                let advance = (GLYPH_W + 1) * scale;
                (chars * advance, GLYPH_H * scale)
            }
            LabelFont::TrueType { font, scale } => text_size(*scale, font, text),
        }
    }

    /// Draw `text` with its top-left corner at (x, y). Clipped to the image.
    pub fn draw(&self, image: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>) {
        match self {
            LabelFont::Bitmap { scale } => draw_bitmap(image, x, y, text, color, *scale),
            LabelFont::TrueType { font, scale } => {
                draw_text_mut(image, color, x, y, *scale, font, text)
            }
        }
    }
}

fn draw_bitmap(image: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let (width, height) = (image.width() as i64, image.height() as i64);
    let scale = scale.max(1) as i64;
    let advance = (GLYPH_W as i64 + 1) * scale;
    let (x, y) = (x as i64, y as i64);
    if y >= height || y + GLYPH_H as i64 * scale <= 0 {
        return;
    }

    for (i, ch) in text.chars().flat_map(|c| c.to_uppercase()).enumerate() {
        let origin_x = x.saturating_add((i as i64).saturating_mul(advance));
        if origin_x >= width {
            break;
        }
        if origin_x + advance <= 0 {
            continue;
        }
        let Some(rows) = glyph_bits(ch) else {
            continue;
        };
        for (row, pattern) in rows.iter().enumerate() {
            for col in 0..GLYPH_W as i64 {
                if (pattern >> (GLYPH_W as i64 - 1 - col)) & 1 == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let px = origin_x + col * scale + dx;
                        let py = y + row as i64 * scale + dy;
                        if px >= 0 && py >= 0 && px < width && py < height {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b11001, 0b11010, 0b00010, 0b00100, 0b01000, 0b01011, 0b10011],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}
