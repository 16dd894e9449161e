//! Annotation renderer.
//!
//! Paints the latest raster and then the latest detection set on top of it.
//! [`AnnotationRenderer::plan`] turns detections into draw operations without
//! touching pixels; [`AnnotationRenderer::render`] executes the plan.
//! Operations follow the detection order, so later boxes draw over earlier ones.

use image::{DynamicImage, Pixel, Rgba, RgbImage, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detection::{Detection, DetectionResult};

pub mod font;
pub mod sink;

pub use font::LabelFont;
pub use sink::{JpegFileSink, LatestFrameSink, OverlaySink};

/// Box stroke colour (#00ff00)
pub const BOX_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
/// Chip fill, green at 80% opacity
pub const CHIP_COLOR: Rgba<u8> = Rgba([0, 255, 0, 204]);
pub const TEXT_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);

pub const STROKE_WIDTH: u32 = 3;
pub const CHIP_HEIGHT: u32 = 20;
pub const CHIP_PADDING: u32 = 4;
/// Boxes whose top edge is above this line get their chip inside the box
pub const LABEL_FLIP_Y: f32 = 25.0;
/// Planned coordinates are clamped to +/- this many pixels
pub const COORD_LIMIT: f32 = 1_048_576.0;

/// One overlay drawing step
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    /// Unfilled box from (x1, y1) to (x2, y2)
    Rect { x1: i32, y1: i32, x2: i32, y2: i32 },
    /// Filled label background
    Chip { x: i32, y: i32, width: u32, height: u32 },
    /// Label text with its top-left corner at (x, y)
    Text { x: i32, y: i32, text: String },
}

/// Where a label chip sits relative to its box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelPlacement {
    Above,
    Inside,
}

pub fn label_placement(y1: f32) -> LabelPlacement {
    if y1 < LABEL_FLIP_Y {
        LabelPlacement::Inside
    } else {
        LabelPlacement::Above
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnnotationRenderer {
    font: LabelFont,
}

impl AnnotationRenderer {
    pub fn new(font: LabelFont) -> Self {
        Self { font }
    }

    pub fn font(&self) -> &LabelFont {
        &self.font
    }

    /// Overlay operations for `detections`, in input order.
    pub fn plan(&self, detections: &[Detection]) -> Vec<DrawOp> {
        let mut ops = Vec::with_capacity(detections.len() * 3);

        for detection in detections {
            let [x1, y1, x2, y2] = detection.normalized_bbox();
            let (bx1, by1) = (to_pixel(x1), to_pixel(y1));
            ops.push(DrawOp::Rect {
                x1: bx1,
                y1: by1,
                x2: to_pixel(x2),
                y2: to_pixel(y2),
            });

            let label = detection.label();
            let (text_w, text_h) = self.font.measure(&label);
            let chip_y = match label_placement(y1) {
                LabelPlacement::Above => by1 - CHIP_HEIGHT as i32,
                LabelPlacement::Inside => by1,
            };

            ops.push(DrawOp::Chip {
                x: bx1,
                y: chip_y,
                width: text_w.saturating_add(2 * CHIP_PADDING),
                height: CHIP_HEIGHT,
            });
            ops.push(DrawOp::Text {
                x: bx1 + CHIP_PADDING as i32,
                y: chip_y + (CHIP_HEIGHT as i32 - text_h as i32).max(0) / 2,
                text: label,
            });
        }

        ops
    }

    /// Paint `raster` and the detections of `result` onto a new output surface.
    ///
    /// An empty result yields the bare raster; nothing from earlier results is kept.
    pub fn render(&self, raster: &RgbImage, result: &DetectionResult) -> RgbaImage {
        let mut surface = DynamicImage::ImageRgb8(raster.clone()).to_rgba8();
        for op in self.plan(&result.ships) {
            self.execute(&mut surface, &op);
        }
        surface
    }

    fn execute(&self, surface: &mut RgbaImage, op: &DrawOp) {
        match op {
            DrawOp::Rect { x1, y1, x2, y2 } => stroke_rect(surface, *x1, *y1, *x2, *y2),
            DrawOp::Chip {
                x,
                y,
                width,
                height,
            } => blend_rect(surface, *x, *y, *width, *height, CHIP_COLOR),
            DrawOp::Text { x, y, text } => self.font.draw(surface, *x, *y, text, TEXT_COLOR),
        }
    }
}

/// Detector coordinates are untrusted; NaN maps to 0.
fn to_pixel(v: f32) -> i32 {
    v.clamp(-COORD_LIMIT, COORD_LIMIT).round() as i32
}

/// Rectangle outline centred on the box edges, `STROKE_WIDTH` pixels wide.
fn stroke_rect(surface: &mut RgbaImage, x1: i32, y1: i32, x2: i32, y2: i32) {
    let half = (STROKE_WIDTH / 2) as i32;
    // Edges beyond this margin are off the surface for every inset
    let margin = STROKE_WIDTH as i32 + 1;
    let clip_x = |x: i32| x.clamp(-margin, (surface.width() as i32).saturating_add(margin));
    let clip_y = |y: i32| y.clamp(-margin, (surface.height() as i32).saturating_add(margin));
    let (x1, x2) = (clip_x(x1), clip_x(x2));
    let (y1, y2) = (clip_y(y1), clip_y(y2));

    for inset in -half..=half {
        let left = x1 + inset;
        let top = y1 + inset;
        let width = x2 - x1 - 2 * inset;
        let height = y2 - y1 - 2 * inset;
        if width <= 0 || height <= 0 {
            continue;
        }
        let rect = Rect::at(left, top).of_size(width as u32 + 1, height as u32 + 1);
        draw_hollow_rect_mut(surface, rect, BOX_COLOR);
    }
}

fn blend_rect(surface: &mut RgbaImage, x: i32, y: i32, width: u32, height: u32, color: Rgba<u8>) {
    let (surface_w, surface_h) = (surface.width() as i64, surface.height() as i64);
    let x0 = (x as i64).clamp(0, surface_w) as u32;
    let y0 = (y as i64).clamp(0, surface_h) as u32;
    let x1 = (x as i64 + width as i64).clamp(0, surface_w) as u32;
    let y1 = (y as i64 + height as i64).clamp(0, surface_h) as u32;

    for py in y0..y1 {
        for px in x0..x1 {
            surface.get_pixel_mut(px, py).blend(&color);
        }
    }
}
