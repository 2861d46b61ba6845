//! Loss-curve rendering
//!
//! Six panels in a 3x2 grid, one per loss series, each showing the training
//! curve in blue and the validation curve in red against the epoch index. Each
//! panel is titled with its loss name; the last panel carries the legend
//! (swatch plus `train`/`val` label) in its upper-right corner. Text uses a
//! built-in 3x5 bitmap font.

use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, Rgb, RgbImage};

use super::{LossHistory, LossKind, Phase};
use crate::error::Result;

const PANEL_W: u32 = 320;
const PANEL_H: u32 = 220;
const COLS: u32 = 3;
const ROWS: u32 = 2;
const MARGIN: u32 = 24;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXES: Rgb<u8> = Rgb([64, 64, 64]);
const TRAIN: Rgb<u8> = Rgb([31, 119, 180]);
const VALIDATION: Rgb<u8> = Rgb([214, 39, 40]);

const GLYPH_SCALE: i64 = 2;
const GLYPH_ADVANCE: i64 = 4 * GLYPH_SCALE;

/// Image size of the rendered figure
pub fn figure_size() -> (u32, u32) {
    (PANEL_W * COLS, PANEL_H * ROWS)
}

/// Render the history as PNG bytes
pub fn render(history: &LossHistory) -> Result<Vec<u8>> {
    let img = draw(history);
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes).write_image(img.as_raw(), img.width(), img.height(), ColorType::Rgb8)?;
    Ok(bytes)
}

/// Rasterize the history into an RGB image
pub fn draw(history: &LossHistory) -> RgbImage {
    let (w, h) = figure_size();
    let mut img = RgbImage::from_pixel(w, h, BACKGROUND);

    for (i, kind) in LossKind::ALL.iter().enumerate() {
        let col = i as u32 % COLS;
        let row = i as u32 / COLS;
        let area = PlotArea {
            x0: col * PANEL_W + MARGIN,
            y0: row * PANEL_H + MARGIN,
            x1: (col + 1) * PANEL_W - MARGIN,
            y1: (row + 1) * PANEL_H - MARGIN,
        };
        draw_text(
            &mut img,
            area.x0 as i64,
            area.y0 as i64 - 6 * GLYPH_SCALE - 2,
            kind.name(),
            AXES,
        );
        draw_panel(
            &mut img,
            &area,
            history.get(Phase::Train, *kind),
            history.get(Phase::Validation, *kind),
        );
        if i + 1 == LossKind::ALL.len() {
            draw_legend(&mut img, &area);
        }
    }
    img
}

struct PlotArea {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl PlotArea {
    fn project(&self, index: usize, len: usize, value: f64, lo: f64, hi: f64) -> (i64, i64) {
        let fx = if len > 1 {
            index as f64 / (len - 1) as f64
        } else {
            0.5
        };
        let fy = if hi > lo { (value - lo) / (hi - lo) } else { 0.5 };
        let x = self.x0 as f64 + fx * (self.x1 - self.x0) as f64;
        let y = self.y1 as f64 - fy * (self.y1 - self.y0) as f64;
        (x.round() as i64, y.round() as i64)
    }
}

fn draw_panel(img: &mut RgbImage, area: &PlotArea, train: &[f64], validation: &[f64]) {
    draw_rect(img, area, AXES);

    let finite = train.iter().chain(validation).copied().filter(|v| v.is_finite());
    let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !lo.is_finite() {
        return;
    }
    let pad = ((hi - lo) * 0.05).max(1e-12);
    let (lo, hi) = (lo - pad, hi + pad);

    for (series, color) in [(train, TRAIN), (validation, VALIDATION)] {
        let mut previous: Option<(i64, i64)> = None;
        for (i, &v) in series.iter().enumerate() {
            if !v.is_finite() {
                previous = None;
                continue;
            }
            let point = area.project(i, series.len(), v, lo, hi);
            match previous {
                Some(p) => draw_line(img, p, point, color),
                None => fill_square(img, point, 2, color),
            }
            previous = Some(point);
        }
    }
}

fn draw_legend(img: &mut RgbImage, area: &PlotArea) {
    let size = 10;
    let x = area.x1 as i64 - 8 - size;
    let y = area.y0 as i64 + 8;
    for (k, (color, label)) in [(TRAIN, "train"), (VALIDATION, "val")].into_iter().enumerate() {
        let top = y + k as i64 * (size + 6);
        for dy in 0..size {
            for dx in 0..size {
                put(img, x + dx, top + dy, color);
            }
        }
        let width = label.len() as i64 * GLYPH_ADVANCE;
        draw_text(img, x - 4 - width, top, label, AXES);
    }
}

/// Rows of a 3x5 glyph, most significant of the low three bits leftmost
fn glyph(c: char) -> [u8; 5] {
    match c {
        'a' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'b' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'c' => [0b011, 0b100, 0b100, 0b100, 0b011],
        'e' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'f' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'g' => [0b011, 0b100, 0b101, 0b101, 0b011],
        'i' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'j' => [0b001, 0b001, 0b001, 0b101, 0b010],
        'k' => [0b101, 0b101, 0b110, 0b101, 0b101],
        'l' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'm' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'n' => [0b110, 0b101, 0b101, 0b101, 0b101],
        'o' => [0b010, 0b101, 0b101, 0b101, 0b010],
        'p' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'r' => [0b110, 0b101, 0b110, 0b101, 0b101],
        's' => [0b011, 0b100, 0b010, 0b001, 0b110],
        't' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'u' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'v' => [0b101, 0b101, 0b101, 0b101, 0b010],
        'x' => [0b101, 0b101, 0b010, 0b101, 0b101],
        '_' => [0b000, 0b000, 0b000, 0b000, 0b111],
        _ => [0; 5],
    }
}

fn draw_text(img: &mut RgbImage, x: i64, y: i64, text: &str, color: Rgb<u8>) {
    for (i, c) in text.chars().enumerate() {
        let left = x + i as i64 * GLYPH_ADVANCE;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..3 {
                if bits & (0b100u8 >> col) == 0 {
                    continue;
                }
                for dy in 0..GLYPH_SCALE {
                    for dx in 0..GLYPH_SCALE {
                        put(img, left + col * GLYPH_SCALE + dx, y + row as i64 * GLYPH_SCALE + dy, color);
                    }
                }
            }
        }
    }
}

fn draw_rect(img: &mut RgbImage, area: &PlotArea, color: Rgb<u8>) {
    for x in area.x0..=area.x1 {
        put(img, x as i64, area.y0 as i64, color);
        put(img, x as i64, area.y1 as i64, color);
    }
    for y in area.y0..=area.y1 {
        put(img, area.x0 as i64, y as i64, color);
        put(img, area.x1 as i64, y as i64, color);
    }
}

fn fill_square(img: &mut RgbImage, center: (i64, i64), radius: i64, color: Rgb<u8>) {
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            put(img, center.0 + dx, center.1 + dy, color);
        }
    }
}

/// Bresenham line
fn draw_line(img: &mut RgbImage, from: (i64, i64), to: (i64, i64), color: Rgb<u8>) {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        put(img, x, y, color);
        if x == to.0 && y == to.1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn put(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}
