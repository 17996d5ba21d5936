//! Stacks six shape outlines into one figurine image.
//!
//! The same composition drives two outputs that must stay aligned: a compact
//! SVG (kept alongside the slip record) and a fixed-width monochrome raster
//! for the thermal printer. Both are produced from one deterministic layout,
//! so identical inputs serialize byte-identically.

use crate::shapes::Shape;

use image::{GrayImage, Luma};
use std::{error::Error, fmt, io, path::Path};

/// Relative level heights, top of the stack first.
pub const LEVEL_HEIGHT_RATIOS: [f64; 6] = [1.5, 3.0, 1.0, 6.0, 6.0, 1.5];

/// Blank margin around the stack, in canvas units.
const PADDING: f64 = 16.0;

/// Stroke width of the shape outlines, in canvas units.
const STROKE: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct Level {
    pub shape: Shape,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A laid-out figurine: canvas dimensions plus one placed level per shape,
/// top to bottom.
#[derive(Debug, Clone)]
pub struct Composition {
    pub width: f64,
    pub height: f64,
    pub levels: Vec<Level>,
}

#[derive(Debug)]
pub enum ComposerError {
    Io(io::Error),
    Png(image::ImageError),
}

impl fmt::Display for ComposerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComposerError::Io(e) => write!(f, "io error: {}", e),
            ComposerError::Png(e) => write!(f, "png encoding error: {}", e),
        }
    }
}

impl Error for ComposerError {}

impl From<io::Error> for ComposerError {
    fn from(value: io::Error) -> Self {
        ComposerError::Io(value)
    }
}

impl From<image::ImageError> for ComposerError {
    fn from(value: image::ImageError) -> Self {
        ComposerError::Png(value)
    }
}

/// Lay out the shapes top-to-bottom. `total_height` is divided among the six
/// levels by [`LEVEL_HEIGHT_RATIOS`]; each level is as wide as its shape's
/// aspect ratio dictates and is centered horizontally.
pub fn compose(shapes: &[Shape; 6], total_height: f64) -> Composition {
    let ratio_sum: f64 = LEVEL_HEIGHT_RATIOS.iter().sum();
    let heights: Vec<f64> = LEVEL_HEIGHT_RATIOS
        .iter()
        .map(|r| total_height * r / ratio_sum)
        .collect();

    let widths: Vec<f64> = shapes
        .iter()
        .zip(&heights)
        .map(|(s, h)| h * s.width_ratio())
        .collect();
    let max_width = widths.iter().fold(0.0f64, |a, w| a.max(*w));

    let canvas_width = max_width + 2.0 * PADDING;
    let canvas_height = total_height + 2.0 * PADDING;

    let mut levels = Vec::with_capacity(6);
    let mut y = PADDING;
    for ((shape, h), w) in shapes.iter().zip(heights).zip(widths) {
        levels.push(Level {
            shape: *shape,
            x: (canvas_width - w) / 2.0,
            y,
            width: w,
            height: h,
        });
        y += h;
    }

    Composition {
        width: canvas_width,
        height: canvas_height,
        levels,
    }
}

impl Composition {
    /// Canonical SVG text: fixed two-decimal coordinates, one path per level,
    /// white fill with a black outline on a white canvas.
    pub fn to_svg(&self) -> String {
        use std::fmt::Write;

        let mut svg = String::new();
        let _ = write!(
            svg,
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{:.2}\" height=\"{:.2}\" viewBox=\"0 0 {:.2} {:.2}\">\n",
            self.width, self.height, self.width, self.height
        );
        let _ = write!(
            svg,
            "<rect x=\"0\" y=\"0\" width=\"{:.2}\" height=\"{:.2}\" fill=\"white\"/>\n",
            self.width, self.height
        );
        for level in &self.levels {
            let pts = level.shape.outline(level.height);
            let _ = write!(svg, "<path d=\"");
            for (i, (px, py)) in pts.iter().enumerate() {
                let cmd = if i == 0 { 'M' } else { 'L' };
                let _ = write!(svg, "{}{:.2},{:.2} ", cmd, level.x + px, level.y + py);
            }
            let _ = write!(
                svg,
                "Z\" fill=\"white\" stroke=\"black\" stroke-width=\"{:.2}\"/>\n",
                STROKE
            );
        }
        svg.push_str("</svg>\n");
        svg
    }

    /// Rasterize the outlines to a 1-bit bitmap `target_width` dots wide,
    /// preserving the aspect ratio.
    pub fn rasterize(&self, target_width: u32) -> Raster {
        let scale = target_width as f64 / self.width;
        let height = (self.height * scale).round().max(1.0) as u32;
        let mut raster = Raster::new(target_width, height);

        let pen = (STROKE * scale).round().max(1.0) as u32;
        for level in &self.levels {
            let pts = level.shape.outline(level.height);
            for i in 0..pts.len() {
                let (x0, y0) = pts[i];
                let (x1, y1) = pts[(i + 1) % pts.len()];
                raster.stroke_segment(
                    (level.x + x0) * scale,
                    (level.y + y0) * scale,
                    (level.x + x1) * scale,
                    (level.y + y1) * scale,
                    pen,
                );
            }
        }
        raster
    }
}

/// A monochrome bitmap, one bit per dot, rows packed most-significant-bit
/// first. This is exactly the layout the printer's raster command wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Raster {
    pub fn new(width: u32, height: u32) -> Self {
        let stride = Self::stride_for(width);
        Raster {
            width,
            height,
            data: vec![0; stride * height as usize],
        }
    }

    fn stride_for(width: u32) -> usize {
        (width as usize + 7) / 8
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per packed row.
    pub fn stride(&self) -> usize {
        Self::stride_for(self.width)
    }

    /// The packed rows, top to bottom.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set(&mut self, x: u32, y: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = y as usize * self.stride() + (x / 8) as usize;
        self.data[idx] |= 0x80 >> (x % 8);
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let idx = y as usize * self.stride() + (x / 8) as usize;
        self.data[idx] & (0x80 >> (x % 8)) != 0
    }

    /// Mark a line segment with a square pen of `pen` dots.
    fn stroke_segment(&mut self, x0: f64, y0: f64, x1: f64, y1: f64, pen: u32) {
        let steps = (x1 - x0).abs().max((y1 - y0).abs()).ceil().max(1.0) as u32;
        let half = pen as f64 / 2.0;
        for i in 0..=steps {
            let t = i as f64 / steps as f64;
            let cx = x0 + (x1 - x0) * t;
            let cy = y0 + (y1 - y0) * t;
            for dy in 0..pen {
                for dx in 0..pen {
                    let px = cx - half + dx as f64;
                    let py = cy - half + dy as f64;
                    if px >= 0.0 && py >= 0.0 {
                        self.set(px as u32, py as u32);
                    }
                }
            }
        }
    }

    /// Count of black dots; used for sanity checks and tests.
    pub fn ink(&self) -> usize {
        self.data.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Write the bitmap as a PNG (black ink on white).
    pub fn save_png(&self, path: &Path) -> Result<(), ComposerError> {
        let mut img = GrayImage::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let shade = if self.get(x, y) { 0u8 } else { 255u8 };
                img.put_pixel(x, y, Luma([shade]));
            }
        }
        img.save(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::shapes_of;

    fn sample() -> [Shape; 6] {
        shapes_of(1).unwrap()
    }

    #[test]
    fn canvas_spans_levels_plus_padding() {
        let c = compose(&sample(), 600.0);
        assert!((c.height - 632.0).abs() < 1e-9);

        let level_sum: f64 = c.levels.iter().map(|l| l.height).sum();
        assert!((level_sum - 600.0).abs() < 1e-9);

        let max_width = c.levels.iter().map(|l| l.width).fold(0.0f64, f64::max);
        assert!((c.width - (max_width + 32.0)).abs() < 1e-9);
    }

    #[test]
    fn levels_are_stacked_top_to_bottom_and_centered() {
        let c = compose(&sample(), 600.0);
        let mut y = 16.0;
        for level in &c.levels {
            assert!((level.y - y).abs() < 1e-9);
            assert!((level.x - (c.width - level.width) / 2.0).abs() < 1e-9);
            y += level.height;
        }
    }

    #[test]
    fn height_split_follows_the_ratio_table() {
        let c = compose(&sample(), 190.0);
        let expect = [15.0, 30.0, 10.0, 60.0, 60.0, 15.0];
        for (level, e) in c.levels.iter().zip(expect) {
            assert!((level.height - e).abs() < 1e-9);
        }
    }

    #[test]
    fn svg_is_byte_identical_across_runs() {
        let a = compose(&sample(), 600.0).to_svg();
        let b = compose(&sample(), 600.0).to_svg();
        assert_eq!(a, b);
        assert!(a.starts_with("<svg "));
        assert_eq!(a.matches("<path ").count(), 6);
    }

    #[test]
    fn raster_is_deterministic_and_inked() {
        let c = compose(&sample(), 600.0);
        let a = c.rasterize(512);
        let b = c.rasterize(512);
        assert_eq!(a, b);
        assert_eq!(a.width(), 512);
        assert!(a.ink() > 1000, "expected visible outlines, got {}", a.ink());
    }

    #[test]
    fn raster_bits_pack_msb_first() {
        let mut r = Raster::new(16, 1);
        r.set(0, 0);
        r.set(9, 0);
        assert_eq!(r.data(), &[0x80, 0x40]);
        assert!(r.get(0, 0) && r.get(9, 0) && !r.get(1, 0));
    }

    #[test]
    fn png_roundtrips_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("figurine.png");
        let raster = compose(&sample(), 300.0).rasterize(256);
        raster.save_png(&path).unwrap();
        assert!(path.metadata().unwrap().len() > 0);
    }
}
