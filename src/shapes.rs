//! The parametric shape library the figurines are stacked from.
//!
//! Every shape is defined by its height alone; the width follows from a fixed
//! per-shape aspect ratio. [`Shape::outline`] renders the shape as a closed
//! polygon with the bounding box's top-left corner at the origin and y
//! growing downward. Curves are flattened to a fixed number of segments so
//! that the same shape at the same height always produces the same points.

use std::f64::consts::PI;

/// Segments used to flatten a quarter-turn of arc. Fixed so output is
/// reproducible across runs.
const ARC_SEGMENTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Semioval,
    WideRectangle,
    CapsulePill,
    TaperedTrapezoid,
    BlockyTrapezoid,
    SteppedBlock,
    SphereCircle,
    FlatPyramid,
    FlatRectangle,
    FlatPressedOval,
    FlatTrapezoid,
    TallPyramid,
    Rhombus,
    StackedCircles,
    UprightPill,
    FlatPyramidSockel,
    TallTrapezoid,
    SteppedBlockThree,
    DoubleUprightPill,
    FacingBowls,
}

/// Which shape each answer maps to, indexed `[question][answer]`.
/// Bottom-of-stack questions get flat, wide shapes; the tall mid-stack
/// questions get the slender ones. F04 draws the same thin band for every
/// answer.
pub const SHAPES: [&[Shape]; 6] = [
    // F01, the foot of the figurine
    &[
        Shape::Semioval,
        Shape::FlatRectangle,
        Shape::FlatPressedOval,
        Shape::FlatTrapezoid,
        Shape::FlatPyramid,
        Shape::FlatPyramidSockel,
    ],
    // F02
    &[
        Shape::TallPyramid,
        Shape::TallTrapezoid,
        Shape::UprightPill,
        Shape::DoubleUprightPill,
        Shape::FacingBowls,
    ],
    // F03
    &[
        Shape::StackedCircles,
        Shape::Rhombus,
        Shape::UprightPill,
        Shape::TallTrapezoid,
        Shape::SteppedBlockThree,
    ],
    // F04, a uniform divider band
    &[
        Shape::WideRectangle,
        Shape::WideRectangle,
        Shape::WideRectangle,
        Shape::WideRectangle,
        Shape::WideRectangle,
        Shape::WideRectangle,
    ],
    // F05
    &[
        Shape::WideRectangle,
        Shape::CapsulePill,
        Shape::TaperedTrapezoid,
        Shape::BlockyTrapezoid,
        Shape::SteppedBlock,
    ],
    // F06, the top of the figurine
    &[
        Shape::Semioval,
        Shape::SphereCircle,
        Shape::CapsulePill,
        Shape::TaperedTrapezoid,
        Shape::FlatPressedOval,
        Shape::BlockyTrapezoid,
    ],
];

/// Table lookup with the bounds the catalog already guarantees.
pub fn shape_for(question: usize, answer: usize) -> Shape {
    SHAPES[question][answer]
}

impl Shape {
    pub fn name(&self) -> &'static str {
        match self {
            Shape::Semioval => "semioval",
            Shape::WideRectangle => "wide_rectangle",
            Shape::CapsulePill => "capsule_pill",
            Shape::TaperedTrapezoid => "tapered_trapezoid",
            Shape::BlockyTrapezoid => "blocky_trapezoid",
            Shape::SteppedBlock => "stepped_block",
            Shape::SphereCircle => "sphere_circle",
            Shape::FlatPyramid => "flat_pyramid",
            Shape::FlatRectangle => "flat_rectangle",
            Shape::FlatPressedOval => "flat_pressed_oval",
            Shape::FlatTrapezoid => "flat_trapezoid",
            Shape::TallPyramid => "tall_pyramid",
            Shape::Rhombus => "rhombus",
            Shape::StackedCircles => "stacked_circles",
            Shape::UprightPill => "upright_pill",
            Shape::FlatPyramidSockel => "flat_pyramid_sockel",
            Shape::TallTrapezoid => "tall_trapezoid",
            Shape::SteppedBlockThree => "stepped_block_3",
            Shape::DoubleUprightPill => "double_upright_pill",
            Shape::FacingBowls => "facing_bowls",
        }
    }

    /// Width divided by height.
    pub fn width_ratio(&self) -> f64 {
        match self {
            Shape::Semioval => 2.5,
            Shape::WideRectangle => 2.2,
            Shape::CapsulePill => 2.5,
            Shape::TaperedTrapezoid => 2.5,
            Shape::BlockyTrapezoid => 2.0,
            Shape::SteppedBlock => 2.2,
            Shape::SphereCircle => 1.0,
            Shape::FlatPyramid => 4.0,
            Shape::FlatRectangle => 6.0,
            Shape::FlatPressedOval => 4.0,
            Shape::FlatTrapezoid => 4.0,
            Shape::TallPyramid => 2.0 / 3.0,
            Shape::Rhombus => 2.0 / 3.0,
            // Two equal circles of radius 2h/7, overlapping by half a radius.
            Shape::StackedCircles => 4.0 / 7.0,
            // Height 6 units, circumference 4 units.
            Shape::UprightPill => 10.0 / (PI * 6.0),
            Shape::FlatPyramidSockel => 4.0,
            Shape::TallTrapezoid => 2.0 / 3.0,
            Shape::SteppedBlockThree => 1.0,
            Shape::DoubleUprightPill => 0.7,
            Shape::FacingBowls => 0.7,
        }
    }

    /// The closed outline of the shape at height `h`, as polygon vertices.
    /// The first point is not repeated at the end.
    pub fn outline(&self, h: f64) -> Vec<(f64, f64)> {
        let w = h * self.width_ratio();
        match self {
            Shape::Semioval => {
                // Top half of an ellipse, flat along the baseline.
                arc_points(w / 2.0, h, w / 2.0, h, PI, 2.0 * PI, ARC_SEGMENTS * 2)
            }
            Shape::WideRectangle | Shape::FlatRectangle => {
                vec![(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)]
            }
            Shape::CapsulePill => {
                let r = h / 2.0;
                let mut pts = vec![(r, 0.0)];
                pts.extend(arc_points(w - r, r, r, r, -PI / 2.0, PI / 2.0, ARC_SEGMENTS * 2));
                pts.push((r, h));
                pts.extend(arc_points(r, r, r, r, PI / 2.0, 3.0 * PI / 2.0, ARC_SEGMENTS * 2));
                pts
            }
            Shape::TaperedTrapezoid => {
                vec![(w * 0.35, 0.0), (w * 0.65, 0.0), (w, h), (0.0, h)]
            }
            Shape::BlockyTrapezoid => {
                vec![(w * 0.1, 0.0), (w * 0.9, 0.0), (w, h), (0.0, h)]
            }
            Shape::SteppedBlock => {
                let indent = w * 0.15;
                vec![
                    (indent, 0.0),
                    (w - indent, 0.0),
                    (w - indent, h / 2.0),
                    (w, h / 2.0),
                    (w, h),
                    (0.0, h),
                    (0.0, h / 2.0),
                    (indent, h / 2.0),
                ]
            }
            Shape::SphereCircle => {
                let r = h / 2.0;
                arc_points(r, r, r, r, 0.0, 2.0 * PI, ARC_SEGMENTS * 4)
            }
            Shape::FlatPyramid | Shape::TallPyramid => {
                vec![(0.0, h), (w, h), (w / 2.0, 0.0)]
            }
            Shape::FlatPressedOval => {
                arc_points(w / 2.0, h / 2.0, w / 2.0, h / 2.0, 0.0, 2.0 * PI, ARC_SEGMENTS * 4)
            }
            Shape::FlatTrapezoid => {
                vec![(0.0, h), (w, h), (w * 0.85, 0.0), (w * 0.15, 0.0)]
            }
            Shape::Rhombus => {
                vec![(w / 2.0, 0.0), (w, h / 2.0), (w / 2.0, h), (0.0, h / 2.0)]
            }
            Shape::StackedCircles => {
                // Figure-eight: two equal circles, the lower overlapping the
                // upper by half a radius. Walk the upper circle over the top
                // and the lower circle under the bottom, joining at the
                // intersection points.
                let r = 2.0 * h / 7.0;
                let cx = r;
                let top_cy = r;
                let bottom_cy = top_cy + 1.5 * r;
                let mid_y = (top_cy + bottom_cy) / 2.0;
                let dy = mid_y - top_cy;
                let dx = (r * r - dy * dy).sqrt();

                let a_left_top = (mid_y - top_cy).atan2(-dx);
                let a_right_top = (mid_y - top_cy).atan2(dx);
                let a_right_bottom = (mid_y - bottom_cy).atan2(dx);
                let a_left_bottom = (mid_y - bottom_cy).atan2(-dx);

                let mut pts = arc_points(
                    cx,
                    top_cy,
                    r,
                    r,
                    a_left_top,
                    a_right_top + 2.0 * PI,
                    ARC_SEGMENTS * 3,
                );
                pts.extend(arc_points(
                    cx,
                    bottom_cy,
                    r,
                    r,
                    a_right_bottom,
                    a_left_bottom + 2.0 * PI,
                    ARC_SEGMENTS * 3,
                ));
                pts
            }
            Shape::UprightPill => {
                let r = w / 2.0;
                let mut pts = arc_points(r, r, r, r, PI, 2.0 * PI, ARC_SEGMENTS * 2);
                pts.push((w, h - r));
                pts.extend(arc_points(r, h - r, r, r, 0.0, PI, ARC_SEGMENTS * 2));
                pts.push((0.0, r));
                pts
            }
            Shape::FlatPyramidSockel => {
                let sockel_h = h / 5.0;
                let pyramid_h = h - sockel_h;
                vec![
                    (0.0, h),
                    (w, h),
                    (w, pyramid_h),
                    (w / 2.0, 0.0),
                    (0.0, pyramid_h),
                ]
            }
            Shape::TallTrapezoid => {
                let top_w = w / 3.0;
                let left = (w - top_w) / 2.0;
                vec![(0.0, h), (w, h), (left + top_w, 0.0), (left, 0.0)]
            }
            Shape::SteppedBlockThree => {
                // Three stacked slabs: narrow bottom, widest middle, medium
                // top.
                let bottom_h = h / 6.0;
                let top_h = h / 3.0;
                let middle_w = w;
                let bottom_w = w * 0.7;
                let top_w = w * 0.5;
                let bottom_x = (middle_w - bottom_w) / 2.0;
                let top_x = (middle_w - top_w) / 2.0;
                let y_mid_bottom = h - bottom_h;
                let y_mid_top = top_h;
                vec![
                    (bottom_x, h),
                    (bottom_x + bottom_w, h),
                    (bottom_x + bottom_w, y_mid_bottom),
                    (middle_w, y_mid_bottom),
                    (middle_w, y_mid_top),
                    (top_x + top_w, y_mid_top),
                    (top_x + top_w, 0.0),
                    (top_x, 0.0),
                    (top_x, y_mid_top),
                    (0.0, y_mid_top),
                    (0.0, y_mid_bottom),
                    (bottom_x, y_mid_bottom),
                ]
            }
            Shape::DoubleUprightPill => {
                // Two rounded bumps top and bottom.
                let r = w / 4.0;
                let mut pts = arc_points(r, r, r, r, PI, 2.0 * PI, ARC_SEGMENTS);
                pts.extend(arc_points(3.0 * r, r, r, r, PI, 2.0 * PI, ARC_SEGMENTS));
                pts.push((w, h - r));
                pts.extend(arc_points(3.0 * r, h - r, r, r, 0.0, PI, ARC_SEGMENTS));
                pts.extend(arc_points(r, h - r, r, r, 0.0, PI, ARC_SEGMENTS));
                pts.push((0.0, r));
                pts
            }
            Shape::FacingBowls => {
                // Flat top and bottom, both sides pinched inward at the
                // waist by shallow arcs.
                let waist = w * 0.3;
                let r = h * 0.8;
                let waist_left = ((w - waist) / 2.0, h / 2.0);
                let waist_right = ((w + waist) / 2.0, h / 2.0);

                let mut pts = vec![(0.0, 0.0)];
                pts.extend(arc_through((0.0, 0.0), waist_left, r, ARC_SEGMENTS));
                pts.extend(arc_through(waist_left, (0.0, h), r, ARC_SEGMENTS));
                pts.push((w, h));
                pts.extend(arc_through((w, h), waist_right, r, ARC_SEGMENTS));
                pts.extend(arc_through(waist_right, (w, 0.0), r, ARC_SEGMENTS));
                pts
            }
        }
    }
}

/// Sample an elliptical arc around (`cx`, `cy`), sweeping the angle linearly
/// from `a0` to `a1` (radians, y-down convention: angle 0 is right, PI/2 is
/// down). Produces `n + 1` points including both endpoints.
fn arc_points(cx: f64, cy: f64, rx: f64, ry: f64, a0: f64, a1: f64, n: usize) -> Vec<(f64, f64)> {
    (0..=n)
        .map(|i| {
            let a = a0 + (a1 - a0) * (i as f64) / (n as f64);
            (cx + rx * a.cos(), cy + ry * a.sin())
        })
        .collect()
}

/// Sample the minor circular arc of radius `r` from `p1` to `p2`. The arc's
/// center sits to the right of the directed chord p1→p2 (screen coordinates,
/// y down), so the arc bows to the traveller's left. Produces `n` points
/// excluding `p1`, including `p2`.
fn arc_through(p1: (f64, f64), p2: (f64, f64), r: f64, n: usize) -> Vec<(f64, f64)> {
    let (x1, y1) = p1;
    let (x2, y2) = p2;
    let mx = (x1 + x2) / 2.0;
    let my = (y1 + y2) / 2.0;
    let dx = x2 - x1;
    let dy = y2 - y1;
    let d = (dx * dx + dy * dy).sqrt();
    let q = (r * r - (d / 2.0) * (d / 2.0)).max(0.0).sqrt();
    // Unit normal pointing right of the direction of travel (y-down).
    let nx = -dy / d;
    let ny = dx / d;
    let cx = mx + nx * q;
    let cy = my + ny * q;

    let a0 = (y1 - cy).atan2(x1 - cx);
    let mut a1 = (y2 - cy).atan2(x2 - cx);
    // Take the short way around.
    while a1 - a0 > PI {
        a1 -= 2.0 * PI;
    }
    while a0 - a1 > PI {
        a1 += 2.0 * PI;
    }

    (1..=n)
        .map(|i| {
            let a = a0 + (a1 - a0) * (i as f64) / (n as f64);
            (cx + r * a.cos(), cy + r * a.sin())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ANSWER_COUNTS;

    const ALL: [Shape; 20] = [
        Shape::Semioval,
        Shape::WideRectangle,
        Shape::CapsulePill,
        Shape::TaperedTrapezoid,
        Shape::BlockyTrapezoid,
        Shape::SteppedBlock,
        Shape::SphereCircle,
        Shape::FlatPyramid,
        Shape::FlatRectangle,
        Shape::FlatPressedOval,
        Shape::FlatTrapezoid,
        Shape::TallPyramid,
        Shape::Rhombus,
        Shape::StackedCircles,
        Shape::UprightPill,
        Shape::FlatPyramidSockel,
        Shape::TallTrapezoid,
        Shape::SteppedBlockThree,
        Shape::DoubleUprightPill,
        Shape::FacingBowls,
    ];

    #[test]
    fn shape_table_matches_answer_counts() {
        for (q, row) in SHAPES.iter().enumerate() {
            assert_eq!(row.len(), ANSWER_COUNTS[q], "row F0{}", q + 1);
        }
    }

    #[test]
    fn divider_band_row_is_uniform() {
        assert!(SHAPES[3].iter().all(|s| *s == SHAPES[3][0]));
    }

    #[test]
    fn outlines_fill_their_bounding_boxes() {
        for shape in ALL {
            let h = 120.0;
            let pts = shape.outline(h);
            assert!(pts.len() >= 3, "{} too few points", shape.name());

            let min_x = pts.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
            let max_x = pts.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
            let min_y = pts.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
            let max_y = pts.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);

            let w = h * shape.width_ratio();
            assert!(min_x > -1e-6 && min_y > -1e-6, "{} origin", shape.name());
            assert!((max_x - w).abs() < w * 0.05, "{} width {} vs {}", shape.name(), max_x, w);
            assert!((max_y - h).abs() < h * 0.05, "{} height {} vs {}", shape.name(), max_y, h);
        }
    }

    #[test]
    fn outlines_are_deterministic() {
        for shape in ALL {
            assert_eq!(shape.outline(77.5), shape.outline(77.5));
        }
    }

    #[test]
    fn every_table_entry_is_drawable() {
        for row in SHAPES {
            for shape in row {
                assert!(!shape.outline(50.0).is_empty());
            }
        }
    }
}
