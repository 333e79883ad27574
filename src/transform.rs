//! Scale policy: maps view size, content size and scale mode to the
//! model-view-projection matrix and viewport used to draw the preview quad.

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleMode {
    /// Stretch to fill the view, ignoring aspect ratio
    StretchFit,
    /// Shrink the viewport to the content aspect ratio, centered
    KeepAspectViewport,
    /// Preserve aspect ratio, fit within the view (letterbox/pillarbox)
    KeepAspectLetterbox,
    /// Preserve aspect ratio, fill the view completely (crops edges)
    #[default]
    CropCenter,
}

/// Quarter-turn rotation of the content relative to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Normalizes any angle to the nearest quarter turn.
    pub fn from_degrees(degrees: i32) -> Self {
        let normalized = degrees.rem_euclid(360);
        match ((normalized + 45) / 90) % 4 {
            1 => Rotation::Deg90,
            2 => Rotation::Deg180,
            3 => Rotation::Deg270,
            _ => Rotation::Deg0,
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Whether width and height trade places under this rotation.
    pub fn swaps_axes(self) -> bool {
        self.degrees() % 180 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewGeometry {
    pub width: u32,
    pub height: u32,
}

impl ViewGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Size of the producer's frames as delivered, plus the rotation that must be
/// applied before the size is compared against the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentGeometry {
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
}

impl ContentGeometry {
    pub fn new(width: u32, height: u32, rotation: Rotation) -> Self {
        Self {
            width,
            height,
            rotation,
        }
    }

    /// Width and height as seen on screen, after rotation.
    pub fn oriented(&self) -> (u32, u32) {
        if self.rotation.swaps_axes() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// GL viewport rectangle, in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Viewport {
    pub fn full(view: ViewGeometry) -> Self {
        Self {
            x: 0,
            y: 0,
            width: clamp_i32(view.width),
            height: clamp_i32(view.height),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub mvp: Mat4,
    pub viewport: Viewport,
}

impl Transform {
    pub fn identity(view: ViewGeometry) -> Self {
        Self {
            mvp: Mat4::IDENTITY,
            viewport: Viewport::full(view),
        }
    }

    /// On-screen size of the full-screen quad once the viewport and the MVP
    /// scale are applied. Larger than the view when the content is cropped.
    pub fn drawn_size(&self) -> (f32, f32) {
        (
            self.viewport.width as f32 * self.mvp.x_axis.x.abs(),
            self.viewport.height as f32 * self.mvp.y_axis.y.abs(),
        )
    }
}

pub fn compute(view: ViewGeometry, content: ContentGeometry, mode: ScaleMode) -> Transform {
    let full = Transform::identity(view);
    let (content_w, content_h) = content.oriented();
    if view.is_empty() || content_w == 0 || content_h == 0 {
        return full;
    }

    let view_w = f64::from(view.width);
    let view_h = f64::from(view.height);
    let content_w = f64::from(content_w);
    let content_h = f64::from(content_h);

    match mode {
        ScaleMode::StretchFit => full,
        ScaleMode::KeepAspectViewport => {
            let req = content_w / content_h;
            let view_aspect = view_w / view_h;
            let full_w = clamp_i32(view.width);
            let full_h = clamp_i32(view.height);
            let viewport = if view_aspect > req {
                // view is wider than the content: pillarbox
                let width = (req * view_h) as i32;
                Viewport {
                    x: (full_w - width) / 2,
                    y: 0,
                    width,
                    height: full_h,
                }
            } else {
                let height = (view_w / req) as i32;
                Viewport {
                    x: 0,
                    y: (full_h - height) / 2,
                    width: full_w,
                    height,
                }
            };
            Transform {
                mvp: Mat4::IDENTITY,
                viewport,
            }
        }
        ScaleMode::KeepAspectLetterbox | ScaleMode::CropCenter => {
            let scale_x = view_w / content_w;
            let scale_y = view_h / content_h;
            let scale = if mode == ScaleMode::CropCenter {
                scale_x.max(scale_y)
            } else {
                scale_x.min(scale_y)
            };
            let drawn_w = scale * content_w;
            let drawn_h = scale * content_h;
            Transform {
                mvp: Mat4::from_scale(Vec3::new(
                    (drawn_w / view_w) as f32,
                    (drawn_h / view_h) as f32,
                    1.0,
                )),
                viewport: full.viewport,
            }
        }
    }
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPS: f32 = 1e-5;

    fn content(width: u32, height: u32) -> ContentGeometry {
        ContentGeometry::new(width, height, Rotation::Deg0)
    }

    #[test]
    fn crop_center_matches_reference_example() {
        let view = ViewGeometry::new(1920, 1080);
        let t = compute(view, content(640, 480), ScaleMode::CropCenter);
        assert_eq!(t.viewport, Viewport::full(view));
        let expected = Mat4::from_scale(Vec3::new(1.0, 1440.0 / 1080.0, 1.0));
        assert!(t.mvp.abs_diff_eq(expected, EPS));
        let (w, h) = t.drawn_size();
        assert!((w - 1920.0).abs() < 0.01);
        assert!((h - 1440.0).abs() < 0.01);
    }

    #[test]
    fn letterbox_uses_smaller_scale() {
        let view = ViewGeometry::new(1920, 1080);
        let t = compute(view, content(640, 480), ScaleMode::KeepAspectLetterbox);
        // scale = min(3.0, 2.25) => 1440x1080
        let expected = Mat4::from_scale(Vec3::new(1440.0 / 1920.0, 1.0, 1.0));
        assert!(t.mvp.abs_diff_eq(expected, EPS));
    }

    #[test]
    fn stretch_is_identity() {
        let view = ViewGeometry::new(800, 600);
        let t = compute(view, content(1280, 720), ScaleMode::StretchFit);
        assert_eq!(t, Transform::identity(view));
    }

    #[test]
    fn viewport_mode_pillarboxes_wide_view() {
        let view = ViewGeometry::new(1920, 1080);
        let t = compute(view, content(640, 480), ScaleMode::KeepAspectViewport);
        assert_eq!(t.mvp, Mat4::IDENTITY);
        assert_eq!(
            t.viewport,
            Viewport {
                x: 240,
                y: 0,
                width: 1440,
                height: 1080
            }
        );
    }

    #[test]
    fn viewport_mode_letterboxes_tall_view() {
        let view = ViewGeometry::new(1080, 1921);
        let t = compute(view, content(1280, 720), ScaleMode::KeepAspectViewport);
        assert_eq!(t.viewport.width, 1080);
        assert_eq!(t.viewport.height, 607);
        assert_eq!(t.viewport.y, (1921 - 607) / 2);
    }

    #[test]
    fn rotation_swaps_content_axes() {
        let view = ViewGeometry::new(1080, 1920);
        let rotated = ContentGeometry::new(1920, 1080, Rotation::Deg90);
        assert_eq!(rotated.oriented(), (1080, 1920));
        let t = compute(view, rotated, ScaleMode::CropCenter);
        assert!(t.mvp.abs_diff_eq(Mat4::IDENTITY, EPS));
    }

    #[test]
    fn rotation_snaps_to_quarter_turns() {
        assert_eq!(Rotation::from_degrees(0), Rotation::Deg0);
        assert_eq!(Rotation::from_degrees(90), Rotation::Deg90);
        assert_eq!(Rotation::from_degrees(-90), Rotation::Deg270);
        assert_eq!(Rotation::from_degrees(450), Rotation::Deg90);
        assert_eq!(Rotation::from_degrees(179), Rotation::Deg180);
        assert_eq!(Rotation::from_degrees(359), Rotation::Deg0);
    }

    fn any_mode() -> impl Strategy<Value = ScaleMode> {
        prop_oneof![
            Just(ScaleMode::StretchFit),
            Just(ScaleMode::KeepAspectViewport),
            Just(ScaleMode::KeepAspectLetterbox),
            Just(ScaleMode::CropCenter),
        ]
    }

    proptest! {
        #[test]
        fn zero_dimension_yields_identity(
            vw in 0u32..4096, vh in 0u32..4096,
            cw in 0u32..4096, ch in 0u32..4096,
            zero in 0usize..4,
            mode in any_mode(),
        ) {
            let mut dims = [vw, vh, cw, ch];
            dims[zero] = 0;
            let view = ViewGeometry::new(dims[0], dims[1]);
            let t = compute(view, content(dims[2], dims[3]), mode);
            prop_assert_eq!(t, Transform::identity(view));
        }

        #[test]
        fn crop_center_covers_view(
            vw in 1u32..4096, vh in 1u32..4096,
            cw in 1u32..4096, ch in 1u32..4096,
        ) {
            let view = ViewGeometry::new(vw, vh);
            let t = compute(view, content(cw, ch), ScaleMode::CropCenter);
            let (w, h) = t.drawn_size();
            prop_assert!(w + 0.5 >= vw as f32);
            prop_assert!(h + 0.5 >= vh as f32);
        }

        #[test]
        fn letterbox_fits_inside_view(
            vw in 1u32..4096, vh in 1u32..4096,
            cw in 1u32..4096, ch in 1u32..4096,
        ) {
            let view = ViewGeometry::new(vw, vh);
            let t = compute(view, content(cw, ch), ScaleMode::KeepAspectLetterbox);
            let (w, h) = t.drawn_size();
            prop_assert!(w <= vw as f32 + 0.5);
            prop_assert!(h <= vh as f32 + 0.5);
        }

        #[test]
        fn viewport_keeps_aspect_and_is_centered(
            vw in 256u32..4096, vh in 256u32..4096,
            cw in 16u32..4096, ch in 16u32..4096,
        ) {
            let view = ViewGeometry::new(vw, vh);
            let t = compute(view, content(cw, ch), ScaleMode::KeepAspectViewport);
            let vp = t.viewport;
            prop_assert!(vp.width > 0 && vp.height > 0);
            prop_assert_eq!(vp.x, (vw as i32 - vp.width) / 2);
            prop_assert_eq!(vp.y, (vh as i32 - vp.height) / 2);
            // truncation loses less than one pixel on the derived axis
            let expected = cw as f64 / ch as f64;
            let tolerance = expected / vp.height as f64 + 1.0 / vp.height as f64;
            let actual = vp.width as f64 / vp.height as f64;
            prop_assert!((actual - expected).abs() <= tolerance);
        }
    }
}
