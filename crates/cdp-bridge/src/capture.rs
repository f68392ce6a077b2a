//! Screenshot planning: clip geometry, auto-scaling and format selection.
//!
//! Planning is pure math over CSS-pixel geometry so it can be tested without
//! a browser; `CdpBridge` resolves the inputs (layout metrics, DPR, element
//! rects) over the wire and executes the resulting plan with
//! `Page.captureScreenshot`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Page-absolute rectangle in CSS pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum CaptureMode {
    Viewport,
    Element { rect: Rect },
    FullPage,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "format")]
pub enum ImageFormat {
    Png,
    Jpeg { quality: u8 },
    Webp { quality: u8 },
}

impl Default for ImageFormat {
    fn default() -> Self {
        ImageFormat::Png
    }
}

impl ImageFormat {
    pub fn cdp_name(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg { .. } => "jpeg",
            ImageFormat::Webp { .. } => "webp",
        }
    }

    pub fn quality(&self) -> Option<u8> {
        match self {
            ImageFormat::Png => None,
            ImageFormat::Jpeg { quality } | ImageFormat::Webp { quality } => Some(*quality),
        }
    }
}

/// A fully resolved capture ready to execute.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturePlan {
    pub clip: Rect,
    pub scale: f64,
    pub beyond_viewport: bool,
    pub format: ImageFormat,
    pub notes: Vec<String>,
}

impl CapturePlan {
    /// Rendered output size in device pixels.
    pub fn pixel_size(&self) -> (u32, u32) {
        (
            (self.clip.width * self.scale).round() as u32,
            (self.clip.height * self.scale).round() as u32,
        )
    }

    /// `Page.captureScreenshot` parameters for this plan.
    pub fn to_params(&self) -> Value {
        let mut params = json!({
            "format": self.format.cdp_name(),
            "clip": {
                "x": self.clip.x,
                "y": self.clip.y,
                "width": self.clip.width,
                "height": self.clip.height,
                "scale": self.scale,
            },
            "captureBeyondViewport": self.beyond_viewport,
        });
        if let Some(quality) = self.format.quality() {
            params["quality"] = json!(quality);
        }
        params
    }
}

/// Render scale for a region: native DPR, reduced so neither output axis
/// exceeds `max_dimension`. Never upscales beyond DPR.
fn scale_for(css_width: f64, css_height: f64, dpr: f64, max_dimension: f64) -> f64 {
    let mut scale = dpr;
    if css_width > 0.0 {
        scale = scale.min(max_dimension / css_width);
    }
    if css_height > 0.0 {
        scale = scale.min(max_dimension / css_height);
    }
    scale
}

/// Geometry inputs resolved from the live page.
#[derive(Clone, Copy, Debug)]
pub struct PageGeometry {
    /// CSS-pixel size of the visual viewport.
    pub viewport: (f64, f64),
    /// CSS-pixel size of the full scrollable content.
    pub content: (f64, f64),
    /// Page-absolute scroll offset of the visual viewport.
    pub scroll: (f64, f64),
    pub dpr: f64,
}

pub fn plan_capture(
    mode: &CaptureMode,
    geometry: PageGeometry,
    format: ImageFormat,
    max_dimension: u32,
    fullpage_viewport_cap: u32,
) -> CapturePlan {
    let max_dim = f64::from(max_dimension);
    let (viewport_w, viewport_h) = geometry.viewport;
    let (scroll_x, scroll_y) = geometry.scroll;

    // a viewport-sized clip starts where the user scrolled to, not at the
    // document origin
    let visible = Rect {
        x: scroll_x,
        y: scroll_y,
        width: viewport_w,
        height: viewport_h,
    };

    let (clip, beyond_viewport, mut notes) = match mode {
        CaptureMode::Viewport => (visible, false, Vec::new()),
        CaptureMode::Element { rect } => (*rect, true, Vec::new()),
        CaptureMode::FullPage => {
            let (content_w, content_h) = geometry.content;
            if content_h > viewport_h * f64::from(fullpage_viewport_cap) {
                (
                    visible,
                    false,
                    vec![format!(
                        "page height {content_h:.0}px exceeds {fullpage_viewport_cap}x viewport; captured viewport instead"
                    )],
                )
            } else {
                (
                    Rect {
                        x: 0.0,
                        y: 0.0,
                        width: content_w,
                        height: content_h,
                    },
                    true,
                    Vec::new(),
                )
            }
        }
    };

    let scale = scale_for(clip.width, clip.height, geometry.dpr, max_dim);
    if scale < geometry.dpr {
        notes.push(format!(
            "scaled down to {scale:.2}x to stay within {max_dimension}px"
        ));
    }

    CapturePlan {
        clip,
        scale,
        beyond_viewport,
        format,
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(viewport: (f64, f64), content: (f64, f64), dpr: f64) -> PageGeometry {
        PageGeometry {
            viewport,
            content,
            scroll: (0.0, 0.0),
            dpr,
        }
    }

    #[test]
    fn wide_element_scales_down_to_max_dimension() {
        let plan = plan_capture(
            &CaptureMode::Element {
                rect: Rect {
                    x: 0.0,
                    y: 0.0,
                    width: 10_000.0,
                    height: 200.0,
                },
            },
            geometry((1280.0, 800.0), (10_000.0, 200.0), 2.0),
            ImageFormat::Png,
            7_800,
            30,
        );

        assert!((plan.scale - 0.78).abs() < 1e-9);
        assert_eq!(plan.pixel_size(), (7_800, 156));
        assert_eq!(plan.notes.len(), 1, "expected a scale-down note");
    }

    #[test]
    fn small_page_keeps_native_dpr_without_notes() {
        let plan = plan_capture(
            &CaptureMode::Viewport,
            geometry((1280.0, 800.0), (1280.0, 2000.0), 2.0),
            ImageFormat::Png,
            7_800,
            30,
        );

        assert_eq!(plan.scale, 2.0);
        assert_eq!(plan.pixel_size(), (2_560, 1_600));
        assert!(plan.notes.is_empty());
        assert!(!plan.beyond_viewport);
    }

    #[test]
    fn output_never_exceeds_max_dimension() {
        for (w, h) in [(20_000.0, 15_000.0), (7_801.0, 100.0), (100.0, 50_000.0)] {
            let plan = plan_capture(
                &CaptureMode::Element {
                    rect: Rect {
                        x: 5.0,
                        y: 5.0,
                        width: w,
                        height: h,
                    },
                },
                geometry((1280.0, 800.0), (w, h), 3.0),
                ImageFormat::Png,
                7_800,
                30,
            );
            let (px_w, px_h) = plan.pixel_size();
            assert!(px_w <= 7_800, "{w}x{h}: width {px_w}");
            assert!(px_h <= 7_800, "{w}x{h}: height {px_h}");
            assert!(plan.scale <= 3.0, "never upscales beyond dpr");
        }
    }

    #[test]
    fn viewport_capture_follows_the_scroll_position() {
        let plan = plan_capture(
            &CaptureMode::Viewport,
            PageGeometry {
                viewport: (1280.0, 800.0),
                content: (1280.0, 5_000.0),
                scroll: (0.0, 2_200.0),
                dpr: 1.0,
            },
            ImageFormat::Png,
            7_800,
            30,
        );

        assert_eq!(
            plan.clip,
            Rect {
                x: 0.0,
                y: 2_200.0,
                width: 1280.0,
                height: 800.0,
            }
        );
        assert!(!plan.beyond_viewport);
    }

    #[test]
    fn excessive_fullpage_falls_back_to_viewport() {
        let plan = plan_capture(
            &CaptureMode::FullPage,
            PageGeometry {
                viewport: (1280.0, 800.0),
                content: (1280.0, 800.0 * 31.0),
                scroll: (0.0, 1_600.0),
                dpr: 1.0,
            },
            ImageFormat::Png,
            7_800,
            30,
        );

        assert_eq!(plan.clip.height, 800.0);
        // the fallback shows what is on screen, scroll offset included
        assert_eq!(plan.clip.y, 1_600.0);
        assert!(!plan.beyond_viewport);
        assert_eq!(plan.notes.len(), 1);
        assert!(plan.notes[0].contains("viewport"));
    }

    #[test]
    fn fullpage_within_cap_captures_content() {
        let plan = plan_capture(
            &CaptureMode::FullPage,
            geometry((1280.0, 800.0), (1280.0, 4_000.0), 1.0),
            ImageFormat::Png,
            7_800,
            30,
        );

        assert_eq!(plan.clip.height, 4_000.0);
        assert!(plan.beyond_viewport);
        assert!(plan.notes.is_empty());
    }

    #[test]
    fn jpeg_quality_rides_along_in_params() {
        let plan = plan_capture(
            &CaptureMode::Viewport,
            geometry((800.0, 600.0), (800.0, 600.0), 1.0),
            ImageFormat::Jpeg { quality: 80 },
            7_800,
            30,
        );
        let params = plan.to_params();
        assert_eq!(params["format"], "jpeg");
        assert_eq!(params["quality"], 80);
        assert_eq!(params["clip"]["width"], 800.0);
    }
}
