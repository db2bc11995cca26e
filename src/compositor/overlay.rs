//! Webcam overlay
//!
//! Placement, scale and border/opacity treatment of the webcam layer. The
//! scaled overlay is built once per webcam frame and blended onto every
//! output frame until a newer webcam frame arrives.

use crate::capture::frame::CaptureFrame;
use crate::utils::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Where and how the webcam is drawn
///
/// `x`/`y` place the overlay within the space left over after `margin`:
/// 0 is flush left/top, 1 flush right/bottom. `scale` is the overlay width
/// relative to the output width; height follows the camera's aspect ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebcamLayout {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    /// Pixels kept clear around the frame edge
    pub margin: u32,
    pub border_width: u32,
    pub border_color: [u8; 4],
    pub opacity: f32,
    /// Corner radius as a fraction of the overlay's shorter side
    pub corner_radius: f64,
}

impl Default for WebcamLayout {
    fn default() -> Self {
        Self {
            x: 1.0,
            y: 1.0,
            scale: 0.2,
            margin: 20,
            border_width: 2,
            border_color: [88, 101, 242, 255],
            opacity: 1.0,
            corner_radius: 0.1,
        }
    }
}

impl WebcamLayout {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.x) || !unit.contains(&self.y) {
            return Err(ConfigError::InvalidLayout(format!(
                "position ({}, {}) outside 0..=1",
                self.x, self.y
            )));
        }
        if !(self.scale > 0.0 && self.scale <= 1.0) {
            return Err(ConfigError::InvalidLayout(format!(
                "scale {} outside (0, 1]",
                self.scale
            )));
        }
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(ConfigError::InvalidLayout(format!(
                "opacity {} outside 0..=1",
                self.opacity
            )));
        }
        if !(0.0..=0.5).contains(&self.corner_radius) {
            return Err(ConfigError::InvalidLayout(format!(
                "corner radius {} outside 0..=0.5",
                self.corner_radius
            )));
        }
        if self.border_width > 64 {
            return Err(ConfigError::InvalidLayout(format!(
                "border width {} too large",
                self.border_width
            )));
        }
        Ok(())
    }
}

/// Check if a point is inside a rounded rectangle
pub fn is_inside_rounded_rect(x: i32, y: i32, width: i32, height: i32, radius: i32) -> bool {
    if x < 0 || y < 0 || x >= width || y >= height {
        return false;
    }
    let corner = |dx: i32, dy: i32| dx * dx + dy * dy <= radius * radius;
    // Top-left corner
    if x < radius && y < radius {
        return corner(radius - x, radius - y);
    }
    // Top-right corner
    if x >= width - radius && y < radius {
        return corner(x - (width - radius - 1), radius - y);
    }
    // Bottom-left corner
    if x < radius && y >= height - radius {
        return corner(radius - x, y - (height - radius - 1));
    }
    // Bottom-right corner
    if x >= width - radius && y >= height - radius {
        return corner(x - (width - radius - 1), y - (height - radius - 1));
    }
    true
}

/// A webcam frame scaled and masked for one output size
#[derive(Debug, Clone)]
pub struct ScaledOverlay {
    pub source_sequence: u64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// RGBA, alpha already includes mask and opacity
    pub pixels: Vec<u8>,
}

impl ScaledOverlay {
    /// Scale `frame` for an output of `out_width` x `out_height`. Returns
    /// `None` if the overlay would be empty.
    pub fn build(
        frame: &CaptureFrame,
        layout: &WebcamLayout,
        out_width: u32,
        out_height: u32,
    ) -> Option<Self> {
        if frame.width == 0 || frame.height == 0 || !frame.is_well_formed() {
            return None;
        }
        let margin = layout.margin.min(out_width / 4).min(out_height / 4);
        let max_width = out_width.saturating_sub(2 * margin);
        let max_height = out_height.saturating_sub(2 * margin);

        let mut width = ((out_width as f64 * layout.scale) as u32).min(max_width);
        let mut height =
            (width as f64 * frame.height as f64 / frame.width as f64).round() as u32;
        if height > max_height {
            height = max_height;
            width = (height as f64 * frame.width as f64 / frame.height as f64).round() as u32;
        }
        if width == 0 || height == 0 {
            return None;
        }

        let x = margin + ((max_width - width) as f64 * layout.x).round() as u32;
        let y = margin + ((max_height - height) as f64 * layout.y).round() as u32;

        let radius = (width.min(height) as f64 * layout.corner_radius) as i32;
        let border = layout.border_width as i32;
        let (w, h) = (width as i32, height as i32);
        let opacity = layout.opacity.clamp(0.0, 1.0);

        let mut pixels = vec![0u8; width as usize * height as usize * 4];
        for dy in 0..height {
            let src_y = ((dy as f64 * frame.height as f64 / height as f64) as u32)
                .min(frame.height - 1);
            for dx in 0..width {
                let (px, py) = (dx as i32, dy as i32);
                if !is_inside_rounded_rect(px, py, w, h, radius) {
                    continue;
                }
                let inner = border == 0
                    || is_inside_rounded_rect(
                        px - border,
                        py - border,
                        w - 2 * border,
                        h - 2 * border,
                        (radius - border).max(0),
                    );

                let rgba = if inner {
                    let src_x = ((dx as f64 * frame.width as f64 / width as f64) as u32)
                        .min(frame.width - 1);
                    frame
                        .format
                        .rgba_at(&frame.data, (src_y * frame.width + src_x) as usize)
                } else {
                    layout.border_color
                };

                let i = (dy as usize * width as usize + dx as usize) * 4;
                pixels[i..i + 3].copy_from_slice(&rgba[..3]);
                pixels[i + 3] = (rgba[3] as f32 * opacity).round() as u8;
            }
        }

        Some(Self {
            source_sequence: frame.sequence,
            x,
            y,
            width,
            height,
            pixels,
        })
    }

    /// Alpha-blend onto an RGBA canvas of `canvas_width` pixels per row
    pub fn blend_onto(&self, canvas: &mut [u8], canvas_width: u32) {
        let canvas_height = (canvas.len() / (canvas_width as usize * 4).max(1)) as u32;
        for dy in 0..self.height {
            let cy = self.y + dy;
            if cy >= canvas_height {
                break;
            }
            for dx in 0..self.width {
                let cx = self.x + dx;
                if cx >= canvas_width {
                    break;
                }
                let s = (dy as usize * self.width as usize + dx as usize) * 4;
                let alpha = self.pixels[s + 3];
                if alpha == 0 {
                    continue;
                }
                let d = (cy as usize * canvas_width as usize + cx as usize) * 4;
                if alpha == 255 {
                    canvas[d..d + 3].copy_from_slice(&self.pixels[s..s + 3]);
                } else {
                    let a = alpha as u32;
                    for c in 0..3 {
                        let blended =
                            (self.pixels[s + c] as u32 * a + canvas[d + c] as u32 * (255 - a)) / 255;
                        canvas[d + c] = blended as u8;
                    }
                }
                canvas[d + 3] = 255;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use crate::capture::pool::FrameBuffer;
    use crate::capture::source::{SourceId, SourceKind};
    use std::time::{Duration, Instant};

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> CaptureFrame {
        CaptureFrame {
            source: SourceId::new(SourceKind::Webcam, "cam"),
            sequence: 3,
            width,
            height,
            format: PixelFormat::Rgba8,
            data: FrameBuffer::detached(rgba.repeat((width * height) as usize)),
            timestamp: Duration::ZERO,
            captured_at: Instant::now(),
        }
    }

    #[test]
    fn default_layout_sits_bottom_right() {
        let layout = WebcamLayout::default();
        layout.validate().unwrap();
        let overlay = ScaledOverlay::build(&solid(40, 30, [9, 9, 9, 255]), &layout, 1000, 500).unwrap();
        assert_eq!(overlay.width, 200);
        assert_eq!(overlay.height, 150);
        assert_eq!(overlay.x + overlay.width, 1000 - 20);
        assert_eq!(overlay.y + overlay.height, 500 - 20);
    }

    #[test]
    fn border_and_rounded_corners() {
        let layout = WebcamLayout {
            x: 0.0,
            y: 0.0,
            scale: 0.5,
            margin: 0,
            border_width: 2,
            border_color: [255, 0, 0, 255],
            opacity: 1.0,
            corner_radius: 0.25,
        };
        let overlay = ScaledOverlay::build(&solid(20, 20, [0, 255, 0, 255]), &layout, 40, 40).unwrap();
        let px = |x: usize, y: usize| {
            let i = (y * overlay.width as usize + x) * 4;
            [overlay.pixels[i], overlay.pixels[i + 1], overlay.pixels[i + 2], overlay.pixels[i + 3]]
        };
        // Corner is masked out
        assert_eq!(px(0, 0)[3], 0);
        // Edge is border, centre is camera
        assert_eq!(px(10, 0), [255, 0, 0, 255]);
        assert_eq!(px(10, 10), [0, 255, 0, 255]);
    }

    #[test]
    fn opacity_blends_with_background() {
        let layout = WebcamLayout {
            x: 0.0,
            y: 0.0,
            scale: 1.0,
            margin: 0,
            border_width: 0,
            opacity: 0.5,
            corner_radius: 0.0,
            ..Default::default()
        };
        let overlay = ScaledOverlay::build(&solid(2, 2, [200, 200, 200, 255]), &layout, 2, 2).unwrap();
        let mut canvas = vec![0u8; 16];
        overlay.blend_onto(&mut canvas, 2);
        assert_eq!(&canvas[0..4], &[100, 100, 100, 255]);
    }

    #[test]
    fn invalid_layouts_are_rejected() {
        let mut layout = WebcamLayout::default();
        layout.scale = 0.0;
        assert!(matches!(layout.validate(), Err(ConfigError::InvalidLayout(_))));
        let mut layout = WebcamLayout::default();
        layout.opacity = 1.5;
        assert!(layout.validate().is_err());
        let mut layout = WebcamLayout::default();
        layout.x = -0.1;
        assert!(layout.validate().is_err());
    }
}
