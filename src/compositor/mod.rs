//! Compositor
//!
//! Produces one RGBA output frame per tick from the latest screen frame and
//! the most recent webcam frame. It never waits for the webcam: whatever
//! webcam frame was last handed in is reused until a newer one arrives.

pub mod overlay;

use crate::capture::frame::{CaptureFrame, CompositeFrame, PixelFormat};
use crate::capture::pool::FramePool;
use std::time::Duration;

pub use overlay::{ScaledOverlay, WebcamLayout};

pub struct Compositor {
    width: u32,
    height: u32,
    layout: WebcamLayout,
    pool: FramePool,
    webcam: Option<ScaledOverlay>,
    /// Column/row lookup for the last screen size seen
    screen_map: Option<ScreenMap>,
}

struct ScreenMap {
    source: (u32, u32),
    offset_x: u32,
    offset_y: u32,
    columns: Vec<u32>,
    rows: Vec<u32>,
}

impl ScreenMap {
    /// Letterboxed nearest-neighbour mapping of `source` into `target`
    fn new(source: (u32, u32), target: (u32, u32)) -> Self {
        let (sw, sh) = (source.0.max(1) as f64, source.1.max(1) as f64);
        let scale = (target.0 as f64 / sw).min(target.1 as f64 / sh);
        let dw = ((sw * scale).round() as u32).clamp(1, target.0);
        let dh = ((sh * scale).round() as u32).clamp(1, target.1);

        let columns = (0..dw)
            .map(|x| ((x as f64 / scale) as u32).min(source.0.saturating_sub(1)))
            .collect();
        let rows = (0..dh)
            .map(|y| ((y as f64 / scale) as u32).min(source.1.saturating_sub(1)))
            .collect();

        Self {
            source,
            offset_x: (target.0 - dw) / 2,
            offset_y: (target.1 - dh) / 2,
            columns,
            rows,
        }
    }
}

impl Compositor {
    pub fn new(width: u32, height: u32, layout: WebcamLayout, pool: FramePool) -> Self {
        Self {
            width,
            height,
            layout,
            pool,
            webcam: None,
            screen_map: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Latest webcam frame. The scaled copy is rebuilt only when the
    /// sequence number changes.
    pub fn update_webcam(&mut self, frame: &CaptureFrame) {
        if self
            .webcam
            .as_ref()
            .map(|w| w.source_sequence == frame.sequence)
            .unwrap_or(false)
        {
            return;
        }
        match ScaledOverlay::build(frame, &self.layout, self.width, self.height) {
            Some(overlay) => self.webcam = Some(overlay),
            None => tracing::debug!("Ignoring unusable webcam frame {}", frame.sequence),
        }
    }

    pub fn has_webcam(&self) -> bool {
        self.webcam.is_some()
    }

    /// Sequence number of the webcam frame currently shown
    pub fn webcam_sequence(&self) -> Option<u64> {
        self.webcam.as_ref().map(|w| w.source_sequence)
    }

    /// Compose output tick `index`. Without a screen frame the canvas is
    /// black.
    pub fn compose(
        &mut self,
        screen: Option<&CaptureFrame>,
        index: u64,
        timestamp: Duration,
    ) -> CompositeFrame {
        let len = self.width as usize * self.height as usize * 4;
        let mut data = self.pool.acquire(len);

        match screen.filter(|s| s.is_well_formed() && s.width > 0 && s.height > 0) {
            Some(screen)
                if screen.width == self.width
                    && screen.height == self.height
                    && screen.format == PixelFormat::Rgba8 =>
            {
                data.copy_from_slice(&screen.data);
            }
            Some(screen) => {
                fill_black(&mut data);
                self.draw_screen(screen, &mut data);
            }
            None => fill_black(&mut data),
        }

        if let Some(webcam) = &self.webcam {
            webcam.blend_onto(&mut data, self.width);
        }

        CompositeFrame {
            index,
            timestamp,
            width: self.width,
            height: self.height,
            data,
        }
    }

    fn draw_screen(&mut self, screen: &CaptureFrame, canvas: &mut [u8]) {
        let size = (screen.width, screen.height);
        if self.screen_map.as_ref().map(|m| m.source) != Some(size) {
            self.screen_map = Some(ScreenMap::new(size, (self.width, self.height)));
        }
        let Some(map) = &self.screen_map else {
            return;
        };

        let out_stride = self.width as usize * 4;
        for (dy, &sy) in map.rows.iter().enumerate() {
            let row_start = (map.offset_y as usize + dy) * out_stride + map.offset_x as usize * 4;
            let src_row = sy as usize * screen.width as usize;
            for (dx, &sx) in map.columns.iter().enumerate() {
                let rgba = screen.format.rgba_at(&screen.data, src_row + sx as usize);
                let d = row_start + dx * 4;
                canvas[d..d + 4].copy_from_slice(&rgba);
            }
        }
    }
}

fn fill_black(canvas: &mut [u8]) {
    for pixel in canvas.chunks_exact_mut(4) {
        pixel.copy_from_slice(&[0, 0, 0, 255]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::pool::FrameBuffer;
    use crate::capture::source::{SourceId, SourceKind};
    use std::time::Instant;

    fn frame(kind: SourceKind, sequence: u64, width: u32, height: u32, rgba: [u8; 4]) -> CaptureFrame {
        CaptureFrame {
            source: SourceId::new(kind, "t"),
            sequence,
            width,
            height,
            format: PixelFormat::Rgba8,
            data: FrameBuffer::detached(rgba.repeat((width * height) as usize)),
            timestamp: Duration::ZERO,
            captured_at: Instant::now(),
        }
    }

    fn pixel(frame: &CompositeFrame, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * frame.width + x) * 4) as usize;
        [frame.data[i], frame.data[i + 1], frame.data[i + 2], frame.data[i + 3]]
    }

    #[test]
    fn black_canvas_without_screen() {
        let mut compositor = Compositor::new(8, 4, WebcamLayout::default(), FramePool::new(2));
        let out = compositor.compose(None, 0, Duration::ZERO);
        assert_eq!(out.data.len(), 8 * 4 * 4);
        assert_eq!(pixel(&out, 3, 2), [0, 0, 0, 255]);
    }

    #[test]
    fn screen_is_letterboxed() {
        let mut compositor = Compositor::new(8, 4, WebcamLayout::default(), FramePool::new(2));
        // Square source into a 2:1 canvas: bars left and right
        let screen = frame(SourceKind::Screen, 0, 2, 2, [50, 60, 70, 255]);
        let out = compositor.compose(Some(&screen), 5, Duration::from_millis(166));
        assert_eq!(out.index, 5);
        assert_eq!(pixel(&out, 0, 0), [0, 0, 0, 255]);
        assert_eq!(pixel(&out, 3, 1), [50, 60, 70, 255]);
        assert_eq!(pixel(&out, 7, 3), [0, 0, 0, 255]);
    }

    #[test]
    fn webcam_is_reused_until_replaced() {
        let layout = WebcamLayout {
            x: 0.0,
            y: 0.0,
            scale: 0.5,
            margin: 0,
            border_width: 0,
            corner_radius: 0.0,
            ..Default::default()
        };
        let mut compositor = Compositor::new(8, 8, layout, FramePool::new(2));
        let screen = frame(SourceKind::Screen, 0, 8, 8, [10, 10, 10, 255]);

        compositor.update_webcam(&frame(SourceKind::Webcam, 1, 4, 4, [200, 0, 0, 255]));
        let first = compositor.compose(Some(&screen), 0, Duration::ZERO);
        // No new webcam frame: the old one is still drawn
        let second = compositor.compose(Some(&screen), 1, Duration::from_millis(33));
        assert_eq!(pixel(&first, 1, 1), [200, 0, 0, 255]);
        assert_eq!(pixel(&second, 1, 1), [200, 0, 0, 255]);
        assert_eq!(pixel(&second, 6, 6), [10, 10, 10, 255]);

        compositor.update_webcam(&frame(SourceKind::Webcam, 2, 4, 4, [0, 0, 200, 255]));
        let third = compositor.compose(Some(&screen), 2, Duration::from_millis(66));
        assert_eq!(pixel(&third, 1, 1), [0, 0, 200, 255]);
        assert_eq!(compositor.webcam_sequence(), Some(2));
    }
}
