//! Deferred screenshot capture.
//!
//! A screenshot is taken in three steps spread over two frames:
//!
//! 1. The frame that requested it records a copy of the presented image into a
//!    `MAP_READ` buffer (rows padded to `COPY_BYTES_PER_ROW_ALIGNMENT`).
//! 2. The next frame waits for the GPU, maps the buffer and turns the padded rows
//!    into tightly packed RGBA8.
//! 3. PNG encoding and the file write run on the [`TaskPool`], off the render thread.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use lumen_core::profiling::profile_function;
use lumen_core::{Task, TaskPool};
use lumen_test_utils::{CommandRecorder, GpuBuffer, GpuTexture, RenderContext};

use crate::error::ScreenshotError;

const BYTES_PER_PIXEL: u32 = 4;

/// Row pitch of a texture copy: `width * 4` rounded up to the copy alignment.
pub fn padded_bytes_per_row(width: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (width * BYTES_PER_PIXEL).div_ceil(align) * align
}

/// Copy the top-left `width x height` pixels out of rows `bytes_per_row` apart.
pub fn unpad_rows(data: &[u8], width: u32, height: u32, bytes_per_row: u32) -> Vec<u8> {
    let row_bytes = (width * BYTES_PER_PIXEL) as usize;
    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in data.chunks(bytes_per_row as usize).take(height as usize) {
        pixels.extend_from_slice(&row[..row_bytes.min(row.len())]);
    }
    pixels
}

/// Convert 4-byte pixels of `format` to opaque RGBA8 in place.
pub fn to_opaque_rgba(pixels: &mut [u8], format: wgpu::TextureFormat) -> Result<(), ScreenshotError> {
    use wgpu::TextureFormat as F;
    let swizzle = match format {
        F::Bgra8Unorm | F::Bgra8UnormSrgb => true,
        F::Rgba8Unorm | F::Rgba8UnormSrgb => false,
        other => {
            return Err(ScreenshotError::Encode(format!(
                "Cannot read back pixels of format {:?}",
                other
            )));
        }
    };
    for pixel in pixels.chunks_exact_mut(4) {
        if swizzle {
            pixel.swap(0, 2);
        }
        pixel[3] = u8::MAX;
    }
    Ok(())
}

/// `requested` with a `.png` extension, or a timestamped name inside `dir`.
pub fn screenshot_path(dir: &Path, requested: Option<PathBuf>) -> PathBuf {
    let mut path = requested.unwrap_or_else(|| {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        dir.join(format!("screenshot-{millis}.png"))
    });
    let is_png = path
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("png"));
    if !is_png {
        path.set_extension("png");
    }
    path
}

/// Encode tightly packed RGBA8 pixels as a PNG at `path`.
pub fn write_png(path: &Path, width: u32, height: u32, pixels: Vec<u8>) -> Result<(), ScreenshotError> {
    profile_function!();
    let image = image::RgbaImage::from_raw(width, height, pixels)
        .ok_or_else(|| ScreenshotError::Encode(format!("Pixel data does not fill {}x{}", width, height)))?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    image
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| match e {
            image::ImageError::IoError(io) => ScreenshotError::Io(io),
            other => ScreenshotError::Encode(other.to_string()),
        })
}

/// A copy recorded this frame, read back next frame.
struct PendingCapture {
    buffer: GpuBuffer,
    width: u32,
    height: u32,
    bytes_per_row: u32,
    format: wgpu::TextureFormat,
    path: PathBuf,
}

/// Screenshot requests, pending readbacks and in-flight encodes.
pub struct ScreenshotQueue {
    pool: TaskPool,
    dir: PathBuf,
    requested: Option<PathBuf>,
    pending: Option<PendingCapture>,
    in_flight: VecDeque<Task<Result<PathBuf, ScreenshotError>>>,
    max_in_flight: usize,
}

impl ScreenshotQueue {
    /// `max_in_flight` bounds the encodes running at once; the oldest is awaited
    /// before another starts.
    pub fn new(dir: impl Into<PathBuf>, max_in_flight: usize) -> Self {
        Self {
            pool: TaskPool::new(1),
            dir: dir.into(),
            requested: None,
            pending: None,
            in_flight: VecDeque::new(),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Ask for a capture of the next presented frame. Returns where it will be written.
    pub fn request(&mut self, path: Option<PathBuf>) -> PathBuf {
        let path = screenshot_path(&self.dir, path);
        if let Some(previous) = self.requested.replace(path.clone()) {
            tracing::debug!("Screenshot request '{}' replaced", previous.display());
        }
        path
    }

    pub fn is_requested(&self) -> bool {
        self.requested.is_some()
    }

    /// Record a copy of the `width x height` top-left region of `source`.
    ///
    /// Does nothing unless a screenshot was requested. Returns whether a capture
    /// was recorded.
    pub fn capture(
        &mut self,
        context: &dyn RenderContext,
        recorder: &mut dyn CommandRecorder,
        source: &GpuTexture,
        width: u32,
        height: u32,
    ) -> bool {
        let Some(path) = self.requested.take() else {
            return false;
        };
        let bytes_per_row = padded_bytes_per_row(source.width());
        let buffer = context.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Screenshot Readback"),
            size: u64::from(bytes_per_row) * u64::from(source.height()),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        recorder.copy_texture_to_buffer(source, &buffer, bytes_per_row);
        tracing::debug!("Capturing screenshot '{}' ({}x{})", path.display(), width, height);

        self.pending = Some(PendingCapture {
            buffer,
            width: width.min(source.width()),
            height: height.min(source.height()),
            bytes_per_row,
            format: source.format(),
            path,
        });
        true
    }

    /// Read back last frame's capture and hand it to the encoder.
    pub fn process_pending(&mut self, context: &dyn RenderContext) -> Result<(), ScreenshotError> {
        profile_function!();
        let Some(capture) = self.pending.take() else {
            return Ok(());
        };
        context.wait_idle();
        let data = context.read_buffer(&capture.buffer)?;
        let mut pixels = unpad_rows(&data, capture.width, capture.height, capture.bytes_per_row);
        to_opaque_rgba(&mut pixels, capture.format)?;

        while self.in_flight.len() >= self.max_in_flight {
            if let Some(oldest) = self.in_flight.pop_front() {
                log_result(&self.pool.block_on(oldest));
            }
        }
        let PendingCapture {
            width, height, path, ..
        } = capture;
        self.in_flight.push_back(self.pool.spawn(async move {
            write_png(&path, width, height, pixels)?;
            Ok(path)
        }));
        Ok(())
    }

    /// Wait for every in-flight encode and return their outcomes, oldest first.
    pub fn flush(&mut self) -> Vec<Result<PathBuf, ScreenshotError>> {
        self.in_flight
            .drain(..)
            .map(|task| {
                let result = self.pool.block_on(task);
                log_result(&result);
                result
            })
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    #[cfg(test)]
    pub(crate) fn pending_buffer(&self) -> Option<&GpuBuffer> {
        self.pending.as_ref().map(|capture| &capture.buffer)
    }
}

fn log_result(result: &Result<PathBuf, ScreenshotError>) {
    match result {
        Ok(path) => tracing::info!("Saved screenshot '{}'", path.display()),
        Err(e) => tracing::error!("Screenshot failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_test_utils::{CommandCall, MockRenderContext};

    fn source(mock: &MockRenderContext, width: u32, height: u32, format: wgpu::TextureFormat) -> GpuTexture {
        mock.create_texture(&wgpu::TextureDescriptor {
            label: Some("swapchain"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        })
    }

    #[test]
    fn test_rows_are_padded_to_copy_alignment() {
        assert_eq!(padded_bytes_per_row(1), 256);
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
    }

    #[test]
    fn test_unpadding_keeps_the_requested_region() {
        let mut data = vec![0u8; 256 * 3];
        data[0..4].copy_from_slice(&[1, 2, 3, 4]);
        data[256..260].copy_from_slice(&[5, 6, 7, 8]);
        data[512..516].copy_from_slice(&[9, 9, 9, 9]);
        let pixels = unpad_rows(&data, 1, 2, 256);
        assert_eq!(pixels, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_bgra_is_swizzled_and_made_opaque() {
        let mut pixels = vec![10, 20, 30, 0, 1, 2, 3, 128];
        to_opaque_rgba(&mut pixels, wgpu::TextureFormat::Bgra8UnormSrgb).unwrap();
        assert_eq!(pixels, vec![30, 20, 10, 255, 3, 2, 1, 255]);

        let mut pixels = vec![10, 20, 30, 0];
        to_opaque_rgba(&mut pixels, wgpu::TextureFormat::Rgba8Unorm).unwrap();
        assert_eq!(pixels, vec![10, 20, 30, 255]);

        assert!(to_opaque_rgba(&mut pixels, wgpu::TextureFormat::Rgba16Float).is_err());
    }

    #[test]
    fn test_screenshot_names_are_forced_to_png() {
        let dir = Path::new("shots");
        assert_eq!(
            screenshot_path(dir, Some(PathBuf::from("capture.jpg"))),
            PathBuf::from("capture.png")
        );
        assert_eq!(screenshot_path(dir, Some(PathBuf::from("capture"))), PathBuf::from("capture.png"));
        assert_eq!(screenshot_path(dir, Some(PathBuf::from("a.PNG"))), PathBuf::from("a.PNG"));

        let default = screenshot_path(dir, None);
        assert!(default.starts_with("shots"));
        let name = default.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("screenshot-") && name.ends_with(".png"));
    }

    #[test]
    fn test_capture_without_request_records_nothing() {
        let mock = MockRenderContext::new();
        let mut queue = ScreenshotQueue::new(".", 2);
        let texture = source(&mock, 4, 4, wgpu::TextureFormat::Rgba8Unorm);
        let mut recorder = mock.create_recorder("frame");
        assert!(!queue.capture(&mock, recorder.as_mut(), &texture, 4, 4));
        recorder.submit();
        assert!(mock.last_submission().unwrap().is_empty());
    }

    #[test]
    fn test_captured_pixels_are_written_next_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockRenderContext::new();
        let mut queue = ScreenshotQueue::new(dir.path(), 2);
        let path = queue.request(Some(dir.path().join("frame")));
        let texture = source(&mock, 4, 2, wgpu::TextureFormat::Bgra8Unorm);

        let mut recorder = mock.create_recorder("frame");
        assert!(queue.capture(&mock, recorder.as_mut(), &texture, 2, 2));
        recorder.submit();
        assert!(matches!(
            mock.last_submission().unwrap()[0],
            CommandCall::CopyTextureToBuffer { source, .. } if source == texture.id()
        ));

        let mut contents = vec![0u8; 256 * 2];
        contents[0..4].copy_from_slice(&[0, 0, 255, 7]);
        contents[256 + 4..256 + 8].copy_from_slice(&[255, 0, 0, 7]);
        mock.set_buffer_contents(queue.pending_buffer().unwrap(), &contents);

        queue.process_pending(&mock).unwrap();
        assert_eq!(mock.count_wait_idle(), 1);
        assert!(!queue.has_pending());

        let results = queue.flush();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &path);

        let image = image::open(&path).unwrap().to_rgba8();
        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(image.get_pixel(1, 1).0, [0, 0, 255, 255]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 0, 0, 255]);
    }

    #[test]
    fn test_in_flight_encodes_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockRenderContext::new();
        let mut queue = ScreenshotQueue::new(dir.path(), 1);
        let texture = source(&mock, 2, 2, wgpu::TextureFormat::Rgba8Unorm);

        for i in 0..3 {
            queue.request(Some(dir.path().join(format!("shot-{i}"))));
            let mut recorder = mock.create_recorder("frame");
            queue.capture(&mock, recorder.as_mut(), &texture, 2, 2);
            recorder.submit();
            queue.process_pending(&mock).unwrap();
            assert!(queue.in_flight() <= 1);
        }
        let results = queue.flush();
        assert_eq!(results.len(), 1);
        assert_eq!(queue.in_flight(), 0);
        for i in 0..3 {
            assert!(dir.path().join(format!("shot-{i}.png")).exists());
        }
    }
}
