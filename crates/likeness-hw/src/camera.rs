//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, PixelFormat, DARK_FRAME_THRESHOLD};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device does not support video capture")]
    StreamingNotSupported,
    #[error("no usable frame after {attempts} attempts ({dark} dark)")]
    NoUsableFrame { attempts: usize, dark: usize },
    #[error("frame conversion failed: {0}")]
    Frame(#[from] frame::FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Bounds for one still capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Frames discarded after the stream starts while exposure settles.
    pub warmup_frames: usize,
    /// Frames examined after warm-up before giving up.
    pub max_attempts: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            warmup_frames: 5,
            max_attempts: 10,
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    ///
    /// Keeps the device's current resolution and picks the first pixel
    /// format in [`PixelFormat::ALL`] order that the driver accepts.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        let current = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        for wanted in PixelFormat::ALL {
            let mut fmt = current.clone();
            fmt.fourcc = wanted.fourcc();
            let negotiated = match device.set_format(&fmt) {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    tracing::debug!(format = ?wanted, error = %e, "format rejected");
                    continue;
                }
            };
            let Some(pixel_format) = PixelFormat::from_fourcc(negotiated.fourcc) else {
                tracing::debug!(requested = ?wanted, got = ?negotiated.fourcc, "driver substituted format");
                continue;
            };

            tracing::info!(
                width = negotiated.width,
                height = negotiated.height,
                format = ?pixel_format,
                "negotiated format"
            );

            return Ok(Self {
                device,
                width: negotiated.width,
                height: negotiated.height,
                device_path: device_path.to_string(),
                pixel_format,
            });
        }

        Err(CameraError::FormatNegotiationFailed(format!(
            "{device_path} offers none of YUYV, RGB3, MJPG, GREY (current {:?})",
            current.fourcc
        )))
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn stream(&self) -> Result<MmapStream<'_>, CameraError> {
        MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))
    }

    fn next_frame(&self, stream: &mut MmapStream<'_>) -> Result<Frame, CameraError> {
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        let image = frame::to_rgb(self.pixel_format, &buf[..used], self.width, self.height)?;
        let is_dark = frame::is_dark_frame(&image, DARK_FRAME_THRESHOLD);

        Ok(Frame {
            image,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
            is_dark,
        })
    }

    /// Capture a single frame with no warm-up or dark filtering.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream = self.stream()?;
        self.next_frame(&mut stream)
    }

    /// Capture one usable still: discard warm-up frames, then return the
    /// first frame that is not dark.
    pub fn capture(&self, settings: CaptureSettings) -> Result<Frame, CameraError> {
        let mut stream = self.stream()?;

        for _ in 0..settings.warmup_frames {
            stream.next().map_err(|e| {
                CameraError::CaptureFailed(format!("failed to dequeue warm-up buffer: {e}"))
            })?;
        }

        let mut dark = 0usize;
        for _ in 0..settings.max_attempts {
            let frame = self.next_frame(&mut stream)?;
            if frame.is_dark {
                dark += 1;
                tracing::debug!(seq = frame.sequence, "skipping dark frame");
                continue;
            }
            tracing::debug!(
                seq = frame.sequence,
                brightness = frame.avg_brightness(),
                "captured frame"
            );
            return Ok(frame);
        }

        Err(CameraError::NoUsableFrame {
            attempts: settings.max_attempts,
            dark,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/likeness-no-such-camera").err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }

    #[test]
    fn test_default_capture_settings_bounded() {
        let settings = CaptureSettings::default();
        assert!(settings.max_attempts > 0);
        assert!(settings.warmup_frames < settings.max_attempts);
    }
}
