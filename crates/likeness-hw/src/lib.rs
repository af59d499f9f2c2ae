//! likeness-hw: camera capture for single-subject recognition.
//!
//! Opens a V4L2 device, negotiates a pixel format the converters understand
//! and hands back RGB frames ready for normalization.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CaptureSettings, DeviceInfo};
pub use frame::{Frame, FrameError, PixelFormat};
