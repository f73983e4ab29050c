//! punch-hw: camera capture for the attendance daemon.
//!
//! Opens a V4L2 device, negotiates a format, and streams frames converted
//! to 8-bit grayscale.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::{Frame, FrameError};
