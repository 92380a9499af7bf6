//! rollcall-hw: Webcam capture for the attendance scanner.
//!
//! Opens a V4L2 capture device, negotiates a pixel format and hands out
//! 8-bit grayscale frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
