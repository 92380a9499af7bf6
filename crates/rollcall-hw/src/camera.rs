//! V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no camera at {0}")]
    DeviceNotFound(String),
    #[error("camera {0} is in use by another program")]
    DeviceBusy(String),
    #[error("{0} cannot capture video")]
    NotCaptureDevice(String),
    #[error("camera format rejected: {0}")]
    FormatNegotiationFailed(String),
    #[error("frame capture failed: {0}")]
    CaptureFailed(String),
    #[error("no usable frame after {0} attempts (lens covered or too dark?)")]
    NoUsableFrame(usize),
}

/// A video capture device discovered under `/dev`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel formats the camera can be negotiated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed YUYV 4:2:2, the default for UVC webcams.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }
}

/// Open webcam handle.
///
/// The capture stream is started on the first capture and stays open until
/// [`Camera::release`], so consecutive captures see a running sensor instead
/// of the black frames that follow STREAMON.
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    warmup_frames: usize,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 device (e.g. "/dev/video0") and negotiate 640x480.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            let text = e.to_string();
            if text.contains("busy") || text.contains("EBUSY") {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(device_path.to_string()));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {:?} (need YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            device,
            stream: None,
            warmup_frames: 0,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Discard `frames` buffers each time the capture stream starts, while
    /// auto exposure settles.
    pub fn with_warmup(mut self, frames: usize) -> Self {
        self.warmup_frames = frames;
        self
    }

    /// Stop the capture stream. The next capture starts a new one.
    pub fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(device = %self.device_path, "capture stream stopped");
        }
    }

    fn start_stream(&self) -> Result<MmapStream<'static>, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("mmap stream: {e}")))?;
        for _ in 0..self.warmup_frames {
            stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("warmup: {e}")))?;
        }
        tracing::debug!(
            device = %self.device_path,
            warmup = self.warmup_frames,
            "capture stream started"
        );
        Ok(stream)
    }

    fn stream(&mut self) -> Result<&mut MmapStream<'static>, CameraError> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.start_stream()?,
        };
        Ok(self.stream.insert(stream))
    }

    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (format, width, height) = (self.pixel_format, self.width, self.height);
        let (buf, meta) = self
            .stream()?
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))?;

        Ok(Frame {
            data: to_grayscale(format, width, height, buf)?,
            width,
            height,
            timestamp: Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// Grab the next frame from the running stream, starting it if needed.
    ///
    /// A failed dequeue stops the stream so the next call restarts it.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let frame = self.next_frame();
        if frame.is_err() {
            self.release();
        }
        frame
    }

    /// Grab frames until one is not dark, giving up after `max_attempts`.
    ///
    /// Used for registration captures, where a single good frame matters
    /// more than latency.
    pub fn capture_usable_frame(&mut self, max_attempts: usize) -> Result<Frame, CameraError> {
        for _ in 0..max_attempts {
            let frame = self.capture_frame()?;
            if frame.is_dark() {
                tracing::debug!(seq = frame.sequence, "skipping dark frame");
                continue;
            }
            return Ok(frame);
        }
        Err(CameraError::NoUsableFrame(max_attempts))
    }

    /// List video capture devices among `/dev/video0`..`/dev/video15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|i| {
                let path = format!("/dev/video{i}");
                if !Path::new(&path).exists() {
                    return None;
                }
                let dev = Device::with_path(&path).ok()?;
                let caps = dev.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

fn to_grayscale(format: PixelFormat, width: u32, height: u32, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
    let converted = match format {
        PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height),
        PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height),
        PixelFormat::Grey => {
            let pixels = (width * height) as usize;
            if buf.len() < pixels {
                return Err(CameraError::CaptureFailed(format!(
                    "GREY buffer too short: expected {pixels}, got {}",
                    buf.len()
                )));
            }
            Ok(buf[..pixels].to_vec())
        }
    };
    converted.map_err(|e| CameraError::CaptureFailed(format!("{format:?} conversion: {e}")))
}
