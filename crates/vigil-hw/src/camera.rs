//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream as _;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{Format, FourCC};

/// Buffers queued in the kernel while a frame is being processed.
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("device is not a video capture device")]
    StreamingNotSupported,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("frame conversion failed: {0}")]
    Frame(#[from] frame::FrameError),
}

/// Source of frames for the capture loop.
pub trait FrameSource {
    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Pixel formats this crate can convert to RGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2, two pixels per four bytes.
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpg,
    Rgb24,
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        Some(match &fourcc.repr {
            b"YUYV" => Self::Yuyv,
            b"MJPG" => Self::Mjpg,
            b"RGB3" => Self::Rgb24,
            b"GREY" => Self::Grey,
            b"Y16 " | b"Y16\0" => Self::Y16,
            _ => return None,
        })
    }

    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, frame::FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Mjpg => frame::mjpeg_to_rgb(buf),
            Self::Rgb24 => frame::rgb24_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
            Self::Y16 => frame::y16_to_rgb(buf, width, height),
        }
    }
}

/// An opened V4L2 capture device with a negotiated format.
pub struct Camera {
    device: Device,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` and ask for `width`x`height` YUYV. Whatever
    /// supported format and size the driver settles on is accepted.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        let device = open_device(device_path)?;
        let (format, pixel_format) = negotiate(&device, width, height)?;

        tracing::info!(
            device = device_path,
            width = format.width,
            height = format.height,
            fourcc = ?format.fourcc,
            "camera ready"
        );

        Ok(Self {
            device,
            device_path: device_path.to_string(),
            width: format.width,
            height: format.height,
            fourcc: format.fourcc,
            pixel_format,
        })
    }

    /// Start memory-mapped streaming.
    pub fn stream(&self) -> Result<CameraStream<'_>, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("cannot start mmap stream: {e}")))?;
        Ok(CameraStream {
            camera: self,
            stream,
        })
    }
}

fn open_device(path: &str) -> Result<Device, CameraError> {
    if !Path::new(path).exists() {
        return Err(CameraError::DeviceNotFound(path.to_string()));
    }
    let device = Device::with_path(path).map_err(|e| match e.raw_os_error() {
        Some(16) => CameraError::DeviceBusy, // EBUSY
        _ => CameraError::DeviceNotFound(format!("{path}: {e}")),
    })?;

    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("cannot query capabilities: {e}")))?;
    tracing::debug!(device = path, driver = %caps.driver, card = %caps.card, "opened V4L2 device");
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return Err(CameraError::StreamingNotSupported);
    }
    Ok(device)
}

fn negotiate(device: &Device, width: u32, height: u32) -> Result<(Format, PixelFormat), CameraError> {
    let requested = Format::new(width, height, FourCC::new(b"YUYV"));
    let format = device
        .set_format(&requested)
        .map_err(|e| CameraError::FormatNegotiationFailed(e.to_string()))?;

    let pixel_format = PixelFormat::from_fourcc(format.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "driver offered {:?}; supported are YUYV, MJPG, RGB3, GREY and Y16",
            format.fourcc
        ))
    })?;
    Ok((format, pixel_format))
}

/// Streaming capture borrowing its [`Camera`].
pub struct CameraStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameSource for CameraStream<'_> {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue failed: {e}")))?;

        // Compressed payloads are shorter than the mapped buffer.
        let used = (meta.bytesused as usize).min(buf.len());
        let payload = if used > 0 { &buf[..used] } else { buf };

        let camera = self.camera;
        let image = camera
            .pixel_format
            .to_rgb(payload, camera.width, camera.height)?;
        Ok(Frame::new(image, meta.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"NV12")), None);
    }

    #[test]
    fn test_grey_conversion_dispatch() {
        let image = PixelFormat::Grey.to_rgb(&[9, 9], 2, 1).unwrap();
        assert_eq!(image.get_pixel(1, 0).0, [9, 9, 9]);
    }

    #[test]
    fn test_missing_device() {
        assert!(matches!(
            Camera::open("/dev/does-not-exist", 640, 480),
            Err(CameraError::DeviceNotFound(_))
        ));
    }
}
