use crate::{Kinect2Error, Result};

/// Depth/IR sensor resolution.
pub const DEPTH_WIDTH: usize = 512;
pub const DEPTH_HEIGHT: usize = 424;

/// Color sensor resolution.
pub const COLOR_WIDTH: usize = 1920;
pub const COLOR_HEIGHT: usize = 1080;

/// Big-depth output is the color resolution plus one padding row above and below.
pub const BIGDEPTH_HEIGHT: usize = COLOR_HEIGHT + 2;

/// Frame kinds addressable by the export layer.
///
/// The discriminants are the tags used across the C ABI.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrameType {
    /// 1920x1080 color image delivered by the driver.
    Color = 1,
    /// 512x424 infrared image delivered by the driver.
    Ir = 2,
    /// 512x424 depth image delivered by the driver.
    Depth = 3,
    /// Depth undistorted by the registration helper.
    Undistorted = 4,
    /// Color mapped onto the depth image.
    Registered = 5,
    /// Depth mapped onto the color image.
    BigDepth = 6,
}

impl FrameType {
    /// Listener bit for frames the driver pushes. `None` for session-owned outputs.
    pub fn listener_flag(self) -> Option<FrameTypes> {
        match self {
            FrameType::Color => Some(FrameTypes::COLOR),
            FrameType::Ir => Some(FrameTypes::IR),
            FrameType::Depth => Some(FrameTypes::DEPTH),
            _ => None,
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = Kinect2Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(FrameType::Color),
            2 => Ok(FrameType::Ir),
            3 => Ok(FrameType::Depth),
            4 => Ok(FrameType::Undistorted),
            5 => Ok(FrameType::Registered),
            6 => Ok(FrameType::BigDepth),
            other => Err(Kinect2Error::UnknownFrameType(other)),
        }
    }
}

/// Compute backend the driver uses for depth packet processing.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipelineKind {
    #[default]
    Cpu = 0,
    OpenGl = 1,
    Cuda = 2,
    OpenCl = 3,
}

impl TryFrom<u8> for PipelineKind {
    type Error = Kinect2Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(PipelineKind::Cpu),
            1 => Ok(PipelineKind::OpenGl),
            2 => Ok(PipelineKind::Cuda),
            3 => Ok(PipelineKind::OpenCl),
            other => Err(Kinect2Error::UnknownPipeline(other)),
        }
    }
}

bitflags::bitflags! {
    /// Frame kinds a listener subscribes to (driver bit values).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    pub struct FrameTypes: u32 {
        const COLOR = 1 << 0;
        const IR    = 1 << 1;
        const DEPTH = 1 << 2;
    }
}

impl Default for FrameTypes {
    fn default() -> Self {
        FrameTypes::COLOR | FrameTypes::IR | FrameTypes::DEPTH
    }
}

/// Pixel layout of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Invalid,
    /// Undecoded bitstream (e.g. JPEG color before decoding).
    Raw,
    /// One 32-bit float per pixel.
    Float,
    Bgrx,
    Rgbx,
    /// Single-channel integer, `bytes_per_pixel` wide.
    Gray,
}

/// A frame buffer plus the metadata the driver attaches to it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub bytes_per_pixel: usize,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    /// Device timestamp in 0.1 ms ticks.
    pub timestamp: u32,
    pub sequence: u32,
    /// Color only: exposure time in ms.
    pub exposure: f32,
    /// Color only.
    pub gain: f32,
    /// Color only.
    pub gamma: f32,
    /// Zero when the frame is good.
    pub status: u32,
}

impl Frame {
    /// Allocate a zero-filled frame.
    pub fn new(width: usize, height: usize, bytes_per_pixel: usize, format: PixelFormat) -> Self {
        Frame {
            width,
            height,
            bytes_per_pixel,
            format,
            data: vec![0u8; width * height * bytes_per_pixel],
            timestamp: 0,
            sequence: 0,
            exposure: 0.0,
            gain: 0.0,
            gamma: 0.0,
            status: 0,
        }
    }

    /// Number of pixel bytes described by the geometry.
    pub fn byte_len(&self) -> usize {
        self.width * self.height * self.bytes_per_pixel
    }
}

/// Intrinsics and distortion of the IR camera.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IrCameraParams {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub k1: f32,
    pub k2: f32,
    pub k3: f32,
    pub p1: f32,
    pub p2: f32,
}

/// Intrinsics of the color camera.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ColorCameraParams {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

/// One enumerated sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub firmware: String,
}

/// Lifecycle state of a [`Device`](crate::Device).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Opened, listener not attached, not streaming.
    Opened,
    /// Started; output buffers and registration are allocated.
    Streaming,
    /// The driver refused to start. Only `close` is meaningful.
    StartFailed,
    /// Torn down. Every owned resource has been released.
    Closed,
}
