//! Seam to the external depth-camera driver.
//!
//! USB transfer handling, depth packet decoding and registration math all
//! live behind these traits. This crate only drives them: it opens devices,
//! attaches a [`FrameSink`], starts and stops streams, and asks the driver
//! for a registration helper built from the device calibration.

use crate::types::{ColorCameraParams, DeviceInfo, Frame, FrameType, IrCameraParams, PipelineKind};
use crate::Result;
use std::sync::Arc;

/// Receiver of frames pushed by the driver's capture thread(s).
pub trait FrameSink: Send + Sync {
    /// Hand a decoded frame to the sink.
    ///
    /// Returns `true` when the sink kept the frame, `false` when it ignored
    /// it (type not subscribed) and the driver may reuse the buffer.
    fn on_new_frame(&self, frame_type: FrameType, frame: Frame) -> bool;
}

/// Depth to color alignment helper created from a device's calibration.
pub trait Registration: Send {
    /// Undistort `depth` into `undistorted`, map `color` onto it in
    /// `registered`, and optionally map depth onto the color image in
    /// `bigdepth` (color resolution plus one padding row top and bottom).
    fn apply(
        &self,
        color: &Frame,
        depth: &Frame,
        undistorted: &mut Frame,
        registered: &mut Frame,
        bigdepth: Option<&mut Frame>,
    );
}

/// An opened sensor.
pub trait DriverDevice: Send {
    fn serial(&self) -> &str;

    fn firmware_version(&self) -> &str;

    /// Attach (or detach with `None`) the sink receiving color frames.
    fn set_color_listener(&mut self, sink: Option<Arc<dyn FrameSink>>);

    /// Attach (or detach with `None`) the sink receiving IR and depth frames.
    fn set_ir_and_depth_listener(&mut self, sink: Option<Arc<dyn FrameSink>>);

    /// Start streaming into the attached sinks.
    fn start(&mut self) -> Result<()>;

    /// Stop streaming. No sink is called after this returns.
    fn stop(&mut self) -> Result<()>;

    /// Release the USB device. The handle is unusable afterwards.
    fn close(&mut self) -> Result<()>;

    /// Valid once the stream has started.
    fn ir_camera_params(&self) -> IrCameraParams;

    /// Valid once the stream has started.
    fn color_camera_params(&self) -> ColorCameraParams;

    fn create_registration(
        &self,
        ir: &IrCameraParams,
        color: &ColorCameraParams,
    ) -> Box<dyn Registration>;
}

/// Enumeration and open facility of the driver.
pub trait Driver: Send + Sync {
    fn enumerate_devices(&self) -> Vec<DeviceInfo>;

    /// Serial of the first enumerated device, if any.
    fn default_serial(&self) -> Option<String> {
        self.enumerate_devices().into_iter().next().map(|d| d.serial)
    }

    /// Whether the driver was built with the given packet pipeline.
    fn supports_pipeline(&self, kind: PipelineKind) -> bool;

    fn open_device(&self, serial: &str, pipeline: PipelineKind) -> Result<Box<dyn DriverDevice>>;
}
