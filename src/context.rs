use crate::device::Device;
use crate::driver::Driver;
use crate::types::{DeviceInfo, PipelineKind};
use crate::{Kinect2Error, Result};
use std::sync::Arc;

/// Connection to the driver's enumeration and open facility.
///
/// Devices opened through a context own their driver handle; they do not
/// keep the context alive.
pub struct Context {
    driver: Arc<dyn Driver>,
}

impl Context {
    pub fn new(driver: impl Driver + 'static) -> Context {
        Context::from_shared(Arc::new(driver))
    }

    pub fn from_shared(driver: Arc<dyn Driver>) -> Context {
        Context { driver }
    }

    /// Number of connected sensors.
    pub fn enumerate_devices(&self) -> usize {
        self.driver.enumerate_devices().len()
    }

    /// Info for every connected sensor.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.driver.enumerate_devices()
    }

    pub fn default_serial(&self) -> Option<String> {
        self.driver.default_serial()
    }

    /// Open a sensor with the given packet pipeline.
    ///
    /// An absent or empty `serial` selects the default device. Requesting a
    /// pipeline the driver was built without fails with
    /// [`Kinect2Error::UnsupportedPipeline`]; there is no CPU fallback.
    pub fn open_device(&self, serial: Option<&str>, pipeline: PipelineKind) -> Result<Device> {
        let serial = match serial.filter(|s| !s.is_empty()) {
            Some(s) => s.to_string(),
            None => self
                .driver
                .default_serial()
                .ok_or_else(|| Kinect2Error::DeviceOpenFailed("no device connected".into()))?,
        };

        if !self.driver.supports_pipeline(pipeline) {
            return Err(Kinect2Error::UnsupportedPipeline(pipeline));
        }

        let kinect = self
            .driver
            .open_device(&serial, pipeline)
            .map_err(|e| match e {
                Kinect2Error::DeviceOpenFailed(msg) => Kinect2Error::DeviceOpenFailed(msg),
                other => Kinect2Error::DeviceOpenFailed(format!("{}: {}", serial, other)),
            })?;

        let device = Device::new(kinect, pipeline);
        log::info!(
            "Opened device: serial={} firmware={} pipeline={:?}",
            device.serial(),
            device.firmware_version(),
            pipeline
        );
        Ok(device)
    }
}
