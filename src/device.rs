use crate::driver::{DriverDevice, FrameSink, Registration};
use crate::export::{export_frame, HostArray};
use crate::listener::{FrameListener, FrameMap};
use crate::types::{
    ColorCameraParams, DeviceState, Frame, FrameType, FrameTypes, IrCameraParams, PipelineKind,
    PixelFormat, BIGDEPTH_HEIGHT, COLOR_WIDTH, DEPTH_HEIGHT, DEPTH_WIDTH,
};
use crate::{Kinect2Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Frames delivered by one successful [`Device::acquire`].
///
/// The frames belong to the driver's pool and go back on [`Device::release`].
#[derive(Debug)]
pub struct FrameSet {
    frames: FrameMap,
}

impl FrameSet {
    pub fn get(&self, frame_type: FrameType) -> Option<&Frame> {
        self.frames.get(&frame_type)
    }

    pub fn frame_types(&self) -> impl Iterator<Item = FrameType> + '_ {
        self.frames.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Session-owned outputs of the registration helper.
#[derive(Default)]
struct OutputFrames {
    undistorted: Option<Frame>,
    registered: Option<Frame>,
    bigdepth: Option<Frame>,
}

impl OutputFrames {
    fn allocate() -> Self {
        OutputFrames {
            undistorted: Some(Frame::new(DEPTH_WIDTH, DEPTH_HEIGHT, 4, PixelFormat::Float)),
            registered: Some(Frame::new(DEPTH_WIDTH, DEPTH_HEIGHT, 4, PixelFormat::Bgrx)),
            bigdepth: Some(Frame::new(COLOR_WIDTH, BIGDEPTH_HEIGHT, 4, PixelFormat::Float)),
        }
    }

    fn allocated(&self) -> usize {
        [&self.undistorted, &self.registered, &self.bigdepth]
            .iter()
            .filter(|f| f.is_some())
            .count()
    }
}

/// An opened sensor and everything it owns while streaming.
///
/// Lifecycle: [`Context::open_device`](crate::Context::open_device) returns a
/// device in [`DeviceState::Opened`]; [`initialize`](Self::initialize) moves
/// it to `Streaming` (or `StartFailed`); [`close`](Self::close), also run on
/// drop, tears everything down in dependency order.
pub struct Device {
    kinect: Option<Box<dyn DriverDevice>>,
    pipeline: PipelineKind,
    serial: String,
    firmware: String,
    state: DeviceState,
    listener: Option<Arc<FrameListener>>,
    registration: Option<Box<dyn Registration>>,
    outputs: OutputFrames,
    held: Option<FrameSet>,
    ir_params: Option<IrCameraParams>,
    color_params: Option<ColorCameraParams>,
    apply_registration: bool,
}

impl Device {
    pub(crate) fn new(kinect: Box<dyn DriverDevice>, pipeline: PipelineKind) -> Device {
        let serial = kinect.serial().to_string();
        let firmware = kinect.firmware_version().to_string();
        Device {
            kinect: Some(kinect),
            pipeline,
            serial,
            firmware,
            state: DeviceState::Opened,
            listener: None,
            registration: None,
            outputs: OutputFrames::default(),
            held: None,
            ir_params: None,
            color_params: None,
            apply_registration: true,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn firmware_version(&self) -> &str {
        &self.firmware
    }

    pub fn pipeline(&self) -> PipelineKind {
        self.pipeline
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Subscribed frame kinds, once initialized.
    pub fn frame_types(&self) -> Option<FrameTypes> {
        self.listener.as_ref().map(|l| l.frame_types())
    }

    pub fn ir_camera_params(&self) -> Option<IrCameraParams> {
        self.ir_params
    }

    pub fn color_camera_params(&self) -> Option<ColorCameraParams> {
        self.color_params
    }

    /// Whether `acquire` runs the registration helper into the output
    /// buffers. On by default; it only runs when color and depth are both
    /// in the acquired set.
    pub fn set_registration_enabled(&mut self, enabled: bool) {
        self.apply_registration = enabled;
    }

    /// Number of session-owned output buffers currently allocated (0 or 3).
    pub fn output_buffers_allocated(&self) -> usize {
        self.outputs.allocated()
    }

    /// Whether a frame set is held and awaiting [`release`](Self::release).
    pub fn holds_frame_set(&self) -> bool {
        self.held.is_some()
    }

    /// Initialize with color, IR and depth subscribed.
    pub fn initialize_default(&mut self) -> Result<()> {
        self.initialize(FrameTypes::default())
    }

    /// Attach a listener for `frame_types`, start streaming and allocate the
    /// output buffers.
    ///
    /// If the driver refuses to start, the device moves to
    /// [`DeviceState::StartFailed`] holding neither listener, registration
    /// helper nor output buffers; only [`close`](Self::close) remains.
    /// An empty mask is rejected and leaves the device `Opened`.
    pub fn initialize(&mut self, frame_types: FrameTypes) -> Result<()> {
        if self.state != DeviceState::Opened {
            return Err(Kinect2Error::InvalidState(self.state));
        }
        if frame_types.is_empty() {
            return Err(Kinect2Error::InvalidFrameTypes(frame_types.bits()));
        }
        let kinect = self
            .kinect
            .as_mut()
            .ok_or(Kinect2Error::InvalidState(self.state))?;

        let listener = Arc::new(FrameListener::new(frame_types));
        let sink: Arc<dyn FrameSink> = listener.clone();
        kinect.set_color_listener(Some(sink.clone()));
        kinect.set_ir_and_depth_listener(Some(sink));

        if let Err(e) = kinect.start() {
            log::warn!("Device {} failed to start: {}", self.serial, e);
            kinect.set_color_listener(None);
            kinect.set_ir_and_depth_listener(None);
            self.state = DeviceState::StartFailed;
            return Err(Kinect2Error::StreamStartFailed);
        }

        let ir = kinect.ir_camera_params();
        let color = kinect.color_camera_params();
        self.registration = Some(kinect.create_registration(&ir, &color));
        self.ir_params = Some(ir);
        self.color_params = Some(color);
        self.outputs = OutputFrames::allocate();
        self.listener = Some(listener);
        self.state = DeviceState::Streaming;

        log::info!(
            "Device {} streaming: types={:?} pipeline={:?}",
            self.serial,
            frame_types,
            self.pipeline
        );
        Ok(())
    }

    /// Take the next synchronized frame set.
    ///
    /// Returns [`Kinect2Error::NoFrameAvailable`] right away when the
    /// listener has nothing pending. Otherwise waits up to `timeout`
    /// (forever for `None`) and fails with [`Kinect2Error::AcquireTimeout`]
    /// if it elapses. The previous set must have been released.
    pub fn acquire(&mut self, timeout: Option<Duration>) -> Result<&FrameSet> {
        self.ensure_streaming()?;
        if self.held.is_some() {
            return Err(Kinect2Error::FrameSetOutstanding);
        }
        let listener = self
            .listener
            .as_ref()
            .ok_or(Kinect2Error::InvalidState(self.state))?;

        if !listener.has_new_frame() {
            return Err(Kinect2Error::NoFrameAvailable);
        }
        let frames = listener.wait_for_new_frame(timeout)?;

        if self.apply_registration {
            self.register(&frames);
        }

        log::trace!(
            "Device {} acquired frame set ({} frames)",
            self.serial,
            frames.len()
        );
        Ok(&*self.held.insert(FrameSet { frames }))
    }

    /// Return the held frame set to the driver's pool.
    pub fn release(&mut self) -> Result<()> {
        let set = self.held.take().ok_or(Kinect2Error::FrameNotHeld)?;
        match &self.listener {
            Some(listener) => listener.release(set.frames),
            None => drop(set),
        }
        Ok(())
    }

    /// Copy a frame into a host array.
    ///
    /// Color, IR and depth come from the held frame set; undistorted,
    /// registered and big-depth from the session's output buffers.
    pub fn export(&self, frame_type: FrameType) -> Result<HostArray> {
        let frame = match frame_type {
            FrameType::Color | FrameType::Ir | FrameType::Depth => self
                .held
                .as_ref()
                .and_then(|set| set.get(frame_type))
                .ok_or(Kinect2Error::FrameNotHeld)?,
            FrameType::Undistorted | FrameType::Registered | FrameType::BigDepth => {
                self.ensure_streaming()?;
                let slot = match frame_type {
                    FrameType::Undistorted => &self.outputs.undistorted,
                    FrameType::Registered => &self.outputs.registered,
                    _ => &self.outputs.bigdepth,
                };
                slot.as_ref().ok_or(Kinect2Error::InvalidState(self.state))?
            }
        };
        export_frame(frame)
    }

    /// Stop streaming and release everything the device owns.
    ///
    /// Best-effort and idempotent: driver failures while stopping or closing
    /// are logged and teardown continues. Order: stop, close, release any
    /// held frame set, free output buffers, registration helper, listener,
    /// and finally the driver handle.
    pub fn close(&mut self) {
        if self.state == DeviceState::Closed {
            return;
        }

        if let Some(kinect) = self.kinect.as_mut() {
            if self.state == DeviceState::Streaming {
                if let Err(e) = kinect.stop() {
                    log::warn!("Device {} stop failed: {}", self.serial, e);
                }
            }
            if let Err(e) = kinect.close() {
                log::warn!("Device {} close failed: {}", self.serial, e);
            }
            kinect.set_color_listener(None);
            kinect.set_ir_and_depth_listener(None);
        }

        if self.held.is_some() {
            log::debug!("Device {} closed with a frame set held; releasing", self.serial);
            let _ = self.release();
        }

        drop(self.outputs.undistorted.take());
        drop(self.outputs.registered.take());
        drop(self.outputs.bigdepth.take());
        drop(self.registration.take());
        drop(self.listener.take());
        drop(self.kinect.take());

        self.state = DeviceState::Closed;
        log::info!("Device {} closed", self.serial);
    }

    fn ensure_streaming(&self) -> Result<()> {
        match self.state {
            DeviceState::Streaming => Ok(()),
            other => Err(Kinect2Error::InvalidState(other)),
        }
    }

    fn register(&mut self, frames: &FrameMap) {
        let (Some(color), Some(depth)) = (
            frames.get(&FrameType::Color),
            frames.get(&FrameType::Depth),
        ) else {
            return;
        };
        let Some(registration) = self.registration.as_ref() else {
            return;
        };
        let OutputFrames {
            undistorted: Some(undistorted),
            registered: Some(registered),
            bigdepth,
        } = &mut self.outputs
        else {
            return;
        };
        registration.apply(color, depth, undistorted, registered, bigdepth.as_mut());
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::ElementType;
    use crate::sim::{SimConfig, SimulatedDriver};
    use crate::Context;
    use std::time::Instant;

    fn context(config: SimConfig) -> Context {
        let _ = env_logger::builder().is_test(true).try_init();
        Context::new(SimulatedDriver::new(config))
    }

    fn fast() -> SimConfig {
        SimConfig {
            fps: 120,
            ..SimConfig::default()
        }
    }

    /// Poll until a set is acquired or `limit` passes.
    fn acquire_within(device: &mut Device, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            match device.acquire(Some(Duration::from_millis(100))) {
                Ok(_) => return true,
                Err(e) if e.is_recoverable() => std::thread::sleep(Duration::from_millis(2)),
                Err(e) => panic!("acquire failed: {}", e),
            }
        }
        false
    }

    #[test]
    fn test_opened_device_has_no_buffers() {
        let ctx = context(fast());
        let device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        assert_eq!(device.state(), DeviceState::Opened);
        assert_eq!(device.output_buffers_allocated(), 0);
        assert!(device.frame_types().is_none());
        assert!(matches!(
            device.export(FrameType::Undistorted),
            Err(Kinect2Error::InvalidState(DeviceState::Opened))
        ));
    }

    #[test]
    fn test_undistorted_is_zero_before_first_acquire() {
        let ctx = context(SimConfig {
            fps: 1,
            ..SimConfig::default()
        });
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        device.initialize_default().unwrap();
        assert_eq!(device.output_buffers_allocated(), 3);

        let arr = device.export(FrameType::Undistorted).unwrap();
        assert_eq!(arr.shape, vec![424, 512]);
        assert_eq!(arr.element, ElementType::F32);
        assert!(arr.to_f32().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_registered_and_bigdepth_shapes() {
        let ctx = context(fast());
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        device.initialize_default().unwrap();

        let registered = device.export(FrameType::Registered).unwrap();
        assert_eq!(registered.shape, vec![424, 512, 4]);
        assert_eq!(registered.element, ElementType::U8);
        assert_eq!(registered.len(), 512 * 424 * 4);

        let bigdepth = device.export(FrameType::BigDepth).unwrap();
        assert_eq!(bigdepth.shape, vec![1082, 1920]);
        assert_eq!(bigdepth.element, ElementType::F32);
    }

    #[test]
    fn test_acquire_export_release_cycle() {
        let ctx = context(fast());
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        device.initialize_default().unwrap();

        for _ in 0..3 {
            assert!(acquire_within(&mut device, Duration::from_secs(5)));
            assert!(device.holds_frame_set());

            let color = device.export(FrameType::Color).unwrap();
            assert_eq!(color.shape, vec![1080, 1920, 4]);
            let depth = device.export(FrameType::Depth).unwrap();
            assert_eq!(depth.shape, vec![424, 512]);
            let ir = device.export(FrameType::Ir).unwrap();
            assert_eq!(ir.element, ElementType::F32);

            let undistorted = device.export(FrameType::Undistorted).unwrap();
            assert!(undistorted.to_f32().unwrap().iter().any(|&v| v > 0.0));

            device.release().unwrap();
            assert!(!device.holds_frame_set());
        }
    }

    #[test]
    fn test_registration_can_be_disabled() {
        let ctx = context(fast());
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        device.set_registration_enabled(false);
        device.initialize_default().unwrap();

        assert!(acquire_within(&mut device, Duration::from_secs(5)));
        let undistorted = device.export(FrameType::Undistorted).unwrap();
        assert!(undistorted.to_f32().unwrap().iter().all(|&v| v == 0.0));
        device.release().unwrap();
    }

    #[test]
    fn test_double_release_is_rejected() {
        let ctx = context(fast());
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        device.initialize_default().unwrap();

        assert!(matches!(device.release(), Err(Kinect2Error::FrameNotHeld)));

        assert!(acquire_within(&mut device, Duration::from_secs(5)));
        device.release().unwrap();
        assert!(matches!(device.release(), Err(Kinect2Error::FrameNotHeld)));

        // The pool still works after the rejected release.
        assert!(acquire_within(&mut device, Duration::from_secs(5)));
        device.release().unwrap();
    }

    #[test]
    fn test_acquire_without_release_is_rejected() {
        let ctx = context(fast());
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        device.initialize_default().unwrap();

        assert!(acquire_within(&mut device, Duration::from_secs(5)));
        assert!(matches!(
            device.acquire(Some(Duration::from_millis(10))),
            Err(Kinect2Error::FrameSetOutstanding)
        ));
        device.release().unwrap();
    }

    #[test]
    fn test_export_driver_frame_without_set() {
        let ctx = context(fast());
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        device.initialize_default().unwrap();
        assert!(matches!(
            device.export(FrameType::Color),
            Err(Kinect2Error::FrameNotHeld)
        ));
    }

    #[test]
    fn test_depth_only_subscription() {
        let ctx = context(fast());
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        device.initialize(FrameTypes::DEPTH).unwrap();
        assert_eq!(device.frame_types(), Some(FrameTypes::DEPTH));

        assert!(acquire_within(&mut device, Duration::from_secs(5)));
        assert!(device.export(FrameType::Depth).is_ok());
        assert!(matches!(
            device.export(FrameType::Color),
            Err(Kinect2Error::FrameNotHeld)
        ));
        device.release().unwrap();
    }

    #[test]
    fn test_empty_subscription_is_rejected() {
        let ctx = context(fast());
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        assert!(matches!(
            device.initialize(FrameTypes::empty()),
            Err(Kinect2Error::InvalidFrameTypes(0))
        ));
        assert_eq!(device.state(), DeviceState::Opened);
        assert_eq!(device.output_buffers_allocated(), 0);

        // The device is still usable with a real mask.
        device.initialize(FrameTypes::DEPTH).unwrap();
        assert!(acquire_within(&mut device, Duration::from_secs(5)));
        device.release().unwrap();
    }

    #[test]
    fn test_initialize_twice_is_rejected() {
        let ctx = context(fast());
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        device.initialize_default().unwrap();
        assert!(matches!(
            device.initialize_default(),
            Err(Kinect2Error::InvalidState(DeviceState::Streaming))
        ));
    }

    #[test]
    fn test_start_failure_is_explicit() {
        let ctx = context(SimConfig {
            fail_start: true,
            ..fast()
        });
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        assert!(matches!(
            device.initialize_default(),
            Err(Kinect2Error::StreamStartFailed)
        ));
        assert_eq!(device.state(), DeviceState::StartFailed);
        assert_eq!(device.output_buffers_allocated(), 0);
        assert!(device.frame_types().is_none());
        assert!(device.ir_camera_params().is_none());
        assert!(matches!(
            device.acquire(None),
            Err(Kinect2Error::InvalidState(DeviceState::StartFailed))
        ));

        device.close();
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn test_close_releases_everything_once() {
        let ctx = context(fast());
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        device.initialize_default().unwrap();
        assert!(acquire_within(&mut device, Duration::from_secs(5)));

        device.close();
        assert_eq!(device.state(), DeviceState::Closed);
        assert_eq!(device.output_buffers_allocated(), 0);
        assert!(!device.holds_frame_set());
        for ty in [FrameType::Undistorted, FrameType::Registered, FrameType::BigDepth] {
            assert!(matches!(
                device.export(ty),
                Err(Kinect2Error::InvalidState(DeviceState::Closed))
            ));
        }
        assert!(matches!(device.export(FrameType::Color), Err(Kinect2Error::FrameNotHeld)));

        device.close();
        assert_eq!(device.state(), DeviceState::Closed);
    }

    #[test]
    fn test_close_unstarted_device() {
        let ctx = context(fast());
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        device.close();
        assert_eq!(device.state(), DeviceState::Closed);
        assert!(matches!(
            device.initialize_default(),
            Err(Kinect2Error::InvalidState(DeviceState::Closed))
        ));
    }

    #[test]
    fn test_camera_params_after_start() {
        let ctx = context(fast());
        let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
        assert!(device.color_camera_params().is_none());
        device.initialize_default().unwrap();
        let color = device.color_camera_params().unwrap();
        assert!(color.fx > 0.0);
        assert!(device.ir_camera_params().unwrap().fx > 0.0);
    }
}
