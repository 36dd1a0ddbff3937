//! Simulated sensor backend.
//!
//! Implements the driver traits with synthetic frames produced on a capture
//! thread at a fixed rate, so the lifecycle and exchange layers can run
//! without hardware. Color frames carry a moving gradient, depth frames a
//! tilted plane, and IR frames an amplitude image. The registration helper
//! is a nearest-neighbour rescale, not a calibrated mapping.

use crate::driver::{Driver, DriverDevice, FrameSink, Registration};
use crate::types::{
    ColorCameraParams, DeviceInfo, Frame, FrameType, IrCameraParams, PipelineKind, PixelFormat,
    COLOR_HEIGHT, COLOR_WIDTH, DEPTH_HEIGHT, DEPTH_WIDTH,
};
use crate::{Kinect2Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const SIM_FIRMWARE: &str = "2.3.3913.0.7";

/// Settings for [`SimulatedDriver`].
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of sensors reported by enumeration.
    pub devices: usize,
    /// Frame sets produced per second.
    pub fps: u32,
    /// Packet pipelines the simulated driver "was built with".
    pub pipelines: Vec<PipelineKind>,
    /// Make every `start` fail.
    pub fail_start: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            devices: 1,
            fps: 30,
            pipelines: vec![PipelineKind::Cpu],
            fail_start: false,
        }
    }
}

impl SimConfig {
    /// Defaults overridden by `KINECT2_SIM_DEVICES`, `KINECT2_SIM_FPS`,
    /// `KINECT2_SIM_PIPELINES` (comma list of cpu/opengl/cuda/opencl) and
    /// `KINECT2_SIM_FAIL_START`.
    pub fn from_env() -> Self {
        let defaults = SimConfig::default();
        SimConfig {
            devices: read_env_usize("KINECT2_SIM_DEVICES", defaults.devices),
            fps: read_env_usize("KINECT2_SIM_FPS", defaults.fps as usize) as u32,
            pipelines: read_env_pipelines("KINECT2_SIM_PIPELINES", defaults.pipelines),
            fail_start: read_env_bool("KINECT2_SIM_FAIL_START", defaults.fail_start),
        }
    }
}

fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn read_env_pipelines(name: &str, default: Vec<PipelineKind>) -> Vec<PipelineKind> {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_pipeline_list(&v))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Comma list of pipeline names. Unknown names are skipped; `None` when
/// nothing usable remains.
fn parse_pipeline_list(value: &str) -> Option<Vec<PipelineKind>> {
    let mut kinds = Vec::new();
    for item in value.split(',').map(|s| s.trim().to_ascii_lowercase()) {
        match parse_pipeline(&item) {
            Some(kind) if !kinds.contains(&kind) => kinds.push(kind),
            Some(_) => {}
            None if item.is_empty() => {}
            None => log::warn!("Unknown pipeline '{}' in KINECT2_SIM_PIPELINES, ignoring", item),
        }
    }
    (!kinds.is_empty()).then_some(kinds)
}

fn parse_pipeline(name: &str) -> Option<PipelineKind> {
    match name {
        "cpu" => Some(PipelineKind::Cpu),
        "opengl" | "gl" => Some(PipelineKind::OpenGl),
        "cuda" => Some(PipelineKind::Cuda),
        "opencl" | "cl" => Some(PipelineKind::OpenCl),
        _ => None,
    }
}

/// Driver producing synthetic frames.
pub struct SimulatedDriver {
    config: SimConfig,
}

impl SimulatedDriver {
    pub fn new(config: SimConfig) -> Self {
        Self { config }
    }

    fn serial(index: usize) -> String {
        format!("SIM{:09}", index)
    }
}

impl Driver for SimulatedDriver {
    fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        (0..self.config.devices)
            .map(|i| DeviceInfo {
                serial: Self::serial(i),
                firmware: SIM_FIRMWARE.to_string(),
            })
            .collect()
    }

    fn supports_pipeline(&self, kind: PipelineKind) -> bool {
        self.config.pipelines.contains(&kind)
    }

    fn open_device(&self, serial: &str, pipeline: PipelineKind) -> Result<Box<dyn DriverDevice>> {
        let known = (0..self.config.devices).any(|i| Self::serial(i) == serial);
        if !known {
            return Err(Kinect2Error::DeviceOpenFailed(format!(
                "no device with serial {}",
                serial
            )));
        }
        Ok(Box::new(SimDevice {
            serial: serial.to_string(),
            pipeline,
            fps: self.config.fps.max(1),
            fail_start: self.config.fail_start,
            color_sink: None,
            ir_depth_sink: None,
            capture: None,
            open: true,
        }))
    }
}

/// One simulated sensor.
pub struct SimDevice {
    serial: String,
    pipeline: PipelineKind,
    fps: u32,
    fail_start: bool,
    color_sink: Option<Arc<dyn FrameSink>>,
    ir_depth_sink: Option<Arc<dyn FrameSink>>,
    capture: Option<CaptureThread>,
    open: bool,
}

impl DriverDevice for SimDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn firmware_version(&self) -> &str {
        SIM_FIRMWARE
    }

    fn set_color_listener(&mut self, sink: Option<Arc<dyn FrameSink>>) {
        self.color_sink = sink;
    }

    fn set_ir_and_depth_listener(&mut self, sink: Option<Arc<dyn FrameSink>>) {
        self.ir_depth_sink = sink;
    }

    fn start(&mut self) -> Result<()> {
        if !self.open {
            return Err(Kinect2Error::Driver("device is closed".into()));
        }
        if self.fail_start {
            return Err(Kinect2Error::Driver("simulated start failure".into()));
        }
        if self.capture.is_some() {
            return Ok(());
        }
        log::debug!(
            "Simulated device {} starting at {} fps ({:?} pipeline)",
            self.serial,
            self.fps,
            self.pipeline
        );
        self.capture = Some(CaptureThread::start(
            self.color_sink.clone(),
            self.ir_depth_sink.clone(),
            self.fps,
        )?);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut capture) = self.capture.take() {
            capture.shutdown();
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop()?;
        self.open = false;
        Ok(())
    }

    fn ir_camera_params(&self) -> IrCameraParams {
        IrCameraParams {
            fx: 365.456,
            fy: 365.456,
            cx: 254.878,
            cy: 205.395,
            k1: 0.0905474,
            k2: -0.26819,
            k3: 0.0950862,
            p1: 0.0,
            p2: 0.0,
        }
    }

    fn color_camera_params(&self) -> ColorCameraParams {
        ColorCameraParams {
            fx: 1081.37,
            fy: 1081.37,
            cx: 959.5,
            cy: 539.5,
        }
    }

    fn create_registration(
        &self,
        _ir: &IrCameraParams,
        _color: &ColorCameraParams,
    ) -> Box<dyn Registration> {
        Box::new(SimRegistration)
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Background producer pushing frames into the attached sinks.
struct CaptureThread {
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureThread {
    fn start(
        color_sink: Option<Arc<dyn FrameSink>>,
        ir_depth_sink: Option<Arc<dyn FrameSink>>,
        fps: u32,
    ) -> Result<CaptureThread> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();

        let thread = std::thread::Builder::new()
            .name("kinect2-sim".into())
            .spawn(move || {
                capture_loop(color_sink, ir_depth_sink, fps, stop_clone);
            })
            .map_err(|e| Kinect2Error::Driver(format!("Failed to spawn capture thread: {}", e)))?;

        Ok(CaptureThread {
            stop_flag,
            thread: Some(thread),
        })
    }

    fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn capture_loop(
    color_sink: Option<Arc<dyn FrameSink>>,
    ir_depth_sink: Option<Arc<dyn FrameSink>>,
    fps: u32,
    stop_flag: Arc<AtomicBool>,
) {
    let period = Duration::from_secs_f64(1.0 / fps as f64);
    let epoch = Instant::now();
    let mut sequence: u32 = 0;

    log::info!("Simulated capture started");

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            log::info!("Simulated capture stopping (stop flag set)");
            break;
        }

        let started = Instant::now();
        // Device timestamps tick every 0.1 ms.
        let timestamp = (epoch.elapsed().as_micros() / 100) as u32;

        if let Some(sink) = &color_sink {
            sink.on_new_frame(FrameType::Color, color_frame(sequence, timestamp));
        }
        if let Some(sink) = &ir_depth_sink {
            sink.on_new_frame(FrameType::Ir, ir_frame(sequence, timestamp));
            sink.on_new_frame(FrameType::Depth, depth_frame(sequence, timestamp));
        }
        sequence = sequence.wrapping_add(1);

        if let Some(rest) = period.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
}

fn color_frame(sequence: u32, timestamp: u32) -> Frame {
    let mut frame = Frame::new(COLOR_WIDTH, COLOR_HEIGHT, 4, PixelFormat::Bgrx);
    frame.sequence = sequence;
    frame.timestamp = timestamp;
    frame.exposure = 16.0;
    frame.gain = 1.0;
    frame.gamma = 1.0;

    let shift = sequence as usize;
    for (y, row) in frame.data.chunks_exact_mut(COLOR_WIDTH * 4).enumerate() {
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            px[0] = ((x + shift) & 0xff) as u8;
            px[1] = (y & 0xff) as u8;
            px[2] = (shift & 0xff) as u8;
            px[3] = 0;
        }
    }
    frame
}

/// Depth in millimetres: a plane tilted along x, drifting with the sequence.
fn depth_at(x: usize, y: usize, sequence: u32) -> f32 {
    500.0 + x as f32 * 4.0 + y as f32 * 0.5 + (sequence % 100) as f32
}

fn depth_frame(sequence: u32, timestamp: u32) -> Frame {
    let mut frame = Frame::new(DEPTH_WIDTH, DEPTH_HEIGHT, 4, PixelFormat::Float);
    frame.sequence = sequence;
    frame.timestamp = timestamp;

    let values: Vec<f32> = (0..DEPTH_HEIGHT)
        .flat_map(|y| (0..DEPTH_WIDTH).map(move |x| depth_at(x, y, sequence)))
        .collect();
    frame.data.copy_from_slice(bytemuck::cast_slice(&values[..]));
    frame
}

fn ir_frame(sequence: u32, timestamp: u32) -> Frame {
    let mut frame = Frame::new(DEPTH_WIDTH, DEPTH_HEIGHT, 4, PixelFormat::Float);
    frame.sequence = sequence;
    frame.timestamp = timestamp;

    let values: Vec<f32> = (0..DEPTH_HEIGHT)
        .flat_map(|y| (0..DEPTH_WIDTH).map(move |x| ((x * y) % 65536) as f32))
        .collect();
    frame.data.copy_from_slice(bytemuck::cast_slice(&values[..]));
    frame
}

/// Nearest-neighbour stand-in for calibrated registration.
struct SimRegistration;

impl Registration for SimRegistration {
    fn apply(
        &self,
        color: &Frame,
        depth: &Frame,
        undistorted: &mut Frame,
        registered: &mut Frame,
        bigdepth: Option<&mut Frame>,
    ) {
        let n = undistorted.byte_len().min(depth.byte_len());
        undistorted.data[..n].copy_from_slice(&depth.data[..n]);

        let depth_px = |x: usize, y: usize| -> f32 {
            let i = (y * depth.width + x) * 4;
            bytemuck::pod_read_unaligned(&depth.data[i..i + 4])
        };

        for y in 0..registered.height {
            let cy = y * color.height / registered.height.max(1);
            for x in 0..registered.width {
                let cx = x * color.width / registered.width.max(1);
                let src = (cy * color.width + cx) * 4;
                let dst = (y * registered.width + x) * 4;
                if depth_px(x.min(depth.width - 1), y.min(depth.height - 1)) > 0.0 {
                    registered.data[dst..dst + 4].copy_from_slice(&color.data[src..src + 4]);
                } else {
                    registered.data[dst..dst + 4].fill(0);
                }
            }
        }

        if let Some(big) = bigdepth {
            // First and last rows are padding.
            let inner = big.height.saturating_sub(2).max(1);
            for y in 0..big.height {
                for x in 0..big.width {
                    let value = if y == 0 || y + 1 == big.height {
                        f32::INFINITY
                    } else {
                        let dy = (y - 1) * depth.height / inner;
                        let dx = x * depth.width / big.width.max(1);
                        depth_px(dx, dy)
                    };
                    let dst = (y * big.width + x) * 4;
                    big.data[dst..dst + 4].copy_from_slice(&value.to_ne_bytes());
                }
            }
        }
    }
}
