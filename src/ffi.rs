//! C FFI layer for kinect2.
//!
//! Token-based command surface for host runtimes. Contexts and devices are
//! held in a process-wide [`HandleRegistry`] and addressed by `u64` tokens;
//! a token of 0 means "none" or "failed". The generated C header is written
//! to `include/kinect2.h` by cbindgen.

use crate::context::Context;
use crate::device::Device;
use crate::error::{clear_last_error, last_error_ptr, set_last_error};
use crate::export::ElementType;
use crate::registry::{HandleRegistry, HandleToken};
use crate::sim::{SimConfig, SimulatedDriver};
use crate::types::{FrameType, FrameTypes, PipelineKind};
use crate::{Kinect2Error, Result};
use std::ffi::{c_char, c_int, CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

static REGISTRY: HandleRegistry = HandleRegistry::new();

/// Timeout hosts should pass to `k2_process_frame` when they have no
/// preference of their own.
pub const K2_DEFAULT_TIMEOUT_MS: c_int = 1000;

/// Devices sit behind a mutex: one consumer at a time per device.
type DeviceCell = Mutex<Device>;

/// Exported frame in C-compatible layout. Free with `k2_free_array`.
#[repr(C)]
pub struct K2Array {
    /// 2 or 3.
    pub ndim: usize,
    /// Row-major dimensions: height, width, channels. Unused entries are 0.
    pub shape: [usize; 3],
    pub element_type: ElementType,
    /// Owned copy of the pixel data.
    pub data: *mut u8,
    /// Length of `data` in bytes.
    pub len: usize,
}

/// Host callback receiving log records: level (1=error .. 5=trace) and a
/// null-terminated message valid only for the duration of the call.
pub type K2LogSink = extern "C" fn(level: c_int, message: *const c_char);

static LOG_SINK: Mutex<Option<K2LogSink>> = Mutex::new(None);

struct HostLogger;

static HOST_LOGGER: HostLogger = HostLogger;

static LOGGER_INSTALLED: AtomicBool = AtomicBool::new(false);

impl log::Log for HostLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        LOG_SINK
            .lock()
            .map(|sink| sink.is_some())
            .unwrap_or(false)
    }

    fn log(&self, record: &log::Record) {
        let sink = match LOG_SINK.lock() {
            Ok(sink) => *sink,
            Err(_) => return,
        };
        let Some(sink) = sink else {
            return;
        };
        let text = format!("[{}] {}", record.target(), record.args()).replace('\0', " ");
        if let Ok(message) = CString::new(text) {
            sink(record.level() as c_int, message.as_ptr());
        }
    }

    fn flush(&self) {}
}

fn level_filter(level: c_int) -> log::LevelFilter {
    match level {
        i if i <= 0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn report<T>(result: Result<T>, on_error: T) -> T {
    match result {
        Ok(value) => {
            clear_last_error();
            value
        }
        Err(e) => {
            set_last_error(&e);
            on_error
        }
    }
}

fn context(ctx: u64) -> Result<std::sync::Arc<Context>> {
    REGISTRY.get::<Context>(HandleToken::from_raw(ctx))
}

fn with_device<R>(ctx: u64, dev: u64, f: impl FnOnce(&mut Device) -> Result<R>) -> Result<R> {
    context(ctx)?;
    let cell = REGISTRY.get::<DeviceCell>(HandleToken::from_raw(dev))?;
    let mut device = cell.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut device)
}

/// Create a driver context. Returns 0 on error.
///
/// The simulated backend is configured from `KINECT2_SIM_*` environment
/// variables.
#[no_mangle]
pub extern "C" fn k2_new() -> u64 {
    let ctx = Context::new(SimulatedDriver::new(SimConfig::from_env()));
    clear_last_error();
    REGISTRY.wrap(ctx).raw()
}

/// Number of connected devices, or -1 on error.
#[no_mangle]
pub extern "C" fn k2_enumerate_devices(ctx: u64) -> c_int {
    report(context(ctx).map(|c| c.enumerate_devices() as c_int), -1)
}

/// Open a device. `serial` may be null or empty for the default device;
/// `pipeline` is 0=CPU, 1=OpenGL, 2=CUDA, 3=OpenCL. Returns 0 on error.
///
/// # Safety
/// `serial` must be null or point to a null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn k2_open_device(ctx: u64, serial: *const c_char, pipeline: u8) -> u64 {
    let result = (|| -> Result<u64> {
        let context = context(ctx)?;
        let pipeline = PipelineKind::try_from(pipeline)?;
        let serial = if serial.is_null() {
            None
        } else {
            Some(CStr::from_ptr(serial).to_str().map_err(|_| {
                Kinect2Error::DeviceOpenFailed("serial is not valid UTF-8".into())
            })?)
        };
        let device = context.open_device(serial, pipeline)?;
        Ok(REGISTRY.wrap::<DeviceCell>(Mutex::new(device)).raw())
    })();
    report(result, 0)
}

/// Attach a listener and start streaming. `frame_types` is a mask of
/// 1=color, 2=IR, 4=depth; 0 subscribes to all three. Any other bit is
/// rejected. Returns 0 on success, -1 on error.
#[no_mangle]
pub extern "C" fn k2_initialize_device(ctx: u64, dev: u64, frame_types: u32) -> c_int {
    let types = match frame_types {
        0 => Ok(FrameTypes::default()),
        bits => FrameTypes::from_bits(bits).ok_or(Kinect2Error::InvalidFrameTypes(bits)),
    };
    let result = types.and_then(|types| with_device(ctx, dev, |d| d.initialize(types)));
    report(result.map(|_| 0), -1)
}

/// Acquire the next frame set.
/// `timeout_ms`: > 0 bounds the wait, <= 0 waits without bound;
/// `K2_DEFAULT_TIMEOUT_MS` is the usual choice.
/// Returns 1 when a set was acquired, 0 when none was ready or the wait
/// timed out, -1 on error.
#[no_mangle]
pub extern "C" fn k2_process_frame(ctx: u64, dev: u64, timeout_ms: c_int) -> c_int {
    let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms as u64));
    match with_device(ctx, dev, |d| d.acquire(timeout).map(|_| ())) {
        Ok(()) => {
            clear_last_error();
            1
        }
        Err(e) if e.is_recoverable() => {
            clear_last_error();
            0
        }
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Export a frame. `frame_type`: 1=color, 2=IR, 3=depth, 4=undistorted,
/// 5=registered, 6=bigdepth. Returns 0 on success, -1 on error.
///
/// # Safety
/// `out` must point to writable memory for one `K2Array`.
#[no_mangle]
pub unsafe extern "C" fn k2_get_frame(
    ctx: u64,
    dev: u64,
    frame_type: u8,
    out: *mut K2Array,
) -> c_int {
    if out.is_null() {
        set_last_error(&Kinect2Error::NullPointer("out"));
        return -1;
    }
    let result = FrameType::try_from(frame_type)
        .and_then(|ty| with_device(ctx, dev, |d| d.export(ty)));

    match result {
        Ok(array) => {
            let mut shape = [0usize; 3];
            for (slot, &dim) in shape.iter_mut().zip(array.shape.iter()) {
                *slot = dim;
            }
            let ndim = array.ndim();
            let element_type = array.element;
            let data = array.data.into_boxed_slice();
            let len = data.len();
            out.write(K2Array {
                ndim,
                shape,
                element_type,
                data: Box::into_raw(data) as *mut u8,
                len,
            });
            clear_last_error();
            0
        }
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Free the data of an array filled by `k2_get_frame`.
///
/// # Safety
/// `array` must be null or point to a `K2Array` filled by `k2_get_frame`
/// and not freed before.
#[no_mangle]
pub unsafe extern "C" fn k2_free_array(array: *mut K2Array) {
    if array.is_null() {
        return;
    }
    let array = &mut *array;
    if !array.data.is_null() {
        let slice = std::ptr::slice_from_raw_parts_mut(array.data, array.len);
        drop(Box::from_raw(slice));
    }
    array.data = std::ptr::null_mut();
    array.len = 0;
}

/// Release the frame set acquired by `k2_process_frame`.
/// Returns 0 on success, -1 on error (including when no set is held).
#[no_mangle]
pub extern "C" fn k2_cleanup_frame(ctx: u64, dev: u64) -> c_int {
    report(with_device(ctx, dev, |d| d.release()).map(|_| 0), -1)
}

/// Tear down a device (if `dev` is non-zero) and then the context.
/// Returns 0 on success, -1 on error. Teardown is best-effort: a valid
/// context is destroyed even when the device token is invalid, and the
/// first error is reported.
#[no_mangle]
pub extern "C" fn k2_delete(ctx: u64, dev: u64) -> c_int {
    let device_result = (|| -> Result<()> {
        context(ctx)?;
        if dev != 0 {
            let token = HandleToken::from_raw(dev);
            let cell = REGISTRY.get::<DeviceCell>(token)?;
            cell.lock().unwrap_or_else(PoisonError::into_inner).close();
            REGISTRY.destroy::<DeviceCell>(token)?;
        }
        Ok(())
    })();
    if let Err(e) = &device_result {
        log::warn!("Deleting device {} failed: {}", dev, e);
    }
    let context_result = REGISTRY.destroy::<Context>(HandleToken::from_raw(ctx));
    report(device_result.and(context_result).map(|_| 0), -1)
}

/// Copy the device serial into `buf` as a null-terminated string.
/// Returns the serial length (excluding the terminator), or -1 on error.
///
/// # Safety
/// `buf` must point to at least `len` writable bytes, or be null.
#[no_mangle]
pub unsafe extern "C" fn k2_device_serial(
    ctx: u64,
    dev: u64,
    buf: *mut c_char,
    len: usize,
) -> c_int {
    if buf.is_null() || len == 0 {
        set_last_error(&Kinect2Error::NullPointer("buf"));
        return -1;
    }
    let result = with_device(ctx, dev, |d| Ok(d.serial().to_string()));
    match result {
        Ok(serial) => {
            let bytes = serial.as_bytes();
            let n = bytes.len().min(len - 1);
            for (i, &b) in bytes[..n].iter().enumerate() {
                buf.add(i).write(b as c_char);
            }
            buf.add(n).write(0);
            clear_last_error();
            bytes.len() as c_int
        }
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Number of live context and device tokens. The host must not unload the
/// library while this is non-zero.
#[no_mangle]
pub extern "C" fn k2_outstanding_handles() -> usize {
    crate::registry::outstanding_handles()
}

/// Forward log output to `sink` at up to `max_level` (0=off .. 5=trace).
/// Pass null to stop forwarding. Returns 0 on success, -1 if another logger
/// already owns the process log facade.
#[no_mangle]
pub extern "C" fn k2_set_log_sink(sink: Option<K2LogSink>, max_level: c_int) -> c_int {
    *LOG_SINK.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    if sink.is_none() {
        return 0;
    }
    if !LOGGER_INSTALLED.load(Ordering::SeqCst) {
        if log::set_logger(&HOST_LOGGER).is_err() {
            return -1;
        }
        LOGGER_INSTALLED.store(true, Ordering::SeqCst);
    }
    log::set_max_level(level_filter(max_level));
    0
}

/// Get the last error message. Returns NULL if the last call succeeded.
/// The returned pointer is valid until the next kinect2 API call.
#[no_mangle]
pub extern "C" fn k2_last_error() -> *const c_char {
    last_error_ptr()
}
