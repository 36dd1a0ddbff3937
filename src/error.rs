use crate::types::{DeviceState, PipelineKind, PixelFormat};
use std::cell::RefCell;
use std::fmt;

/// Errors raised by the lifecycle, exchange and export layers.
#[derive(Debug, thiserror::Error)]
pub enum Kinect2Error {
    #[error("Handle not valid")]
    InvalidHandle,

    #[error("Packet pipeline {0:?} is not available in this driver build")]
    UnsupportedPipeline(PipelineKind),

    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),

    #[error("Device refused to start streaming")]
    StreamStartFailed,

    #[error("No frame available")]
    NoFrameAvailable,

    #[error("Timeout waiting for a synchronized frame set")]
    AcquireTimeout,

    #[error("Frame format {0:?} has no array mapping")]
    UnexportableFormat(PixelFormat),

    #[error("Operation not allowed while device is {0:?}")]
    InvalidState(DeviceState),

    #[error("No frame set is held; acquire one first")]
    FrameNotHeld,

    #[error("Previous frame set was not released")]
    FrameSetOutstanding,

    #[error("Unknown frame type tag {0}")]
    UnknownFrameType(u8),

    #[error("Unknown pipeline tag {0}")]
    UnknownPipeline(u8),

    #[error("Frame type mask 0x{0:x} selects no color, IR or depth stream")]
    InvalidFrameTypes(u32),

    #[error("Null pointer passed for {0}")]
    NullPointer(&'static str),

    #[error("Driver error: {0}")]
    Driver(String),
}

impl Kinect2Error {
    /// True for the expected outcomes of polling acquisition.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Kinect2Error::NoFrameAvailable | Kinect2Error::AcquireTimeout)
    }
}

thread_local! {
    /// Last error message per thread, for the C FFI layer.
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Store `err` as the calling thread's last error for C consumers.
pub(crate) fn set_last_error(err: &Kinect2Error) {
    LAST_ERROR.with(|msg| {
        *msg.borrow_mut() = fmt::format(format_args!("{}\0", err));
    });
}

pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|msg| msg.borrow_mut().clear());
}

/// Null-terminated last error, or null. Valid until the next set/clear on
/// the calling thread.
pub(crate) fn last_error_ptr() -> *const std::ffi::c_char {
    LAST_ERROR.with(|msg| {
        let msg = msg.borrow();
        if msg.is_empty() {
            std::ptr::null()
        } else {
            msg.as_ptr() as *const std::ffi::c_char
        }
    })
}

#[cfg(test)]
pub(crate) fn last_error_message() -> String {
    LAST_ERROR.with(|msg| msg.borrow().trim_end_matches('\0').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(Kinect2Error::NoFrameAvailable.is_recoverable());
        assert!(Kinect2Error::AcquireTimeout.is_recoverable());
        assert!(!Kinect2Error::InvalidHandle.is_recoverable());
        assert!(!Kinect2Error::StreamStartFailed.is_recoverable());
    }

    #[test]
    fn test_last_error_is_nul_terminated() {
        clear_last_error();
        assert!(last_error_ptr().is_null());

        set_last_error(&Kinect2Error::UnsupportedPipeline(PipelineKind::OpenCl));
        let msg = unsafe { std::ffi::CStr::from_ptr(last_error_ptr()) };
        assert_eq!(
            msg.to_str().unwrap(),
            "Packet pipeline OpenCl is not available in this driver build"
        );

        clear_last_error();
        assert!(last_error_ptr().is_null());
    }

    #[test]
    fn test_last_error_is_per_thread() {
        set_last_error(&Kinect2Error::FrameNotHeld);
        let other = std::thread::spawn(|| last_error_ptr().is_null())
            .join()
            .unwrap();
        assert!(other);
        assert_eq!(last_error_message(), "No frame set is held; acquire one first");
        clear_last_error();
    }
}
