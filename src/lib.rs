//! # kinect2 - device lifecycle and frame exchange for Kinect v2 class sensors
//!
//! Thin layer between a depth-camera driver and a host numeric-array
//! runtime. Provides:
//! - Device discovery and open with an explicit packet pipeline
//! - A session state machine owning listener, registration helper and
//!   output buffers, with strictly ordered teardown
//! - Blocking / timeout-bounded acquisition of synchronized color+IR+depth
//!   frame sets and their release back to the driver
//! - Copying frames into shape/type-described host arrays
//! - C FFI over registry-validated opaque tokens
//!
//! The driver itself sits behind the traits in [`driver`]; [`sim`] provides
//! a synthetic backend.
//!
//! ## Quick Start
//! ```no_run
//! use kinect2::sim::{SimConfig, SimulatedDriver};
//! use kinect2::{Context, FrameType, PipelineKind};
//! use std::time::Duration;
//!
//! let ctx = Context::new(SimulatedDriver::new(SimConfig::default()));
//! let mut device = ctx.open_device(None, PipelineKind::Cpu).unwrap();
//! device.initialize_default().unwrap();
//!
//! loop {
//!     match device.acquire(Some(Duration::from_secs(1))) {
//!         Ok(_) => break,
//!         Err(e) if e.is_recoverable() => std::thread::sleep(Duration::from_millis(5)),
//!         Err(e) => panic!("{}", e),
//!     }
//! }
//! let depth = device.export(FrameType::Depth).unwrap();
//! println!("depth shape: {:?}", depth.shape);
//! device.release().unwrap();
//! device.close();
//! ```

pub mod error;
pub mod types;
pub mod driver;
pub mod registry;
pub mod listener;
pub mod export;
pub mod context;
pub mod device;
pub mod sim;
pub mod ffi;

pub use context::Context;
pub use device::{Device, FrameSet};
pub use error::Kinect2Error;
pub use export::{ElementType, HostArray};
pub use types::*;

/// Result type alias for kinect2 operations.
pub type Result<T> = std::result::Result<T, Kinect2Error>;
