//! List connected sensors.
//!
//! Usage: KINECT2_SIM_DEVICES=2 cargo run --example enumerate

use kinect2::sim::{SimConfig, SimulatedDriver};
use kinect2::Context;

fn main() {
    env_logger::init();

    let ctx = Context::new(SimulatedDriver::new(SimConfig::from_env()));
    let devices = ctx.devices();

    println!("Found {} device(s):", devices.len());
    for (i, dev) in devices.iter().enumerate() {
        println!("  [{}] serial={}  FW={}", i, dev.serial, dev.firmware);
    }

    match ctx.default_serial() {
        Some(serial) => println!("Default: {}", serial),
        None => {
            eprintln!("No device connected");
            std::process::exit(1);
        }
    }
}
