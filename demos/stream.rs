//! Acquire frame sets from the default sensor and print depth statistics.
//!
//! Usage: cargo run --example stream [frames]

use kinect2::sim::{SimConfig, SimulatedDriver};
use kinect2::{Context, FrameType, Kinect2Error, PipelineKind};
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();

    let frames: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(90);

    let ctx = Context::new(SimulatedDriver::new(SimConfig::from_env()));
    let mut device = match ctx.open_device(None, PipelineKind::Cpu) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Failed to open device: {}", e);
            std::process::exit(1);
        }
    };

    println!("Serial:   {}", device.serial());
    println!("Firmware: {}", device.firmware_version());
    println!("Pipeline: {:?}", device.pipeline());

    if let Err(e) = device.initialize_default() {
        eprintln!("Failed to start streaming: {}", e);
        std::process::exit(1);
    }
    println!();

    let start = Instant::now();
    let mut count: u64 = 0;
    let mut idle_since = Instant::now();

    while count < frames {
        match device.acquire(Some(Duration::from_secs(1))) {
            Ok(set) => {
                count += 1;
                idle_since = Instant::now();
                let seq = set.get(FrameType::Depth).map(|f| f.sequence).unwrap_or(0);

                if count % 30 == 1 {
                    match device.export(FrameType::Depth).map(|a| a.to_f32()) {
                        Ok(Some(depth)) => {
                            let valid: Vec<f32> =
                                depth.into_iter().filter(|v| *v > 0.0).collect();
                            let mean = valid.iter().sum::<f32>() / valid.len().max(1) as f32;
                            println!(
                                "seq={:<6} depth valid={} mean={:.1}mm",
                                seq,
                                valid.len(),
                                mean
                            );
                        }
                        Ok(None) => {}
                        Err(e) => eprintln!("Export failed: {}", e),
                    }
                }

                if let Err(e) = device.release() {
                    eprintln!("Release failed: {}", e);
                    break;
                }
            }
            Err(Kinect2Error::NoFrameAvailable) | Err(Kinect2Error::AcquireTimeout) => {
                if idle_since.elapsed() > Duration::from_secs(5) {
                    eprintln!("No frames for 5s, giving up");
                    break;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "\nTotal: {} frame sets in {:.1}s ({:.1} Hz)",
        count,
        elapsed,
        count as f64 / elapsed
    );
    device.close();
}
