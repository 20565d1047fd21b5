use std::process::exit;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use fastflight::{DitherConfig, Emulator, FastFlight, UsbConfig};

fn parse_hex_u16(s: &str) -> std::result::Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id {:?}: {}", s, e))
}

#[derive(Parser, Debug)]
#[command(name = "fastflight-demo", about = "Configure a FastFlight-2 and take sweeps")]
struct Args {
    /// USB vendor id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,
    /// USB product id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    pid: Option<u16>,
    /// Record length in nanoseconds
    #[arg(long, default_value_t = 20_000.0)]
    trace_length: f64,
    /// Records summed per sweep
    #[arg(long, default_value_t = 10_000)]
    records: u32,
    /// Sampling interval in nanoseconds (0.25, 0.5, 1 or 2)
    #[arg(long, default_value_t = 0.5)]
    time_per_point: f64,
    /// Input offset in volts
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    offset: f64,
    /// Dither the offset across protocol slots for sweeps above 65535 records
    #[arg(long)]
    dither: bool,
    /// Abort a sweep after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Number of sweeps to take
    #[arg(long, default_value_t = 1)]
    sweeps: usize,
    /// Use the built-in emulator instead of hardware
    #[arg(long)]
    emulate: bool,
}

fn main() {
    fastflight::logging::init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let defaults = UsbConfig::default();
    let config = UsbConfig {
        vendor_id: args.vid.unwrap_or(defaults.vendor_id),
        product_id: args.pid.unwrap_or(defaults.product_id),
        ..defaults
    };

    let mut device = if args.emulate {
        println!("--- Using emulated FastFlight-2 ---");
        FastFlight::from_transport(Emulator::default(), config)
    } else {
        println!(
            "--- Opening FastFlight-2 {:04x}:{:04x} ---",
            config.vendor_id, config.product_id
        );
        FastFlight::open(&config).context("opening device")?
    };

    device.set_time_per_point(args.time_per_point);
    device.set_trace_length(args.trace_length);
    device.set_offset(args.offset);
    device.set_sweep_timeout(args.timeout_ms.map(Duration::from_millis));
    if args.dither {
        device.set_dither(DitherConfig {
            enabled: true,
            ..DitherConfig::default()
        });
    }
    println!(
        "Settings: {} ns/point, {} points, {:.4} V offset",
        device.time_per_point(),
        device.length(),
        device.offset()
    );

    for i in 0..args.sweeps {
        let started = Instant::now();
        let sweep = device
            .take_sweep(device.length(), args.records)
            .with_context(|| format!("sweep {}", i))?;
        let (vscale, voffset, _) = device.scale();
        let peak = sweep.samples.iter().cloned().fold(f64::MIN, f64::max);
        println!(
            "[Sweep {}] {} records in {} spectra, {} points, peak {:.4} V ({:.1?})",
            i,
            sweep.records,
            sweep.spectra,
            sweep.length,
            peak * vscale + voffset,
            started.elapsed()
        );
    }

    if device.resync_count() > 0 {
        println!("Stream resynchronized {} times", device.resync_count());
    }
    println!("Done.");
    Ok(())
}
