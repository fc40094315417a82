//! qcapture CLI arguments.
//!
//! This module contains the definition of the CLI arguments for the
//! qcapture binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// qcapture CLI arguments.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// C2H DMA data device
    #[arg(short = 'd', long, default_value = "/dev/xdma0_c2h_0")]
    pub device: PathBuf,
    /// XDMA user device carrying the BRAM control region
    #[arg(long, default_value = "/dev/xdma0_user")]
    pub control_device: PathBuf,
    /// Run without the control device (no parameter control)
    #[arg(long)]
    pub no_hardware: bool,
    /// Instantaneous bandwidth in MHz, used to scale DDC frequencies
    /// against the 250 MHz design clock
    #[arg(long, default_value_t = 250.0)]
    pub ibw_mhz: f64,
    /// Name of the shared-memory ring buffer under /dev/shm
    #[arg(long, default_value = "xdma_ring")]
    pub ring_name: String,
    /// Operation to perform
    #[command(subcommand)]
    pub command: Command,
}

/// qcapture subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Stream the C2H device into the shared-memory ring and serve
    /// recordings
    Run(RunArgs),
    /// One-shot capture to a file
    Capture(CaptureArgs),
}

/// Arguments of the `run` subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Ring payload size in GiB
    #[arg(long, default_value_t = 8)]
    pub ring_gb: u64,
    /// Device read block size in bytes (rounded down to whole frames)
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    pub block_size: usize,
    /// Recordings consume the ring instead of re-opening the device
    #[arg(long)]
    pub record_from_ring: bool,
}

/// Arguments of the `capture` subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct CaptureArgs {
    /// Capture size (e.g. 100MB, 1GB, 4096B)
    #[arg(short = 's', long, default_value = "100MB")]
    pub size: String,
    /// Capture an exact number of sample frames instead of a size
    #[arg(long, conflicts_with = "seconds")]
    pub samples: Option<u64>,
    /// Capture a duration in seconds instead of a size
    #[arg(long)]
    pub seconds: Option<f64>,
    /// Output filename
    #[arg(short = 'o', long, default_value = "capture.bin")]
    pub output: PathBuf,
    /// Comma-separated 1-indexed channels to keep (e.g. 1,3,5)
    #[arg(long, default_value = "1,2,3,4,5,6,7,8")]
    pub channels: String,
    /// Hardware configuration JSON file applied before the capture
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
    /// Capture from the shared-memory ring instead of the device
    #[arg(long)]
    pub from_ring: bool,
    /// Apply the gateware-revision alignment shift post-process
    #[arg(long)]
    pub align_shift: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_documented_paths() {
        let args = Args::parse_from(["qcapture", "run"]);
        assert_eq!(args.device, PathBuf::from("/dev/xdma0_c2h_0"));
        assert_eq!(args.control_device, PathBuf::from("/dev/xdma0_user"));
        assert_eq!(args.ring_name, "xdma_ring");
        assert_eq!(args.ibw_mhz, 250.0);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.ring_gb, 8);
                assert_eq!(run.block_size, 4 * 1024 * 1024);
            }
            other => panic!("unexpected subcommand {other:?}"),
        }
    }

    #[test]
    fn capture_arguments_parse() {
        let args = Args::parse_from([
            "qcapture", "capture", "-s", "1GB", "-o", "iq.bin", "--channels", "1,3,5",
            "--from-ring",
        ]);
        match args.command {
            Command::Capture(cap) => {
                assert_eq!(cap.size, "1GB");
                assert_eq!(cap.output, PathBuf::from("iq.bin"));
                assert_eq!(cap.channels, "1,3,5");
                assert!(cap.from_ring);
                assert!(!cap.align_shift);
            }
            other => panic!("unexpected subcommand {other:?}"),
        }
    }
}
