//! Capture coordinator: bulk recordings to disk.
//!
//! A recording collects a fixed quota of samples from the DMA source,
//! demultiplexes the caller's channel subset and writes a binary file
//! plus a JSON sidecar. Capture runs in two phases by design: a fast
//! ingest into RAM that keeps up with the device, then filtering and
//! persistence once the quota is met. While a recording is in progress
//! the coordinator holds the recording flag; the live-streaming path
//! polls it and releases the data device within one read iteration.

use crate::align::shift_alignment;
use crate::bram::ConfigSnapshot;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::frame::{self, ChannelSet, FRAME_SIZE};
use crate::metadata::CaptureMetadata;
use crate::ring::{RingBuffer, RingReader};
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Documented sample rate of the digitiser, used both for
/// duration-to-sample conversion and in capture sidecars.
pub const SAMPLE_RATE: u64 = 244_400_000;

/// Chunk size for phase-1 ingest reads.
const READ_CHUNK: usize = 4 * 1024 * 1024;

/// Emit a progress event roughly this often, in samples.
const PROGRESS_EVERY_SAMPLES: u64 = 100_000;

/// Default grace period for the live streamer to release the device
/// before an exclusive open.
const STREAM_YIELD: Duration = Duration::from_secs(1);

/// Sleep when the source has no data available yet.
const STARVED_SLEEP: Duration = Duration::from_millis(1);

/// How much data a recording should collect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quota {
    /// An exact number of sample frames.
    Samples(u64),
    /// A duration at the documented [`SAMPLE_RATE`].
    Duration(Duration),
    /// A byte size of the full 8-channel input stream.
    Bytes(u64),
}

impl Quota {
    /// The quota expressed as a number of sample frames.
    pub fn samples(&self) -> Result<u64> {
        let samples = match *self {
            Quota::Samples(n) => n,
            Quota::Duration(d) => (d.as_secs_f64() * SAMPLE_RATE as f64) as u64,
            Quota::Bytes(bytes) => bytes / FRAME_SIZE as u64,
        };
        if samples == 0 {
            return Err(Error::invalid_argument("capture quota is empty"));
        }
        Ok(samples)
    }
}

/// Parses a human-readable byte size such as `4096B`, `100MB` or `1GB`.
pub fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim().to_uppercase();
    let (digits, multiplier) = if let Some(v) = value.strip_suffix("GB") {
        (v.to_string(), 1024 * 1024 * 1024)
    } else if let Some(v) = value.strip_suffix("MB") {
        (v.to_string(), 1024 * 1024)
    } else if let Some(v) = value.strip_suffix("KB") {
        (v.to_string(), 1024)
    } else if let Some(v) = value.strip_suffix('B') {
        (v.to_string(), 1)
    } else {
        (value.clone(), 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| Error::invalid_argument(format!("invalid size {value:?}")))
}

/// A frame-aligned source of sample data for phase-1 ingest.
pub trait SampleSource: Send {
    /// Reads up to `buf.len()` bytes. Returns 0 when no data is
    /// available yet; the coordinator sleeps briefly and retries.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Reads directly from the C2H character device (exclusive access).
#[derive(Debug)]
pub struct DeviceSource {
    file: std::fs::File,
    path: PathBuf,
}

impl DeviceSource {
    /// Opens the device read-only and enlarges the kernel pipe buffer
    /// (best effort).
    pub fn open(path: &std::path::Path) -> Result<DeviceSource> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| Error::device_open(path, e))?;
        unsafe {
            libc::fcntl(file.as_raw_fd(), libc::F_SETPIPE_SZ, 1024 * 1024);
        }
        Ok(DeviceSource {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl SampleSource for DeviceSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.file.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::device_io(
                        format!("read {}", self.path.display()),
                        e,
                    ))
                }
            }
        }
    }
}

/// Consumes the shared-memory ring from the producer's current head.
#[derive(Debug)]
pub struct RingSource {
    reader: RingReader,
}

impl RingSource {
    /// Opens a consumer mapping of the ring at the given path.
    pub fn open(path: &std::path::Path) -> Result<RingSource> {
        Ok(RingSource {
            reader: RingReader::new(RingBuffer::open_at(path)?),
        })
    }
}

impl SampleSource for RingSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.reader.read_into(buf))
    }
}

/// Boot-time selection of the recording source.
#[derive(Debug, Clone)]
pub enum SourceConfig {
    /// Read the C2H device directly; the coordinator is the producer
    /// for the duration of the recording.
    Device(PathBuf),
    /// Consume the shared-memory ring buffer at the given path; the
    /// long-lived DMA producer keeps the device.
    Ring(PathBuf),
}

/// Parameters of one recording.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    /// How much to record.
    pub quota: Quota,
    /// Channel subset to keep in the output file.
    pub channels: ChannelSet,
    /// Output file path.
    pub output: PathBuf,
    /// Apply the gateware-revision alignment shift before writing.
    pub align_shift: bool,
    /// Hardware configuration snapshot for the sidecar.
    pub config: Option<ConfigSnapshot>,
}

/// Summary of a completed recording.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureReport {
    /// Sample frames captured.
    pub samples: u64,
    /// Bytes written to the output file.
    pub bytes_written: u64,
    /// Duration of the ingest phase.
    pub duration: Duration,
    /// Ingest throughput in MB/s.
    pub throughput_mbps: f64,
    /// Whether the recording was stopped before the quota was met.
    pub cancelled: bool,
}

/// Serialises bulk recordings and arbitrates device ownership against
/// the live-streaming path.
#[derive(Debug)]
pub struct CaptureCoordinator {
    source: SourceConfig,
    recording: Arc<AtomicBool>,
    events: broadcast::Sender<Event>,
    stream_yield: Duration,
}

/// Clears the recording flag when a recording ends, however it ends.
struct RecordingGuard(Arc<AtomicBool>);

impl Drop for RecordingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CaptureCoordinator {
    /// Creates a coordinator for the given source.
    pub fn new(source: SourceConfig, events: broadcast::Sender<Event>) -> CaptureCoordinator {
        CaptureCoordinator {
            source,
            recording: Arc::new(AtomicBool::new(false)),
            events,
            stream_yield: STREAM_YIELD,
        }
    }

    /// Overrides the grace period granted to the live streamer before
    /// the exclusive device open.
    pub fn with_stream_yield(mut self, stream_yield: Duration) -> CaptureCoordinator {
        self.stream_yield = stream_yield;
        self
    }

    /// The shared recording flag.
    ///
    /// Whichever task holds the data device for streaming — the DMA
    /// producer, or a live-stream task layered on top — polls this at
    /// the top of every read iteration and releases its descriptor
    /// while it is set.
    pub fn recording_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.recording)
    }

    /// Whether a recording is currently in progress.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Runs one recording to completion.
    ///
    /// Blocking; drive from `tokio::task::spawn_blocking`. Fails with
    /// [`Error::AlreadyBusy`] if a recording is already in progress.
    /// A stop via `cancel` still finalises the file and sidecar with
    /// whatever was captured and reports `cancelled = true`.
    pub fn record(
        &self,
        request: &CaptureRequest,
        cancel: &CancellationToken,
    ) -> Result<CaptureReport> {
        if self
            .recording
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyBusy);
        }
        let _guard = RecordingGuard(Arc::clone(&self.recording));

        let samples_total = request.quota.samples()?;
        let filename = request.output.display().to_string();
        let _ = self.events.send(Event::RecordingStatus {
            recording: true,
            filename: Some(filename.clone()),
            total: Some(samples_total),
            finished: None,
            error: None,
        });

        match self.run_recording(request, samples_total, cancel) {
            Ok(report) => {
                let error = report
                    .cancelled
                    .then(|| Error::OperatorCancel.to_string());
                let _ = self.events.send(Event::RecordingStatus {
                    recording: false,
                    filename: Some(filename),
                    total: Some(samples_total),
                    finished: Some(!report.cancelled),
                    error,
                });
                Ok(report)
            }
            Err(e) => {
                tracing::error!(error = %e, "recording failed");
                let _ = self.events.send(Event::RecordingStatus {
                    recording: false,
                    filename: Some(filename),
                    total: Some(samples_total),
                    finished: Some(false),
                    error: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    fn open_source(&self) -> Result<Box<dyn SampleSource>> {
        match &self.source {
            SourceConfig::Device(path) => {
                // Give the device holder (DMA producer or live
                // streamer) time to notice the recording flag and
                // release its descriptor.
                std::thread::sleep(self.stream_yield);
                Ok(Box::new(DeviceSource::open(path)?))
            }
            SourceConfig::Ring(path) => Ok(Box::new(RingSource::open(path)?)),
        }
    }

    fn run_recording(
        &self,
        request: &CaptureRequest,
        samples_total: u64,
        cancel: &CancellationToken,
    ) -> Result<CaptureReport> {
        let total_bytes = samples_total as usize * FRAME_SIZE;
        let mut source = self.open_source()?;
        tracing::info!(
            samples = samples_total,
            mb = total_bytes / (1024 * 1024),
            output = %request.output.display(),
            "capturing into RAM"
        );

        // Phase 1: frame-aligned ingest into RAM.
        let start = Instant::now();
        let mut data: Vec<u8> = Vec::with_capacity(total_bytes);
        let mut buf = vec![0u8; frame::align_down(READ_CHUNK)];
        let mut last_progress = 0u64;
        let mut cancelled = false;
        while data.len() < total_bytes {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let want = (total_bytes - data.len()).min(buf.len());
            let n = source.read_chunk(&mut buf[..want])?;
            if n == 0 {
                std::thread::sleep(STARVED_SLEEP);
                continue;
            }
            data.extend_from_slice(&buf[..n]);
            let samples_recorded = (data.len() / FRAME_SIZE) as u64;
            if samples_recorded - last_progress > PROGRESS_EVERY_SAMPLES {
                let _ = self.events.send(Event::RecordingProgress {
                    current: samples_recorded,
                    total: samples_total,
                });
                last_progress = samples_recorded;
            }
        }
        let duration = start.elapsed();
        // Release the device before the (possibly slow) write phase.
        drop(source);

        // A cancelled run may hold a partial trailing frame; drop it.
        data.truncate(frame::align_down(data.len()).min(total_bytes));
        let samples = (data.len() / FRAME_SIZE) as u64;
        let mbps = if duration.as_secs_f64() > 0.0 {
            data.len() as f64 / (1024.0 * 1024.0) / duration.as_secs_f64()
        } else {
            0.0
        };
        tracing::info!(
            "capture complete: {samples} samples in {:.3} s ({mbps:.2} MB/s), demultiplexing",
            duration.as_secs_f64()
        );

        // Phase 2: demultiplex and persist.
        let data = if request.align_shift {
            let (shifted, applied) = shift_alignment(&data);
            if applied {
                tracing::info!(shift_frames = crate::align::SHIFT_FRAMES, "alignment shift applied");
            }
            shifted
        } else {
            data
        };
        let output = frame::demux(&data, &request.channels);
        std::fs::write(&request.output, &output).map_err(|e| {
            Error::device_io(format!("write capture {}", request.output.display()), e)
        })?;
        let metadata = CaptureMetadata::new(SAMPLE_RATE, &request.channels, request.config.clone());
        metadata.write_sidecar(&request.output)?;

        Ok(CaptureReport {
            samples,
            bytes_written: output.len() as u64,
            duration,
            throughput_mbps: mbps,
            cancelled,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::BYTES_PER_CHANNEL;

    fn events() -> broadcast::Sender<Event> {
        broadcast::channel(64).0
    }

    fn device_coordinator(path: &std::path::Path) -> CaptureCoordinator {
        CaptureCoordinator::new(SourceConfig::Device(path.to_path_buf()), events())
            .with_stream_yield(Duration::ZERO)
    }

    /// A stream where frame f, channel ch carries bytes
    /// [f, ch, !f, !ch].
    fn pattern_stream(frames: usize) -> Vec<u8> {
        (0..frames)
            .flat_map(|f| {
                (0..crate::frame::NUM_CHANNELS)
                    .flat_map(move |ch| [f as u8, ch as u8, !(f as u8), !(ch as u8)])
            })
            .collect()
    }

    #[test]
    fn quota_conversions() {
        assert_eq!(Quota::Samples(10_000).samples().unwrap(), 10_000);
        assert_eq!(
            Quota::Duration(Duration::from_secs(1)).samples().unwrap(),
            SAMPLE_RATE
        );
        assert_eq!(Quota::Bytes(3200).samples().unwrap(), 100);
        // Byte sizes round down to whole frames.
        assert_eq!(Quota::Bytes(3231).samples().unwrap(), 100);
        assert!(Quota::Samples(0).samples().is_err());
        assert!(Quota::Bytes(31).samples().is_err());
    }

    #[test]
    fn size_suffix_parsing() {
        assert_eq!(parse_size("4096B").unwrap(), 4096);
        assert_eq!(parse_size("100MB").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_size("1gb").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("12KB").unwrap(), 12 * 1024);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn subset_capture_demuxes_and_writes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("device");
        let input = pattern_stream(12_000);
        std::fs::write(&device, &input).unwrap();

        let output = dir.path().join("capture.bin");
        let coordinator = device_coordinator(&device);
        let request = CaptureRequest {
            quota: Quota::Samples(10_000),
            channels: ChannelSet::from_list(&[1, 3, 5]).unwrap(),
            output: output.clone(),
            align_shift: false,
            config: None,
        };
        let report = coordinator
            .record(&request, &CancellationToken::new())
            .unwrap();
        assert_eq!(report.samples, 10_000);
        assert!(!report.cancelled);

        let written = std::fs::read(&output).unwrap();
        assert_eq!(written.len(), 10_000 * 3 * BYTES_PER_CHANNEL);
        assert_eq!(report.bytes_written, written.len() as u64);
        // The first channel of every output frame is the first channel
        // of the corresponding input frame.
        for f in 0..10_000 {
            let out = &written[f * 12..f * 12 + 4];
            let inp = &input[f * FRAME_SIZE..f * FRAME_SIZE + 4];
            assert_eq!(out[..2], inp[..2]);
        }

        let sidecar: CaptureMetadata = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("capture.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(sidecar.channels, vec![1, 3, 5]);
        assert_eq!(sidecar.sample_rate, SAMPLE_RATE);
    }

    #[test]
    fn full_capture_is_verbatim_and_truncated_to_quota() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("device");
        let input = pattern_stream(300);
        std::fs::write(&device, &input).unwrap();

        let output = dir.path().join("all.bin");
        let coordinator = device_coordinator(&device);
        let request = CaptureRequest {
            quota: Quota::Bytes(200 * FRAME_SIZE as u64),
            channels: ChannelSet::default(),
            output: output.clone(),
            align_shift: false,
            config: None,
        };
        let report = coordinator
            .record(&request, &CancellationToken::new())
            .unwrap();
        assert_eq!(report.samples, 200);

        let written = std::fs::read(&output).unwrap();
        assert_eq!(written, &input[..200 * FRAME_SIZE]);
    }

    #[test]
    fn second_recording_is_rejected_while_busy() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = device_coordinator(&dir.path().join("device"));
        coordinator.recording_flag().store(true, Ordering::SeqCst);
        let request = CaptureRequest {
            quota: Quota::Samples(1),
            channels: ChannelSet::default(),
            output: dir.path().join("out.bin"),
            align_shift: false,
            config: None,
        };
        assert!(matches!(
            coordinator.record(&request, &CancellationToken::new()),
            Err(Error::AlreadyBusy)
        ));
        // The flag belongs to the earlier recording and must survive.
        assert!(coordinator.is_recording());
    }

    #[test]
    fn cancel_finalises_truncated_file_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("device");
        std::fs::write(&device, pattern_stream(100)).unwrap();

        let output = dir.path().join("stopped.bin");
        let coordinator = device_coordinator(&device);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = CaptureRequest {
            quota: Quota::Samples(1_000_000),
            channels: ChannelSet::default(),
            output: output.clone(),
            align_shift: false,
            config: None,
        };
        let mut rx = coordinator.events.subscribe();
        let report = coordinator.record(&request, &cancel).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.samples, 0);
        assert!(output.exists());
        assert!(dir.path().join("stopped.json").exists());
        assert!(!coordinator.is_recording());

        // start status, then a not-finished status with the error.
        let first = rx.try_recv().unwrap();
        assert!(matches!(
            first,
            Event::RecordingStatus {
                recording: true,
                ..
            }
        ));
        let last = rx.try_recv().unwrap();
        match last {
            Event::RecordingStatus {
                recording: false,
                finished: Some(false),
                error: Some(e),
                ..
            } => assert!(e.contains("stopped by operator")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn read_error_aborts_with_error_event() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = device_coordinator(&dir.path().join("missing"));
        let request = CaptureRequest {
            quota: Quota::Samples(100),
            channels: ChannelSet::default(),
            output: dir.path().join("out.bin"),
            align_shift: false,
            config: None,
        };
        let mut rx = coordinator.events.subscribe();
        assert!(matches!(
            coordinator.record(&request, &CancellationToken::new()),
            Err(Error::DeviceOpen { .. })
        ));
        assert!(!coordinator.is_recording());
        let _start = rx.try_recv().unwrap();
        match rx.try_recv().unwrap() {
            Event::RecordingStatus {
                finished: Some(false),
                error: Some(_),
                ..
            } => {}
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn progress_events_are_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("device");
        let frames = 250_000;
        std::fs::write(&device, pattern_stream(frames)).unwrap();

        let coordinator = device_coordinator(&device);
        let request = CaptureRequest {
            quota: Quota::Samples(frames as u64),
            channels: ChannelSet::default(),
            output: dir.path().join("big.bin"),
            align_shift: false,
            config: None,
        };
        let mut rx = coordinator.events.subscribe();
        coordinator
            .record(&request, &CancellationToken::new())
            .unwrap();

        let mut progress = 0;
        while let Ok(event) = rx.try_recv() {
            if let Event::RecordingProgress { current, total } = event {
                assert!(current <= total);
                progress += 1;
            }
        }
        // 250k samples with a 100k reporting step.
        assert!((1..=3).contains(&progress), "got {progress} progress events");
    }

    #[test]
    fn ring_source_capture_follows_producer() {
        let dir = tempfile::tempdir().unwrap();
        let ring_path = dir.path().join("ring");
        let mut producer = RingBuffer::create_at(&ring_path, 4096).unwrap();

        let coordinator =
            CaptureCoordinator::new(SourceConfig::Ring(ring_path.clone()), events());
        let output = dir.path().join("ring.bin");
        let request = CaptureRequest {
            quota: Quota::Samples(64),
            channels: ChannelSet::default(),
            output: output.clone(),
            align_shift: false,
            config: None,
        };

        let input = pattern_stream(64);
        let recording = coordinator.recording_flag();
        let feeder = {
            let input = input.clone();
            std::thread::spawn(move || {
                // Wait for the recording to start (and its reader to
                // attach at the current head) before producing.
                while !recording.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                std::thread::sleep(Duration::from_millis(50));
                for chunk in input.chunks(8 * FRAME_SIZE) {
                    producer.write(chunk).unwrap();
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let report = coordinator
            .record(&request, &CancellationToken::new())
            .unwrap();
        feeder.join().unwrap();
        assert_eq!(report.samples, 64);
        assert_eq!(std::fs::read(&output).unwrap(), input);
    }
}
