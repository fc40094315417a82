//! DMA producer: streams the C2H device into the ring buffer.
//!
//! The producer owns the data-plane character device and a writable
//! ring mapping. It reads directly into consecutive regions of the
//! ring payload (no intermediate copy) and publishes the head only in
//! whole frames, so readers never observe a torn frame boundary.
//! Device ownership is arbitrated through the shared recording flag:
//! while a direct-device recording is in progress the producer closes
//! its descriptor within one read iteration of noticing the flag and
//! reopens it when the flag clears. Transient read errors are retried
//! with a short backoff; the device is expected to be durable and
//! persistent failures are an operator problem.

use crate::error::{Error, Result};
use crate::event::Event;
use crate::frame::FRAME_SIZE;
use crate::ring::RingBuffer;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Default read block size. Large blocks keep the syscall overhead
/// down at multi-GB/s rates.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Kernel pipe buffer size requested on the device (best effort).
const MAX_PIPE_SIZE: libc::c_int = 1024 * 1024;

/// How often the observed data rate is reported.
const RATE_INTERVAL: Duration = Duration::from_secs(2);

/// Backoff after an unexpected read error.
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Sleep between recording-flag polls while the device is yielded.
const YIELDED_POLL: Duration = Duration::from_millis(100);

/// Backoff after a failed reopen once the recording flag clears.
const REOPEN_BACKOFF: Duration = Duration::from_secs(1);

/// Streams the C2H device into a ring buffer.
#[derive(Debug)]
pub struct DmaProducer {
    ring: RingBuffer,
    device: PathBuf,
    block_size: usize,
    recording: Arc<AtomicBool>,
    cancel: CancellationToken,
    events: broadcast::Sender<Event>,
}

impl DmaProducer {
    /// Creates a producer over an owned ring mapping.
    ///
    /// `recording` is the shared recording flag
    /// ([`CaptureCoordinator::recording_flag`](crate::capture::CaptureCoordinator::recording_flag));
    /// while it is set the producer releases the device so that a
    /// direct-device recording can open it exclusively. `block_size`
    /// is rounded down to a whole number of frames.
    pub fn new(
        ring: RingBuffer,
        device: PathBuf,
        block_size: usize,
        recording: Arc<AtomicBool>,
        cancel: CancellationToken,
        events: broadcast::Sender<Event>,
    ) -> Result<DmaProducer> {
        let block_size = crate::frame::align_down(block_size);
        if block_size == 0 {
            return Err(Error::invalid_argument(format!(
                "block size smaller than one {FRAME_SIZE}-byte frame"
            )));
        }
        Ok(DmaProducer {
            ring,
            device,
            block_size,
            recording,
            cancel,
            events,
        })
    }

    fn open_device(&self) -> Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .open(&self.device)
            .map_err(|e| Error::device_open(&self.device, e))?;
        // Enlarge the kernel pipe buffer; not every backing device
        // supports this, so the result is ignored.
        unsafe {
            libc::fcntl(file.as_raw_fd(), libc::F_SETPIPE_SZ, MAX_PIPE_SIZE);
        }
        Ok(file)
    }

    /// Runs the producer loop until cancelled.
    ///
    /// This blocks in device reads and must be driven from a blocking
    /// context (`tokio::task::spawn_blocking`). The recording flag is
    /// checked at the top of every iteration; while it is set the
    /// device stays closed and the head does not advance.
    pub fn run(mut self) -> Result<()> {
        // Fail fast if the device cannot be opened at all; later
        // reopens after a yield are retried instead.
        let mut file = Some(self.open_device()?);
        tracing::info!(
            device = %self.device.display(),
            ring_bytes = self.ring.payload_size(),
            block_size = self.block_size,
            "DMA producer started"
        );

        let payload = self.ring.payload_size() as u64;
        let mut total: u64 = 0;
        let mut since_report: u64 = 0;
        let mut last_report = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("DMA producer stopped");
                return Ok(());
            }
            if self.recording.load(Ordering::SeqCst) {
                if file.take().is_some() {
                    tracing::info!("yielding device for recording");
                }
                std::thread::sleep(YIELDED_POLL);
                continue;
            }
            if file.is_none() {
                match self.open_device() {
                    Ok(f) => {
                        tracing::info!("recording finished, device reclaimed");
                        file = Some(f);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to reopen device");
                        std::thread::sleep(REOPEN_BACKOFF);
                        continue;
                    }
                }
            }
            let Some(reader) = file.as_mut() else {
                continue;
            };
            let head = self.ring.head();
            let space_to_end = (payload - head) as usize;
            let req = self.block_size.min(space_to_end);
            let chunk = self.ring.chunk_mut(head as usize, req);
            match reader.read(chunk) {
                Ok(0) => std::thread::sleep(Duration::from_micros(1)),
                Ok(n) => {
                    // Publish whole frames only; the unaligned tail is
                    // overwritten by the next read starting at the new
                    // head.
                    let aligned = crate::frame::align_down(n) as u64;
                    if aligned > 0 {
                        self.ring.advance_head(aligned);
                        total += aligned;
                        since_report += aligned;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(device = %self.device.display(), error = %e, "DMA read error");
                    std::thread::sleep(ERROR_BACKOFF);
                }
            }
            if last_report.elapsed() >= RATE_INTERVAL {
                let elapsed = last_report.elapsed().as_secs_f64();
                let gbps = since_report as f64 / (1024.0 * 1024.0 * 1024.0) / elapsed;
                let total_gb = total as f64 / (1024.0 * 1024.0 * 1024.0);
                let head = self.ring.head();
                tracing::info!("data rate {gbps:.4} GB/s, total {total_gb:.2} GB, head {head}");
                let _ = self.events.send(Event::DataRate {
                    gbps,
                    total_gb,
                    head,
                });
                last_report = Instant::now();
                since_report = 0;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ring::RingReader;

    fn events() -> broadcast::Sender<Event> {
        broadcast::channel(16).0
    }

    fn idle_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn block_size_is_frame_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let ring = RingBuffer::create_at(&dir.path().join("ring"), 1024).unwrap();
        let producer = DmaProducer::new(
            ring,
            dir.path().join("dev"),
            100,
            idle_flag(),
            CancellationToken::new(),
            events(),
        )
        .unwrap();
        assert_eq!(producer.block_size, 96);

        let ring = RingBuffer::create_at(&dir.path().join("ring2"), 1024).unwrap();
        assert!(DmaProducer::new(
            ring,
            dir.path().join("dev"),
            31,
            idle_flag(),
            CancellationToken::new(),
            events(),
        )
        .is_err());
    }

    #[test]
    fn missing_device_is_a_device_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let ring = RingBuffer::create_at(&dir.path().join("ring"), 1024).unwrap();
        let producer = DmaProducer::new(
            ring,
            dir.path().join("no-such-device"),
            DEFAULT_BLOCK_SIZE,
            idle_flag(),
            CancellationToken::new(),
            events(),
        )
        .unwrap();
        assert!(matches!(producer.run(), Err(Error::DeviceOpen { .. })));
    }

    #[test]
    fn streams_device_bytes_into_ring_frame_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let ring_path = dir.path().join("ring");
        let device = dir.path().join("device");

        // 100 frames plus an unaligned tail that must never be
        // published.
        let mut payload: Vec<u8> = (0..100 * FRAME_SIZE).map(|i| i as u8).collect();
        let expected = payload.clone();
        payload.extend_from_slice(&[0xAA; 5]);
        std::fs::write(&device, &payload).unwrap();

        // Sized so the whole input fits without wrapping past the
        // reader; wrap behaviour is covered by the ring tests.
        let ring = RingBuffer::create_at(&ring_path, 128 * FRAME_SIZE as u64).unwrap();
        let mut reader = RingReader::new(RingBuffer::open_at(&ring_path).unwrap());
        let cancel = CancellationToken::new();
        let producer = DmaProducer::new(
            ring,
            device,
            8 * FRAME_SIZE,
            idle_flag(),
            cancel.clone(),
            events(),
        )
        .unwrap();

        let handle = std::thread::spawn(move || producer.run());

        // Drain the ring from a consumer mapping until all frames have
        // come through.
        let mut collected = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = vec![0u8; 8 * FRAME_SIZE];
        while collected.len() < expected.len() {
            assert!(Instant::now() < deadline, "timed out draining ring");
            let n = reader.read_into(&mut buf);
            if n == 0 {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        cancel.cancel();
        handle.join().unwrap().unwrap();

        assert_eq!(collected.len(), expected.len());
        assert_eq!(collected, expected);
        assert_eq!(collected.len() % FRAME_SIZE, 0);
    }

    #[test]
    fn yields_device_while_recording_flag_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let ring_path = dir.path().join("ring");
        let device = dir.path().join("device");
        std::fs::write(&device, vec![0x42u8; 16 * FRAME_SIZE]).unwrap();

        let ring = RingBuffer::create_at(&ring_path, 64 * FRAME_SIZE as u64).unwrap();
        let consumer = RingBuffer::open_at(&ring_path).unwrap();
        let recording = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let producer = DmaProducer::new(
            ring,
            device,
            4 * FRAME_SIZE,
            Arc::clone(&recording),
            cancel.clone(),
            events(),
        )
        .unwrap();

        let handle = std::thread::spawn(move || producer.run());

        // With the flag set the device is yielded: nothing may be
        // published.
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(consumer.head(), 0);

        // Clearing the flag resumes streaming.
        recording.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(5);
        while consumer.head() < 16 * FRAME_SIZE as u64 {
            assert!(Instant::now() < deadline, "producer did not resume");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(&consumer.data()[..FRAME_SIZE], &[0x42u8; FRAME_SIZE][..]);

        cancel.cancel();
        handle.join().unwrap().unwrap();
    }
}
