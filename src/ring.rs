//! Shared-memory ring buffer for the DMA sample stream.
//!
//! A ring is a named region under `/dev/shm` consisting of a small
//! header followed by a power-of-two-friendly payload. A single
//! producer reads DMA data directly into the payload and publishes a
//! monotone byte offset ("head") with release ordering; any number of
//! readers map the same region and copy data out at their own pace,
//! reconciling wrap-around with modular arithmetic. The producer never
//! blocks on readers, so a stalled reader may observe overwrite.

use crate::error::{Error, Result};
use crate::frame::FRAME_SIZE;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic token identifying a ring buffer region ("QCAPTURE").
pub const MAGIC: u64 = 0x5143_4150_5455_5245;

/// Ring buffer format version.
pub const VERSION: u32 = 1;

/// Size in bytes of the ring header at the start of the mapping.
pub const HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();

/// Ring header, at the very beginning of the shared mapping.
///
/// All fields are little-endian in memory. Only the producer writes
/// `head`; `tail` is an advisory reader offset that the producer never
/// checks.
#[repr(C)]
pub struct RingHeader {
    magic: u64,
    size: u64,
    head: AtomicU64,
    tail: AtomicU64,
    version: u32,
    channels: u32,
}

/// Shared-memory ring buffer mapping.
///
/// Producers obtain a mutable mapping with [`RingBuffer::create`] or
/// [`RingBuffer::open`]; consumers open their own mapping of the same
/// object and wrap it in a [`RingReader`].
#[derive(Debug)]
pub struct RingBuffer {
    _file: std::fs::File,
    map: *mut u8,
    map_len: usize,
    payload: usize,
}

// The raw mapping pointer is valid for the lifetime of the struct and
// all header mutation goes through atomics.
unsafe impl Send for RingBuffer {}

/// The backing path of a named ring buffer under `/dev/shm`.
pub fn shm_path(name: &str) -> PathBuf {
    Path::new("/dev/shm").join(name.trim_start_matches('/'))
}

fn mmap(file: &std::fs::File, len: usize) -> Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut::<libc::c_void>(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::device_io(
            "mmap ring buffer",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(ptr as *mut u8)
}

impl RingBuffer {
    /// Creates and maps a new named ring buffer under `/dev/shm`.
    ///
    /// The region is sized to `HEADER_SIZE + payload_bytes` and the
    /// header is initialised with zeroed head and tail. Fails with
    /// [`Error::AlreadyExists`] if the named object exists; callers
    /// wanting fresh semantics must [`remove`](RingBuffer::remove)
    /// first. `payload_bytes` must be a nonzero multiple of the frame
    /// size.
    pub fn create(name: &str, payload_bytes: u64) -> Result<RingBuffer> {
        Self::create_at(&shm_path(name), payload_bytes).map_err(|e| match e {
            Error::AlreadyExists { .. } => Error::AlreadyExists {
                name: name.to_string(),
            },
            other => other,
        })
    }

    /// Creates a ring buffer backed by an arbitrary filesystem path.
    pub fn create_at(path: &Path, payload_bytes: u64) -> Result<RingBuffer> {
        if payload_bytes == 0 || payload_bytes % FRAME_SIZE as u64 != 0 {
            return Err(Error::invalid_argument(format!(
                "ring payload size {payload_bytes} is not a multiple of {FRAME_SIZE}"
            )));
        }
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists {
                    name: path.display().to_string(),
                })
            }
            Err(e) => return Err(Error::device_open(path, e)),
        };
        let total = HEADER_SIZE as u64 + payload_bytes;
        file.set_len(total)
            .map_err(|e| Error::device_io("ftruncate ring buffer", e))?;
        let map = mmap(&file, total as usize)?;
        let ring = RingBuffer {
            _file: file,
            map,
            map_len: total as usize,
            payload: payload_bytes as usize,
        };
        // Plain field writes are fine here: nobody else can observe the
        // mapping until create() returns.
        unsafe {
            let h = ring.map as *mut RingHeader;
            (*h).magic = MAGIC;
            (*h).size = payload_bytes;
            (*h).version = VERSION;
            (*h).channels = crate::frame::NUM_CHANNELS as u32;
        }
        ring.header().head.store(0, Ordering::Release);
        ring.header().tail.store(0, Ordering::Release);
        Ok(ring)
    }

    /// Maps an existing named ring buffer and validates its magic.
    pub fn open(name: &str) -> Result<RingBuffer> {
        Self::open_at(&shm_path(name))
    }

    /// Maps a ring buffer backed by an arbitrary filesystem path.
    pub fn open_at(path: &Path) -> Result<RingBuffer> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::device_open(path, e))?;
        let total = file
            .metadata()
            .map_err(|e| Error::device_io("fstat ring buffer", e))?
            .len() as usize;
        if total < HEADER_SIZE {
            return Err(Error::InvalidFormat { found: 0 });
        }
        let map = mmap(&file, total)?;
        let ring = RingBuffer {
            _file: file,
            map,
            map_len: total,
            payload: total - HEADER_SIZE,
        };
        let magic = unsafe { (*(ring.map as *const RingHeader)).magic };
        if magic != MAGIC {
            return Err(Error::InvalidFormat { found: magic });
        }
        Ok(ring)
    }

    /// Removes a named ring buffer object. Missing objects are not an
    /// error.
    pub fn remove(name: &str) -> Result<()> {
        match std::fs::remove_file(shm_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::device_io("unlink ring buffer", e)),
        }
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.map as *const RingHeader) }
    }

    /// Size of the payload region in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload
    }

    /// A view of the payload region (excluding the header).
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.map.add(HEADER_SIZE), self.payload) }
    }

    /// Mutable access to a contiguous payload region, for the producer
    /// to read device data into without an intermediate copy.
    ///
    /// The range must not extend past the end of the payload; the
    /// producer limits each read to `payload_size() - head` so that a
    /// chunk never wraps.
    pub fn chunk_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.payload, "chunk outside ring payload");
        unsafe { std::slice::from_raw_parts_mut(self.map.add(HEADER_SIZE + offset), len) }
    }

    /// Current producer offset, loaded with acquire ordering so that
    /// payload bytes written before the matching
    /// [`advance_head`](RingBuffer::advance_head) are visible.
    pub fn head(&self) -> u64 {
        self.header().head.load(Ordering::Acquire)
    }

    /// Advances the producer offset by `delta` modulo the payload
    /// size, publishing with release ordering.
    ///
    /// `delta` must be a multiple of the frame size; this is the
    /// producer's contract and is only debug-asserted here.
    pub fn advance_head(&self, delta: u64) {
        debug_assert_eq!(delta % FRAME_SIZE as u64, 0);
        let header = self.header();
        let head = header.head.load(Ordering::Relaxed);
        header
            .head
            .store((head + delta) % self.payload as u64, Ordering::Release);
    }

    /// Advisory reader offset. The producer never checks it.
    pub fn tail(&self) -> u64 {
        self.header().tail.load(Ordering::Acquire)
    }

    /// Publishes an advisory reader offset, modulo the payload size.
    pub fn set_tail(&self, tail: u64) {
        self.header()
            .tail
            .store(tail % self.payload as u64, Ordering::Release);
    }

    /// Copies `data` into the payload at the current head, handling
    /// wrap-around, and advances the head by its length.
    ///
    /// This is the copying producer path used by tests and tools; the
    /// DMA producer reads into [`chunk_mut`](RingBuffer::chunk_mut)
    /// directly instead. `data` must not exceed the payload size and
    /// should be a whole number of frames.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.payload {
            return Err(Error::invalid_argument(
                "write larger than ring payload".to_string(),
            ));
        }
        let head = self.head() as usize;
        let first = (self.payload - head).min(data.len());
        self.chunk_mut(head, first).copy_from_slice(&data[..first]);
        if first < data.len() {
            let rest = data.len() - first;
            self.chunk_mut(0, rest).copy_from_slice(&data[first..]);
        }
        self.advance_head(data.len() as u64);
        Ok(())
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, self.map_len);
        }
    }
}

/// Per-consumer cursor over a ring buffer.
///
/// Each reader holds its own mapping and byte offset and reconciles
/// against the producer head with modular subtraction. There is no
/// reader-side locking; a reader that falls more than one payload
/// behind the producer observes overwritten data.
#[derive(Debug)]
pub struct RingReader {
    ring: RingBuffer,
    cursor: u64,
}

impl RingReader {
    /// Wraps a ring mapping, starting at the producer's current head.
    pub fn new(ring: RingBuffer) -> RingReader {
        let cursor = ring.head();
        RingReader { ring, cursor }
    }

    /// Bytes published by the producer that this reader has not yet
    /// consumed.
    pub fn available(&self) -> u64 {
        let n = self.ring.payload_size() as u64;
        let head = self.ring.head();
        (head + n - self.cursor) % n
    }

    /// Copies up to `buf.len()` available bytes into `buf`, advancing
    /// this reader's cursor and the advisory tail. Returns the number
    /// of bytes copied, which is zero when the producer has not
    /// advanced.
    pub fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let n = self.ring.payload_size() as u64;
        let mut to_read = self.available().min(buf.len() as u64);
        let total = to_read as usize;
        let mut written = 0;
        let data = self.ring.data();
        while to_read > 0 {
            let chunk = to_read.min(n - self.cursor) as usize;
            let start = self.cursor as usize;
            buf[written..written + chunk].copy_from_slice(&data[start..start + chunk]);
            self.cursor = (self.cursor + chunk as u64) % n;
            written += chunk;
            to_read -= chunk as u64;
        }
        self.ring.set_tail(self.cursor);
        total
    }
}
