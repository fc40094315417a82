//! Word-addressed access to the FPGA control device.
//!
//! The control plane of the digitiser is a memory-mapped BRAM region
//! reached through the XDMA user character device. All accesses are
//! 32-bit word-aligned positional reads and writes at byte offset
//! `word × 4`, little-endian. The [`ControlPort`] trait is the seam
//! between the BRAM controller and the hardware so that the handshake
//! state machines can be driven against a mock device in tests.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Word-addressed 32-bit access to the control region.
///
/// Implementations do not need to be internally synchronised; the
/// BRAM controller serialises all accesses under its own lock.
pub trait ControlPort: Send {
    /// Reads the 32-bit word at the given word offset.
    fn read_word(&mut self, word: usize) -> Result<u32>;

    /// Writes a 32-bit word at the given word offset.
    fn write_word(&mut self, word: usize, value: u32) -> Result<()>;
}

/// The XDMA user character device, held open for the lifetime of the
/// controller.
#[derive(Debug)]
pub struct UserDevice {
    file: std::fs::File,
    path: PathBuf,
}

impl UserDevice {
    /// Opens the control device read/write.
    pub fn open(path: &Path) -> Result<UserDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::device_open(path, e))?;
        Ok(UserDevice {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl ControlPort for UserDevice {
    fn read_word(&mut self, word: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.file
            .read_exact_at(&mut buf, (word * 4) as u64)
            .map_err(|e| {
                Error::device_io(format!("read {} word {word:#x}", self.path.display()), e)
            })?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_word(&mut self, word: usize, value: u32) -> Result<()> {
        self.file
            .write_all_at(&value.to_le_bytes(), (word * 4) as u64)
            .map_err(|e| {
                Error::device_io(format!("write {} word {word:#x}", self.path.display()), e)
            })
    }
}
