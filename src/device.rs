use std::fs::OpenOptions;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::warn;

use crate::error::{FatxError, Result};

/// Backing store for a device: a real file/block device or an in-memory
/// image (tests, scripted fixtures).
pub trait Storage: Read + Write + Seek + Send {}
impl<T: Read + Write + Seek + Send> Storage for T {}

/// Byte-addressable random access over the opened input.
///
/// All I/O serializes on the internal mutex. When the device is opened
/// read-only (or in test mode) writes report success without touching
/// storage and without setting `modified`.
pub struct Device {
    io: Mutex<Box<dyn Storage>>,
    tot_size: u64,
    writable: bool,
    changes: AtomicBool,
}

impl Device {
    /// Open a path for read, or read+write when the mode permits it, and
    /// take an advisory whole-file lock where the platform supports one.
    pub fn open(path: &Path, writable: bool) -> Result<Device> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        let tot_size = file.metadata()?.len();

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let op = if writable { libc::LOCK_EX } else { libc::LOCK_SH } | libc::LOCK_NB;
            if unsafe { libc::flock(file.as_raw_fd(), op) } != 0 {
                warn!("could not take advisory lock on {}", path.display());
            }
        }

        Ok(Device {
            io: Mutex::new(Box::new(file)),
            tot_size,
            writable,
            changes: AtomicBool::new(false),
        })
    }

    /// Wrap an in-memory image. The image size is fixed at creation.
    pub fn from_memory(image: Vec<u8>, writable: bool) -> Device {
        Device {
            tot_size: image.len() as u64,
            io: Mutex::new(Box::new(Cursor::new(image))),
            writable,
            changes: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> u64 {
        self.tot_size
    }

    pub fn modified(&self) -> bool {
        self.changes.load(Ordering::Relaxed)
    }

    /// Read `size` bytes at `offset`. Faults are reported once and yield
    /// an empty buffer; callers treat that as the zero value.
    pub fn read(&self, offset: u64, size: usize) -> Vec<u8> {
        if size == 0 {
            return Vec::new();
        }
        if self.tot_size != 0 && offset + size as u64 > self.tot_size {
            warn!(
                "blocks out of bounds ([0x{offset:016X} ; 0x{:016X}] > 0x{:016X})",
                offset + size as u64 - 1,
                self.tot_size
            );
            return Vec::new();
        }
        let mut io = self.io.lock().unwrap();
        if let Err(e) = io.seek(SeekFrom::Start(offset)) {
            warn!("unreachable block at 0x{offset:016X}: {e}");
            return Vec::new();
        }
        let mut buf = vec![0u8; size];
        match io.read_exact(&mut buf) {
            Ok(()) => buf,
            Err(e) => {
                warn!("unreadable block at 0x{offset:016X}: {e}");
                Vec::new()
            }
        }
    }

    /// Write `data` at `offset`. Read-only devices report success without
    /// touching storage.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if offset + data.len() as u64 > self.tot_size {
            warn!(
                "blocks out of bounds ([0x{offset:016X} ; 0x{:016X}] > 0x{:016X})",
                offset + data.len() as u64 - 1,
                self.tot_size
            );
            return Err(FatxError::OutOfBounds {
                kind: "write offset",
                value: offset,
            });
        }
        if !self.writable {
            return Ok(());
        }
        let mut io = self.io.lock().unwrap();
        io.seek(SeekFrom::Start(offset))
            .map_err(|_| FatxError::DeviceUnreachable(offset))?;
        io.write_all(data).map_err(|_| FatxError::DeviceShort {
            offset,
            size: data.len(),
        })?;
        self.changes.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Hand back the in-memory image for inspection. Panics when the
    /// device is file-backed; test helper only.
    pub fn into_image(self) -> Vec<u8> {
        let mut io = self.io.into_inner().unwrap();
        let mut out = Vec::with_capacity(self.tot_size as usize);
        io.seek(SeekFrom::Start(0)).expect("seek in-memory image");
        io.read_to_end(&mut out).expect("read in-memory image");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_read_write() {
        let dev = Device::from_memory(vec![0u8; 4096], true);
        dev.write(100, b"hello").unwrap();
        assert_eq!(dev.read(100, 5), b"hello");
        assert!(dev.modified());
    }

    #[test]
    fn test_out_of_bounds_read_is_empty() {
        let dev = Device::from_memory(vec![0u8; 128], true);
        assert!(dev.read(120, 32).is_empty());
    }

    #[test]
    fn test_readonly_write_is_silent_success() {
        let dev = Device::from_memory(vec![1u8; 128], false);
        dev.write(0, b"xy").unwrap();
        assert!(!dev.modified());
        assert_eq!(dev.read(0, 2), vec![1, 1]);
    }

    #[test]
    fn test_out_of_bounds_write_fails() {
        let dev = Device::from_memory(vec![0u8; 64], true);
        assert!(dev.write(60, b"123456").is_err());
        assert!(!dev.modified());
    }
}
