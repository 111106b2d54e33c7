//! File system interface used to populate pages and write them back.

use crate::error::{IoError, Result};
use crate::sync::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::cmp::min;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Serializes every file operation in the kernel.
pub static FILESYS_LOCK: Mutex<()> = Mutex::new(());

/// An open file. Implementations need not lock; callers hold [`FILESYS_LOCK`].
pub trait File: Send + Sync {
    /// Read into `buf` from `offset`. Returns the number of bytes read, which
    /// is short at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;
    /// Write `buf` at `offset`. Returns the number of bytes written.
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;
    /// Length of the file in bytes.
    fn length(&self) -> u64;
}

/// A handle shared by every page backed by the same open file.
pub type FileRef = Arc<dyn File>;

/// Read exactly `buf.len()` bytes at `offset`.
pub fn read_exact_at(file: &dyn File, buf: &mut [u8], offset: u64) -> Result<()> {
    let actual = {
        let _fs = FILESYS_LOCK.lock();
        file.read_at(buf, offset)
    };
    if actual != buf.len() {
        return Err(IoError::ShortRead {
            expected: buf.len(),
            actual,
        }
        .into());
    }
    Ok(())
}

/// Write all of `buf` at `offset`.
pub fn write_all_at(file: &dyn File, buf: &[u8], offset: u64) -> Result<()> {
    let actual = {
        let _fs = FILESYS_LOCK.lock();
        file.write_at(buf, offset)
    };
    if actual != buf.len() {
        return Err(IoError::ShortWrite {
            expected: buf.len(),
            actual,
        }
        .into());
    }
    Ok(())
}

pub fn length(file: &dyn File) -> u64 {
    let _fs = FILESYS_LOCK.lock();
    file.length()
}

/// In-memory file. Writes past the end extend it.
#[derive(Default)]
pub struct RamFile {
    data: Mutex<Vec<u8>>,
    write_count: AtomicUsize,
}

impl RamFile {
    pub fn new(contents: &[u8]) -> Self {
        Self {
            data: Mutex::new(contents.to_vec()),
            write_count: AtomicUsize::new(0),
        }
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Number of `write_at` calls so far.
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl File for RamFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= data.len() {
            return 0;
        }
        let n = min(buf.len(), data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        buf.len()
    }

    fn length(&self) -> u64 {
        self.data.lock().len() as u64
    }
}
