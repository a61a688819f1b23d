//! Positioned I/O over a disk image file or block device.
//!
//! Every operation is offset-addressed; there is no shared cursor, so a
//! device handle can be used from several threads at once. All reads and
//! writes are bounds-checked against the device size before any syscall.

use std::io;

pub mod file;
pub mod memory;

pub use file::FileDevice;
pub use memory::MemDevice;

/// Abstract positioned-I/O device.
pub trait BlockDevice: Send + Sync {
    /// Device size in bytes, fixed at open time.
    fn size(&self) -> u64;

    /// True when the device was opened read-only (dry runs).
    fn read_only(&self) -> bool;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write all of `buf` starting at `offset`. Rejected on read-only
    /// devices.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Flush written data to stable storage.
    fn sync(&self) -> io::Result<()>;

    /// Advisory readahead hint. Default is a no-op.
    fn prefetch(&self, _offset: u64, _len: u64) {}
}

/// Reject any access that would run past the end of the device.
pub(crate) fn check_range(dev_size: u64, offset: u64, len: usize) -> io::Result<()> {
    let len = len as u64;
    if len > dev_size || offset > dev_size - len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "access beyond device end: offset={} len={} dev_size={}",
                offset, len, dev_size
            ),
        ));
    }
    Ok(())
}

pub(crate) fn read_only_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        "cannot write: device opened read-only",
    )
}

/// A queue of pending writes submitted as one unit.
///
/// The synchronous submitter below is the reference behavior; an async
/// submitter must produce byte-identical device contents.
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<(u64, Vec<u8>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one write. The batch takes ownership of the buffer.
    pub fn queue(&mut self, offset: u64, data: Vec<u8>) {
        self.ops.push((offset, data));
    }

    pub fn pending(&self) -> usize {
        self.ops.len()
    }

    /// Submit every queued write in order, then clear the queue.
    pub fn submit(&mut self, dev: &dyn BlockDevice) -> io::Result<()> {
        for (offset, data) in self.ops.drain(..) {
            dev.write_at(offset, &data)?;
        }
        Ok(())
    }
}

/// A queue of pending reads submitted as one unit.
#[derive(Default)]
pub struct ReadBatch {
    ops: Vec<(u64, usize)>,
}

impl ReadBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, offset: u64, len: usize) {
        self.ops.push((offset, len));
    }

    /// Submit every queued read in order; buffers come back in queue
    /// order. The queue is cleared afterwards.
    pub fn submit(&mut self, dev: &dyn BlockDevice) -> io::Result<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(self.ops.len());
        for (offset, len) in self.ops.drain(..) {
            let mut buf = vec![0u8; len];
            dev.read_at(offset, &mut buf)?;
            out.push(buf);
        }
        Ok(out)
    }
}
