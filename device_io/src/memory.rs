//! In-memory device used by tests.

use std::io;
use std::sync::Mutex;

use crate::{check_range, read_only_error, BlockDevice};

pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    read_only: bool,
}

impl MemDevice {
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; size]),
            read_only: false,
        }
    }

    /// Wrap an existing image so tests can pre-seed device contents.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            read_only: false,
        }
    }

    pub fn read_only_from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            read_only: true,
        }
    }

    /// Snapshot of the whole image.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl BlockDevice for MemDevice {
    fn size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.lock().unwrap();
        check_range(data.len() as u64, offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if self.read_only {
            return Err(read_only_error());
        }
        let mut data = self.data.lock().unwrap();
        check_range(data.len() as u64, offset, buf.len())?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dev = MemDevice::new(8192);
        dev.write_at(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        dev.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
