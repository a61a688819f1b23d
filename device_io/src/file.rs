//! File-backed device: a loopback image or a real block device.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::debug;
use nix::fcntl::PosixFadviseAdvice;

use crate::{check_range, read_only_error, BlockDevice};

// BLKGETSIZE64 = _IOR(0x12, 114, size_t)
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

pub struct FileDevice {
    file: File,
    path: PathBuf,
    size: u64,
    read_only: bool,
}

impl FileDevice {
    /// Open a device path and determine its size (ioctl for block
    /// devices, metadata length for regular files).
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;

        let meta = file.metadata()?;
        let size = if meta.file_type().is_block_device() {
            let mut size: u64 = 0;
            unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
            size
        } else if meta.is_file() {
            meta.len()
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: not a block device or regular file", path.display()),
            ));
        };

        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}: zero-size device", path.display()),
            ));
        }

        debug!("opened {} ({} bytes, read_only={})", path.display(), size, read_only);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileDevice {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(self.size, offset, buf.len())?;
        let mut done = 0usize;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("unexpected EOF at offset {}", offset + done as u64),
                    ));
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if self.read_only {
            return Err(read_only_error());
        }
        check_range(self.size, offset, buf.len())?;
        let mut done = 0usize;
        while done < buf.len() {
            match self.file.write_at(&buf[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write at offset {}", offset + done as u64),
                    ));
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_data()
    }

    fn prefetch(&self, offset: u64, len: u64) {
        let _ = nix::fcntl::posix_fadvise(
            self.file.as_raw_fd(),
            offset as i64,
            len as i64,
            PosixFadviseAdvice::POSIX_FADV_WILLNEED,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn open_image_and_round_trip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 64 * 1024]).unwrap();
        tmp.flush().unwrap();

        let dev = FileDevice::open(tmp.path(), false).unwrap();
        assert_eq!(dev.size(), 64 * 1024);

        dev.write_at(4096, b"positioned").unwrap();
        let mut buf = [0u8; 10];
        dev.read_at(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"positioned");
        dev.sync().unwrap();
    }

    #[test]
    fn read_only_device_rejects_writes() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 4096]).unwrap();
        tmp.flush().unwrap();

        let dev = FileDevice::open(tmp.path(), true).unwrap();
        assert!(dev.write_at(0, b"x").is_err());
    }
}
