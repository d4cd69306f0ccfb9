//! Linux i2c-dev transport.
//!
//! Opens `/dev/i2c-N` read/write, selects the slave with the `I2C_SLAVE`
//! ioctl and moves bytes with plain `read(2)` / `write(2)`, so the counts the
//! kernel reports reach the caller unchanged.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::I2cBus;

/// `I2C_SLAVE` request from `<linux/i2c-dev.h>`.
const I2C_SLAVE: libc::c_ulong = 0x0703;

/// An open i2c-dev character device.
#[derive(Debug)]
pub struct I2cDevBus {
    path: PathBuf,
    file: Option<File>,
}

impl I2cDevBus {
    /// Open the bus device at `path`.
    ///
    /// # Errors
    /// Returns the OS error if the device node cannot be opened read/write.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = Self::open_file(&path)?;
        info!(path = %path.display(), "Opened I2C bus");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Path of the device node.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(path: &Path) -> io::Result<File> {
        OpenOptions::new().read(true).write(true).open(path)
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "I2C bus handle is closed"))
    }
}

impl I2cBus for I2cDevBus {
    #[allow(unsafe_code)]
    fn set_address(&mut self, address: u8) -> io::Result<()> {
        let fd = self.file()?.as_raw_fd();
        // SAFETY: `fd` belongs to a file we own for the duration of the call and
        // I2C_SLAVE takes its argument by value.
        let rc = unsafe { libc::ioctl(fd, I2C_SLAVE as _, libc::c_ulong::from(address)) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.file()?.write(bytes)
    }

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buffer)
    }

    fn reopen(&mut self) -> io::Result<()> {
        self.file = None;
        let file = Self::open_file(&self.path)?;
        self.file = Some(file);
        debug!(path = %self.path.display(), "Reopened I2C bus");
        Ok(())
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            info!(path = %self.path.display(), "Closed I2C bus");
        }
    }
}
