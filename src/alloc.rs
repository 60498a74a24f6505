//! Pipe and PTY allocation
//!
//! Thin wrappers over pipe2(2) and posix_openpt(3). Every descriptor handed
//! out here is close-on-exec and numbered above the standard slots, so a
//! child-side `dup2` onto 0/1/2 never targets its own source.
//!
//! Reference: https://www.man7.org/linux/man-pages/man3/posix_openpt.3.html

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::unistd::pipe2;

use crate::error::{Error, Result};

/// Lowest descriptor number handed out by the allocators
const FIRST_FREE_FD: RawFd = libc::STDERR_FILENO + 1;

/// Duplicate `fd` close-on-exec onto the lowest free number above stderr
pub(crate) fn dup_cloexec(fd: RawFd) -> nix::Result<OwnedFd> {
    let raw = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(FIRST_FREE_FD))?;
    // SAFETY: fcntl just returned a fresh descriptor that nothing else owns
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Move a descriptor out of the 0..=2 range if it landed there
///
/// This happens when the parent runs with one of its own standard streams
/// closed: the kernel hands out the lowest free number.
pub(crate) fn lift_above_stdio(fd: OwnedFd) -> nix::Result<OwnedFd> {
    if fd.as_raw_fd() >= FIRST_FREE_FD {
        return Ok(fd);
    }
    dup_cloexec(fd.as_raw_fd())
}

/// An anonymous pipe
#[derive(Debug)]
pub struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl Pipe {
    /// Create a new close-on-exec pipe
    pub fn new() -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(Error::allocation("pipe"))?;
        let read = lift_above_stdio(read).map_err(Error::allocation("pipe"))?;
        let write = lift_above_stdio(write).map_err(Error::allocation("pipe"))?;
        tracing::trace!(read = read.as_raw_fd(), write = write.as_raw_fd(), "allocated pipe");
        Ok(Self { read, write })
    }
}

/// Terminal dimensions applied to a PTY master
///
/// Used as the initial size of a spawn's PTY (`SpawnRequest::pty_size`, the
/// `pty_size` config field, `--pty-size COLSxROWS`) and for later resizes.
/// Pixel dimensions default to zero, which most programs ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    #[serde(default)]
    pub pixel_width: u16,
    #[serde(default)]
    pub pixel_height: u16,
}

impl WindowSize {
    /// A size in character cells, columns first
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    pub(crate) fn to_winsize(self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

impl std::str::FromStr for WindowSize {
    type Err = Error;

    /// Parse `COLSxROWS`, e.g. `132x43`
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            Error::InvalidArgument(format!("invalid window size '{}' (expected COLSxROWS)", s))
        };
        let (cols, rows) = s.split_once(['x', 'X']).ok_or_else(invalid)?;
        let cols: u16 = cols.trim().parse().map_err(|_| invalid())?;
        let rows: u16 = rows.trim().parse().map_err(|_| invalid())?;
        if cols == 0 || rows == 0 {
            return Err(invalid());
        }
        Ok(Self::new(cols, rows))
    }
}

/// A pseudoterminal master plus the path of its slave
///
/// The slave is never opened in the parent; the child opens it by path
/// after it has become a session leader.
#[derive(Debug)]
pub struct Pty {
    master: OwnedFd,
    slave_path: String,
}

impl Pty {
    /// Open a new PTY master, grant and unlock its slave
    pub fn open() -> Result<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
            .map_err(Error::allocation("pty master"))?;
        grantpt(&master).map_err(Error::allocation("pty (grantpt)"))?;
        unlockpt(&master).map_err(Error::allocation("pty (unlockpt)"))?;
        let slave_path = slave_name(&master).map_err(Error::allocation("pty slave name"))?;

        // SAFETY: into_raw_fd hands over sole ownership of the master
        let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
        let master = lift_above_stdio(master).map_err(Error::allocation("pty master"))?;

        tracing::debug!(master = master.as_raw_fd(), slave = %slave_path, "allocated pty");
        Ok(Self { master, slave_path })
    }

    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// A fresh close-on-exec handle on the master for one stream wrapper
    pub fn duplicate_master(&self) -> Result<File> {
        let fd = dup_cloexec(self.master.as_raw_fd()).map_err(Error::allocation("pty master"))?;
        Ok(File::from(fd))
    }

    pub fn set_window_size(&self, size: WindowSize) -> Result<()> {
        let ws = size.to_winsize();
        // SAFETY: TIOCSWINSZ reads a winsize struct that outlives the call
        let result = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ as _, &ws) };
        if result == -1 {
            Err(io::Error::last_os_error().into())
        } else {
            Ok(())
        }
    }

    pub fn get_window_size(&self) -> Result<WindowSize> {
        // SAFETY: winsize is plain old data
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        // SAFETY: TIOCGWINSZ writes into the winsize struct we own
        let result =
            unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCGWINSZ as _, &mut ws) };
        if result == -1 {
            Err(io::Error::last_os_error().into())
        } else {
            Ok(WindowSize::from(ws))
        }
    }
}

#[cfg(target_os = "linux")]
fn slave_name(master: &PtyMaster) -> nix::Result<String> {
    nix::pty::ptsname_r(master)
}

#[cfg(not(target_os = "linux"))]
fn slave_name(master: &PtyMaster) -> nix::Result<String> {
    // SAFETY: ptsname uses a static buffer; the name is copied out before
    // returning and allocation is serialized by the caller owning the request
    unsafe { nix::pty::ptsname(master) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_cloexec(fd: RawFd) -> bool {
        let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
        flags & libc::FD_CLOEXEC != 0
    }

    #[test]
    fn test_pipe_is_cloexec_and_above_stdio() {
        let pipe = Pipe::new().unwrap();
        assert!(pipe.read.as_raw_fd() > 2);
        assert!(pipe.write.as_raw_fd() > 2);
        assert!(is_cloexec(pipe.read.as_raw_fd()));
        assert!(is_cloexec(pipe.write.as_raw_fd()));
    }

    #[test]
    fn test_pipe_carries_bytes() {
        use std::io::{Read, Write};

        let pipe = Pipe::new().unwrap();
        let mut writer = File::from(pipe.write);
        let mut reader = File::from(pipe.read);
        writer.write_all(b"ping").unwrap();
        drop(writer);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ping");
    }

    #[test]
    fn test_pty_creation() {
        let pty = Pty::open().unwrap();
        assert!(!pty.slave_path().is_empty());
        #[cfg(target_os = "linux")]
        assert!(pty.slave_path().starts_with("/dev/pts/"));
        assert!(is_cloexec(pty.master_fd()));
    }

    #[test]
    fn test_pty_window_size() {
        let pty = Pty::open().unwrap();
        pty.set_window_size(WindowSize::new(120, 40)).unwrap();
        let retrieved = pty.get_window_size().unwrap();
        assert_eq!(retrieved.cols, 120);
        assert_eq!(retrieved.rows, 40);
    }

    #[test]
    fn test_duplicate_master_is_distinct() {
        let pty = Pty::open().unwrap();
        let dup = pty.duplicate_master().unwrap();
        assert_ne!(dup.as_raw_fd(), pty.master_fd());
        assert!(is_cloexec(dup.as_raw_fd()));
    }

    #[test]
    fn test_window_size_default() {
        let ws = WindowSize::default().to_winsize();
        assert_eq!((ws.ws_col, ws.ws_row), (80, 24));
    }

    #[test]
    fn test_window_size_parse() {
        assert_eq!("132x43".parse::<WindowSize>().unwrap(), WindowSize::new(132, 43));
        assert_eq!("80X24".parse::<WindowSize>().unwrap(), WindowSize::default());
        for bad in ["", "80", "x24", "0x24", "80x", "80x-1", "99999x10"] {
            assert!(bad.parse::<WindowSize>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_window_size_config_form() {
        let size: WindowSize = serde_json::from_str(r#"{"rows": 30, "cols": 100}"#).unwrap();
        assert_eq!(size, WindowSize::new(100, 30));
    }
}
