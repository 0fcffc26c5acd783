//! Nonblocking serial device node.
//!
//! The node is opened with `O_NONBLOCK` and driven through the reactor
//! with [`AsyncFd`], so a read waiting on a quiet bus never holds up a
//! write. When the node is a terminal it is switched to raw 8N1 at the
//! configured baud rate; anything else (a FIFO, a pty used in tests) is
//! used as is.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

fn speed(baud_rate: u32) -> Option<libc::speed_t> {
    match baud_rate {
        9_600 => Some(libc::B9600),
        19_200 => Some(libc::B19200),
        38_400 => Some(libc::B38400),
        57_600 => Some(libc::B57600),
        115_200 => Some(libc::B115200),
        _ => None,
    }
}

/// An open serial device.
#[derive(Debug)]
pub struct SerialDevice {
    inner: AsyncFd<File>,
}

impl SerialDevice {
    /// Opens `path` for reading and writing without blocking.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(path: &Path, baud_rate: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY)
            .open(path)?;
        if is_terminal(&file) {
            configure_line(&file, baud_rate)?;
        }
        Ok(Self {
            inner: AsyncFd::new(file)?,
        })
    }
}

fn is_terminal(file: &File) -> bool {
    // SAFETY: the descriptor is owned by `file` and open for this call.
    unsafe { libc::isatty(file.as_raw_fd()) == 1 }
}

/// Raw mode, 8 data bits, no parity, one stop bit, no flow control.
fn configure_line(file: &File, baud_rate: u32) -> io::Result<()> {
    let speed = speed(baud_rate).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported baud rate {baud_rate}"),
        )
    })?;
    let fd = file.as_raw_fd();

    // SAFETY: `fd` stays open for the whole block; `termios` is plain data
    // that tcgetattr fully initialises before it is read.
    unsafe {
        let mut tio: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        libc::cfmakeraw(&mut tio);
        tio.c_cflag |= libc::CLOCAL | libc::CREAD;
        tio.c_cflag &= !(libc::CSTOPB | libc::PARENB | libc::CRTSCTS);
        if libc::cfsetispeed(&mut tio, speed) != 0 || libc::cfsetospeed(&mut tio, speed) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl AsyncRead for SerialDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SerialDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
