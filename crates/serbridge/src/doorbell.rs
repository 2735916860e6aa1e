//! Socketpair doorbell for worker → foreground wakeup.
//!
//! The worker thread rings, the foreground task awaits. Each doorbell is one
//! Unix socketpair: the foreground end is wrapped in tokio's `AsyncFd` so a
//! wait parks the task on epoll/kqueue instead of spinning, and the worker end
//! is a plain non-blocking fd that can be rung from any thread.
//!
//! ```ignore
//! let (bell, ringer) = Doorbell::create_pair()?;
//!
//! // worker thread
//! ringer.signal();
//!
//! // foreground task
//! bell.wait().await?;
//! ```
//!
//! Signals coalesce: ringing a bell that has not been waited on yet leaves
//! bytes queued in the socket, so a ring that lands between a check and the
//! following wait is never lost.

use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

/// Foreground (waiting) end of a doorbell.
pub struct Doorbell {
    async_fd: AsyncFd<OwnedFd>,
}

impl std::fmt::Debug for Doorbell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doorbell").field("fd", &self.as_raw_fd()).finish()
    }
}

/// Worker (ringing) end of a doorbell.
#[derive(Debug)]
pub struct DoorbellRinger {
    fd: OwnedFd,
}

enum DrainOutcome {
    Signalled,
    Empty,
    Closed,
}

impl Doorbell {
    /// Create a connected pair.
    ///
    /// Must be called inside a tokio runtime with the IO driver enabled.
    pub fn create_pair() -> io::Result<(Doorbell, DoorbellRinger)> {
        let (wait_fd, ring_fd) = create_socketpair()?;

        for fd in [&wait_fd, &ring_fd] {
            set_nonblocking(fd.as_raw_fd())?;
            set_cloexec(fd.as_raw_fd())?;
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        set_nosigpipe(ring_fd.as_raw_fd())?;

        let async_fd = AsyncFd::with_interest(wait_fd, Interest::READABLE)?;
        Ok((Doorbell { async_fd }, DoorbellRinger { fd: ring_fd }))
    }

    /// Wait until the ringer signals.
    ///
    /// Consumes every queued signal. Returns `BrokenPipe` once the ringer has
    /// been dropped and nothing is left to consume.
    pub async fn wait(&self) -> io::Result<()> {
        loop {
            let mut guard = self.async_fd.ready(Interest::READABLE).await?;

            match self.try_drain() {
                DrainOutcome::Signalled => return Ok(()),
                DrainOutcome::Closed => return Err(ringer_dropped()),
                DrainOutcome::Empty => guard.clear_ready(),
            }
        }
    }

    /// Discard pending signals without waiting.
    ///
    /// Returns `BrokenPipe` if the ringer is gone and nothing was pending.
    pub fn drain(&self) -> io::Result<()> {
        match self.try_drain() {
            DrainOutcome::Closed => Err(ringer_dropped()),
            DrainOutcome::Signalled | DrainOutcome::Empty => Ok(()),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.async_fd.get_ref().as_raw_fd()
    }

    fn try_drain(&self) -> DrainOutcome {
        let fd = self.as_raw_fd();
        let mut buf = [0u8; 64];
        let mut outcome = DrainOutcome::Empty;

        loop {
            // SAFETY: fd is open for the lifetime of self, buf is valid
            let ret = unsafe {
                libc::recv(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };

            if ret > 0 {
                outcome = DrainOutcome::Signalled;
            } else if ret == 0 {
                if matches!(outcome, DrainOutcome::Empty) {
                    outcome = DrainOutcome::Closed;
                }
                break;
            } else {
                let err = io::Error::last_os_error();
                match err.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    _ => {
                        tracing::warn!("doorbell drain failed: {}", err);
                        break;
                    }
                }
            }
        }

        outcome
    }
}

impl DoorbellRinger {
    /// Wake the waiting side.
    ///
    /// A full socket buffer means a wakeup is already pending, and a closed
    /// peer means nobody is listening; both are ignored.
    pub fn signal(&self) {
        let buf = [1u8];

        // SAFETY: fd is open for the lifetime of self, buf is valid
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                SEND_FLAGS,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                ErrorKind::WouldBlock | ErrorKind::BrokenPipe => {}
                _ => tracing::warn!("doorbell signal failed: {}", err),
            }
        }
    }
}

fn ringer_dropped() -> io::Error {
    io::Error::new(ErrorKind::BrokenPipe, "doorbell ringer dropped")
}

/// Unix stream socketpair. A stream (rather than datagram) pair reports the
/// ringer being dropped as end-of-file on the waiting side.
fn create_socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];

    let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: socketpair succeeded, both fds are open and owned by us
    let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((a, b))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn set_nosigpipe(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
