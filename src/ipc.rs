/// Control channel between a parent and its cloned child
///
/// A `SOCK_SEQPACKET` socketpair: message boundaries are preserved, so every
/// read returns exactly one request, response or handshake flag.
use crate::types::{LxceError, Result};

use nix::errno::Errno;
use nix::sys::socket::{recv, MsgFlags};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Size of the int-sized handshake and status messages
pub const INT_MSG_SIZE: usize = mem::size_of::<libc::c_int>();

/// One end of a control socketpair
#[derive(Debug)]
pub struct ControlChannel {
    fd: OwnedFd,
}

impl ControlChannel {
    /// Create a connected pair, returns (parent end, child end)
    ///
    /// Both ends are close-on-exec. An app learns nothing from its child end
    /// other than exec failures, so a successful exec shows up as EOF.
    pub fn pair() -> Result<(Self, Self)> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_LOCAL,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if ret != 0 {
            return Err(LxceError::Process(format!(
                "Failed to create socketpair: {}",
                std::io::Error::last_os_error()
            )));
        }

        let parent = ControlChannel {
            fd: unsafe { OwnedFd::from_raw_fd(fds[0]) },
        };
        let child = ControlChannel {
            fd: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        };

        Ok((parent, child))
    }

    /// Bound every blocking receive on this channel
    pub fn set_recv_timeout(&self, timeout: Duration) -> Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(LxceError::Process(format!(
                "Failed to set receive timeout: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Send a boolean as a native int
    pub fn send_flag(&self, value: bool) -> Result<()> {
        self.send_int(value as libc::c_int)
    }

    /// Receive a boolean sent with `send_flag`
    pub fn recv_flag(&self) -> Result<bool> {
        match self.recv_int()? {
            Some(v) => Ok(v != 0),
            None => Err(LxceError::ProtocolMismatch {
                expected: INT_MSG_SIZE,
                got: 0,
            }),
        }
    }

    pub fn send_int(&self, value: libc::c_int) -> Result<()> {
        let bytes = value.to_ne_bytes();
        let written = nix::unistd::write(self.fd.as_raw_fd(), &bytes)
            .map_err(|e| LxceError::Io(std::io::Error::from(e)))?;
        if written != INT_MSG_SIZE {
            return Err(LxceError::ProtocolMismatch {
                expected: INT_MSG_SIZE,
                got: written,
            });
        }
        Ok(())
    }

    /// Receive an int, `None` when the peer closed its end
    pub fn recv_int(&self) -> Result<Option<libc::c_int>> {
        let mut bytes = [0u8; INT_MSG_SIZE];
        loop {
            match nix::unistd::read(self.fd.as_raw_fd(), &mut bytes) {
                Ok(0) => return Ok(None),
                Ok(n) if n == INT_MSG_SIZE => return Ok(Some(libc::c_int::from_ne_bytes(bytes))),
                Ok(n) => {
                    return Err(LxceError::ProtocolMismatch {
                        expected: INT_MSG_SIZE,
                        got: n,
                    })
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Err(LxceError::ReadTimeout),
                Err(e) => return Err(LxceError::ReadError(e.to_string())),
            }
        }
    }

    /// Send one datagram
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let written = nix::unistd::write(self.fd.as_raw_fd(), data)
            .map_err(|e| LxceError::Io(std::io::Error::from(e)))?;
        if written != data.len() {
            return Err(LxceError::ProtocolMismatch {
                expected: data.len(),
                got: written,
            });
        }
        Ok(())
    }

    /// Blocking receive of one datagram, honouring the receive timeout
    ///
    /// Returns `Ok(None)` when the timeout expired. A closed peer is a read error.
    pub fn recv(&self, buffer: &mut [u8]) -> Result<Option<usize>> {
        self.recv_with(buffer, MsgFlags::empty())
    }

    /// Non-blocking receive of one datagram
    pub fn try_recv(&self, buffer: &mut [u8]) -> Result<Option<usize>> {
        self.recv_with(buffer, MsgFlags::MSG_DONTWAIT)
    }

    fn recv_with(&self, buffer: &mut [u8], flags: MsgFlags) -> Result<Option<usize>> {
        match recv(self.fd.as_raw_fd(), buffer, flags) {
            Ok(0) => Err(LxceError::ReadError("peer closed the channel".to_string())),
            Ok(n) => Ok(Some(n)),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(LxceError::ReadError(e.to_string())),
        }
    }
}

impl AsRawFd for ControlChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Allocate a zeroed receive buffer without aborting on allocation failure
pub fn packet_buffer(size: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|e| LxceError::MemoryError(format!("Unable to allocate {} bytes: {}", size, e)))?;
    buffer.resize(size, 0);
    Ok(buffer)
}
