//! Output buffer and drainer: a fixed-size append buffer drained to
//! stdout in non-blocking mode, with a blocked/unblocked flag and an
//! opportunistic low-water-mark drain so one large response can't starve
//! behind a slow reader.

use std::os::fd::RawFd;

use bytes::{Buf, BytesMut};
use nix::errno::Errno;

/// Fixed output buffer capacity. Appending past this is fatal
/// back-pressure.
pub const OUTPUT_BUFFER_CAPACITY: usize = 1024 * 1024;

/// Drain is attempted opportunistically once buffered volume exceeds
/// this fraction of capacity.
const LOW_WATER_NUMERATOR: usize = 1;
const LOW_WATER_DENOMINATOR: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("output buffer would exceed {OUTPUT_BUFFER_CAPACITY} byte capacity")]
    BufferOverflow,
    #[error("write to output stream failed: {0}")]
    Write(#[source] nix::Error),
}

/// Owns the pending-output buffer and the blocked/unblocked flag.
pub struct OutputBuffer {
    buf: BytesMut,
    blocked: bool,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            blocked: false,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// True once buffered volume has crossed the low-water threshold,
    /// signalling that handlers should try an opportunistic drain
    /// rather than waiting for the next readiness wakeup.
    pub fn past_low_water(&self) -> bool {
        self.buf.len() * LOW_WATER_DENOMINATOR >= OUTPUT_BUFFER_CAPACITY * LOW_WATER_NUMERATOR
    }

    /// Append encoded bytes. Fatal if this would exceed the fixed
    /// capacity — the controller is expected to read as fast as the
    /// executor produces.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        if self.buf.len() + bytes.len() > OUTPUT_BUFFER_CAPACITY {
            return Err(OutputError::BufferOverflow);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Write as much of the buffer as `fd` will accept without
    /// blocking. Clears the blocked flag on a successful (even
    /// partial) write; sets it on `EAGAIN`. Any other write error is
    /// fatal in the caller.
    pub fn drain_nonblocking(&mut self, fd: RawFd) -> Result<(), OutputError> {
        while !self.buf.is_empty() {
            match nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &self.buf)
            {
                Ok(0) => break,
                Ok(n) => {
                    self.buf.advance(n);
                    self.blocked = false;
                }
                Err(Errno::EAGAIN) => {
                    self.blocked = true;
                    return Ok(());
                }
                Err(e) => return Err(OutputError::Write(e)),
            }
        }
        self.blocked = false;
        Ok(())
    }

    /// Fully drain the buffer in blocking mode, used as the preamble
    /// flush before a zero-copy file transfer. `fd` must currently be
    /// in blocking mode.
    pub fn drain_blocking(&mut self, fd: RawFd) -> Result<(), OutputError> {
        while !self.buf.is_empty() {
            let n = nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &self.buf)
                .map_err(OutputError::Write)?;
            self.buf.advance(n);
        }
        self.blocked = false;
        Ok(())
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Switch `fd` to blocking mode for the duration of a zero-copy file
/// transfer, then back to non-blocking once the transfer completes.
pub struct BlockingModeGuard {
    fd: RawFd,
    previous: nix::fcntl::OFlag,
}

impl BlockingModeGuard {
    pub fn enter(fd: RawFd) -> Result<Self, OutputError> {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        let previous = nix::fcntl::OFlag::from_bits_truncate(
            nix::fcntl::fcntl(borrowed, nix::fcntl::FcntlArg::F_GETFL)
                .map_err(OutputError::Write)?,
        );
        let blocking = previous & !nix::fcntl::OFlag::O_NONBLOCK;
        nix::fcntl::fcntl(borrowed, nix::fcntl::FcntlArg::F_SETFL(blocking))
            .map_err(OutputError::Write)?;
        Ok(Self { fd, previous })
    }
}

impl Drop for BlockingModeGuard {
    fn drop(&mut self) {
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.fd) };
        let _ = nix::fcntl::fcntl(borrowed, nix::fcntl::FcntlArg::F_SETFL(self.previous));
    }
}
