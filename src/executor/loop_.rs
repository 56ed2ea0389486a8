//! The event loop: a single `tokio::select!` multiplexing stdin, stdout
//! readiness, child capture pipes, and `SIGCHLD`, driving every other
//! component. One task, one thread — parallelism comes entirely from
//! the OS child processes, never from spawned tokio tasks. Grounded on
//! the `tokio::select!`/`AsyncFd` I/O loop used elsewhere in this
//! codebase's lineage for a PTY session, adapted from one child to the
//! full capture-pipe fan-in.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::libc;
use tokio::io::unix::AsyncFd;
use tokio::signal::unix::{SignalKind, signal as tokio_signal};
use tokio_stream::{StreamExt, StreamMap};

use crate::diagnostics::{self, is_main_process};
use crate::wire::{Framer, FrameResult, Message};

use super::child::{self, ChildError};
use super::files::{self, FileError};
use super::output::OutputBuffer;
use super::slots::{SlotError, SlotTable};

const CAPTURE_CHUNK: usize = 1024;
const IDLE_TIMEOUT: Duration = Duration::from_millis(100);

/// The executor's own PID, recorded once at startup so a fatal
/// diagnostic can tell whether it is running in the main process (where
/// the wire is still ours to write to) — always true here since nothing
/// in this module runs in a forked child before exec, but the check
/// keeps the invariant spec.md §4 documents load-bearing rather than
/// assumed.
static STARTUP_PID: std::sync::OnceLock<nix::unistd::Pid> = std::sync::OnceLock::new();

/// Log a located diagnostic to stderr and, best-effort, as a wire Log
/// frame before exiting. The frame write is opportunistic: if the
/// output buffer is already full or the fd refuses the write, the
/// stderr diagnostic and non-zero exit still happen regardless.
#[track_caller]
fn fatal(output: &mut OutputBuffer, function: &str, message: impl std::fmt::Display) -> ! {
    if is_main_process(*STARTUP_PID.get_or_init(nix::unistd::getpid)) {
        let mut buf = bytes::BytesMut::new();
        Message::Log {
            slot: None,
            timestamp: now_nanos(),
            text: format!("fatal: [{function}] {message}"),
        }
        .encode(&mut buf);
        let _ = output.append(&buf);
        let _ = output.drain_nonblocking(libc::STDOUT_FILENO);
    }
    diagnostics::fatal(function, message)
}

/// Non-owning wrapper so stdin can be registered with `AsyncFd` without
/// taking ownership of fd 0 (it must remain open for the life of the
/// process).
struct StdinFd;

impl AsRawFd for StdinFd {
    fn as_raw_fd(&self) -> RawFd {
        libc::STDIN_FILENO
    }
}

struct StdoutFd;

impl AsRawFd for StdoutFd {
    fn as_raw_fd(&self) -> RawFd {
        libc::STDOUT_FILENO
    }
}

/// A `Stream` of output chunks read from one slot's capture pipe,
/// yielding a data chunk on each readable wakeup and ending at EOF.
/// Lets a variable number of live capture pipes sit behind a single
/// static `StreamMap` arm in the main `select!`, since `select!` itself
/// cannot have a dynamic number of arms.
struct CapturePipeStream {
    fd: AsyncFd<OwnedFd>,
    /// Set once EOF or an error has been surfaced as a final item, so the
    /// next poll can return `None` and let the `StreamMap` drop this
    /// stream. `StreamMap` gives no other way to learn which key just
    /// ended, so the terminal state must be an explicit item rather than
    /// going straight from data to `None`.
    done: bool,
}

impl CapturePipeStream {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(fd)?,
            done: false,
        })
    }
}

enum CaptureOutcome {
    Data(Vec<u8>),
    Eof,
    Error(io::Error),
}

impl futures::Stream for CapturePipeStream {
    type Item = CaptureOutcome;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return std::task::Poll::Ready(None);
        }
        loop {
            let mut guard = match this.fd.poll_read_ready(cx) {
                std::task::Poll::Ready(Ok(g)) => g,
                std::task::Poll::Ready(Err(e)) => {
                    this.done = true;
                    return std::task::Poll::Ready(Some(CaptureOutcome::Error(e)));
                }
                std::task::Poll::Pending => return std::task::Poll::Pending,
            };
            let mut buf = [0u8; CAPTURE_CHUNK];
            let result = guard.try_io(|inner| {
                let raw = inner.get_ref().as_raw_fd();
                nix::unistd::read(unsafe { BorrowedFd::borrow_raw(raw) }, &mut buf)
                    .map_err(|e| io::Error::from_raw_os_error(e as i32))
            });
            match result {
                Ok(Ok(0)) => {
                    this.done = true;
                    return std::task::Poll::Ready(Some(CaptureOutcome::Eof));
                }
                Ok(Ok(n)) => {
                    return std::task::Poll::Ready(Some(CaptureOutcome::Data(buf[..n].to_vec())));
                }
                Ok(Err(e)) => {
                    this.done = true;
                    return std::task::Poll::Ready(Some(CaptureOutcome::Error(e)));
                }
                Err(_would_block) => continue,
            }
        }
    }
}

/// Errors that end the event loop. All are fatal — the loop has no
/// notion of a recoverable top-level error.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Output(#[from] super::output::OutputError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Child(#[from] ChildError),
    #[error(transparent)]
    File(#[from] FileError),
}

fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn nix_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    nix::unistd::read(borrowed, buf).map_err(|e| io::Error::from_raw_os_error(e as i32))
}

/// Runs the executor until stdin hits EOF (graceful shutdown) or a
/// fatal diagnostic terminates the process.
pub async fn run() -> Result<(), LoopError> {
    let mut framer = Framer::new();
    let mut output = OutputBuffer::new();
    let mut slots = SlotTable::new();
    let mut captures: StreamMap<u32, CapturePipeStream> = StreamMap::new();

    let stdin_async = AsyncFd::new(StdinFd)?;
    let stdout_async = AsyncFd::new(StdoutFd)?;
    let mut sigchld = tokio_signal(SignalKind::child())?;

    let mut read_buf = [0u8; 64 * 1024];

    loop {
        tokio::select! {
            guard = stdin_async.readable() => {
                let mut guard = guard?;
                match guard.try_io(|_| nix_read(libc::STDIN_FILENO, &mut read_buf)) {
                    Ok(Ok(0)) => return Ok(()),
                    Ok(Ok(n)) => {
                        if let Err(e) = framer.feed(&read_buf[..n]) {
                            fatal(&mut output, "input framer", e);
                        }
                        drain_frames(
                            &mut framer,
                            &mut output,
                            &mut slots,
                            &mut captures,
                            libc::STDIN_FILENO,
                            libc::STDOUT_FILENO,
                        )
                        .await;
                    }
                    Ok(Err(e)) => fatal(&mut output, "stdin read", e),
                    Err(_would_block) => {}
                }
            }

            guard = stdout_async.writable(), if output.is_blocked() => {
                let mut guard = guard?;
                let _ = guard.try_io(|_| {
                    output
                        .drain_nonblocking(libc::STDOUT_FILENO)
                        .map_err(io::Error::other)
                });
            }

            Some((slot, outcome)) = captures.next() => {
                match outcome {
                    CaptureOutcome::Data(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        append_message(&mut output, &Message::Log {
                            slot: Some(slot),
                            timestamp: now_nanos(),
                            text,
                        });
                    }
                    CaptureOutcome::Eof => {
                        if let Err(e) = slots.close_capture(slot) {
                            fatal(&mut output, "capture eof", e);
                        }
                        captures.remove(&slot);
                    }
                    CaptureOutcome::Error(e) => fatal(&mut output, "capture pipe read", e),
                }
            }

            _ = sigchld.recv() => {
                let exits = match child::drain_exits() {
                    Ok(exits) => exits,
                    Err(e) => fatal(&mut output, "sigchld drain", e),
                };
                for exit in exits {
                    let Ok(slot) = slots.slot_for_pid(exit.pid) else {
                        continue;
                    };
                    append_message(&mut output, &Message::Result {
                        slot,
                        timestamp: now_nanos(),
                        si_code: exit.si_code,
                        si_status: exit.si_status,
                    });
                    if let Err(e) = slots.mark_terminated(slot) {
                        fatal(&mut output, "slot termination", e);
                    }
                    captures.remove(&slot);
                }
            }

            _ = tokio::time::sleep(IDLE_TIMEOUT) => {}
        }

        // Unconditional opportunistic drain after each wake, on top of
        // the low-water-triggered drains handlers perform mid-dispatch.
        if !output.is_blocked() {
            if let Err(e) = output.drain_nonblocking(libc::STDOUT_FILENO) {
                fatal(&mut output, "drain", e);
            }
        }
    }
}

fn append_message(output: &mut OutputBuffer, msg: &Message) {
    let mut buf = bytes::BytesMut::new();
    msg.encode(&mut buf);
    if let Err(e) = output.append(&buf) {
        fatal(output, "output append", e);
    }
}

/// Pull every currently-available complete frame out of `framer` and
/// dispatch it. Each frame's echo is appended before any derived
/// response for that same frame; since only the narrowest tag is ever
/// accepted on decode, re-encoding a parsed frame always reproduces its
/// original bytes exactly.
async fn drain_frames(
    framer: &mut Framer,
    output: &mut OutputBuffer,
    slots: &mut SlotTable,
    captures: &mut StreamMap<u32, CapturePipeStream>,
    in_fd: RawFd,
    out_fd: RawFd,
) {
    loop {
        let msg = match framer.next_frame() {
            Ok(FrameResult::Frame(msg)) => msg,
            Ok(FrameResult::NeedMore) => return,
            Err(e) => fatal(output, "frame decode", e),
        };

        append_message(output, &msg);
        dispatch(msg, output, slots, captures, in_fd, out_fd).await;

        // Opportunistic drain so a long batch of frames (many Exec/Log
        // messages fed in one read) can't build up undrained against the
        // output buffer's fixed capacity before the next readiness wakeup.
        if output.past_low_water() && !output.is_blocked() {
            if let Err(e) = output.drain_nonblocking(out_fd) {
                fatal(output, "low-water drain", e);
            }
        }
    }
}

async fn dispatch(
    msg: Message,
    output: &mut OutputBuffer,
    slots: &mut SlotTable,
    captures: &mut StreamMap<u32, CapturePipeStream>,
    in_fd: RawFd,
    out_fd: RawFd,
) {
    match msg {
        Message::Ping => {
            append_message(
                output,
                &Message::Pong {
                    timestamp: now_nanos(),
                },
            );
        }
        Message::Version => {
            append_message(
                output,
                &Message::Log {
                    slot: None,
                    timestamp: now_nanos(),
                    text: format!("LTX Version={}", env!("CARGO_PKG_VERSION")),
                },
            );
        }
        Message::Env { slot, key, value } => {
            if let Err(e) = slots.apply_env(slot, key, value) {
                fatal(output, "env overlay", e);
            }
        }
        Message::Exec { slot, path, argv } => {
            if let Err(e) = slots.check_argv_len(slot, &path, &argv) {
                fatal(output, "argv length", e);
            }
            let env = match slots.effective_env(slot) {
                Ok(e) => e,
                Err(e) => fatal(output, "effective env", e),
            };
            let spawned = match child::spawn(&path, &argv, &env) {
                Ok(s) => s,
                Err(e) => fatal(output, "exec", e),
            };
            let fd = spawned.capture_read.as_raw_fd();
            if let Err(e) = slots.mark_running(slot, spawned.pid.as_raw() as u32, fd) {
                fatal(output, "mark running", e);
            }
            match CapturePipeStream::new(spawned.capture_read) {
                Ok(stream) => {
                    captures.insert(slot, stream);
                }
                Err(e) => fatal(output, "capture pipe registration", e),
            }
        }
        Message::Kill { slot } => {
            let pid = match slots.slot(slot) {
                Ok(s) => s.pid(),
                Err(e) => fatal(output, "kill lookup", e),
            };
            if let Some(pid) = pid {
                if let Err(e) = child::kill(pid) {
                    fatal(output, "kill", e);
                }
            }
        }
        Message::GetFile { path } => match files::serve_get_file(&path, output, out_fd) {
            Ok(_) => {}
            Err(e) => fatal(output, "get file", e),
        },
        Message::SetFile { path, blob } => {
            let declared_len = blob.len() as u64;
            match files::serve_set_file(&path, declared_len, &blob, in_fd, output, out_fd) {
                Ok(()) => {}
                Err(e) => fatal(output, "set file", e),
            }
        }
        Message::Pong { .. } | Message::Log { .. } | Message::Result { .. } | Message::Data { .. } => {
            unreachable!("outbound-only types are rejected by the framer before dispatch")
        }
    }
}
