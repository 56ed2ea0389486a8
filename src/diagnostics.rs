//! Fatal-assertion diagnostics.
//!
//! Protocol violations and environment failures are not recoverable:
//! the executor logs a located diagnostic and exits. This is
//! deliberately distinct from the wire-visible Log frame — a fatal
//! diagnostic means the output stream may already be in an
//! inconsistent state, so it goes to stderr via `tracing`, never onto
//! the wire.

use std::panic::Location;

/// Print `[file:function:line] message` to stderr via `tracing::error!`
/// and exit the process with status 1. Never returns.
///
/// `function` is passed explicitly since `Location` alone does not
/// carry a function name; callers typically pass a short tag describing
/// the failing operation (e.g. `"exec"`, `"frame decode"`).
#[track_caller]
pub fn fatal(function: &str, message: impl std::fmt::Display) -> ! {
    let loc = Location::caller();
    tracing::error!(
        "[{file}:{function}:{line}] {message}",
        file = loc.file(),
        line = loc.line(),
    );
    std::process::exit(1)
}

/// Whether the calling process is the executor's own main process
/// (never true inside a forked child between `fork()` and `exec()` —
/// diagnostic logging must not run there).
pub fn is_main_process(startup_pid: nix::unistd::Pid) -> bool {
    nix::unistd::getpid() == startup_pid
}
