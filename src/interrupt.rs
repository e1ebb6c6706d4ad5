//! Process-wide signal state.
//!
//! The SIGINT flag is the one genuinely global piece of host state: the
//! handler can only reach an atomic. Everything else goes through owned
//! structures. The handler is installed only for the duration of a `run`;
//! SIGPIPE is ignored for the whole process since the peer closing first is
//! a normal shutdown path.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{HostError, HostResult};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub fn is_pending() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

pub fn clear() {
    INTERRUPTED.store(false, Ordering::Relaxed);
}

/// Raises the flag exactly as the signal handler would. Exists so tests can
/// exercise the interrupt paths without delivering a signal.
pub fn trigger() {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Scoped SIGINT flag handler. Clears the flag, installs the handler
/// without SA_RESTART (blocking reads must see EINTR at the frame
/// boundary), and restores the previous disposition on drop.
pub struct SigintGuard {
    previous: SigAction,
}

impl SigintGuard {
    pub fn install() -> HostResult<SigintGuard> {
        clear();
        let action =
            SigAction::new(SigHandler::Handler(on_sigint), SaFlags::empty(), SigSet::empty());
        let previous = unsafe { signal::sigaction(Signal::SIGINT, &action) }
            .map_err(|e| HostError::Transport(format!("sigaction(SIGINT): {e}")))?;
        Ok(SigintGuard { previous })
    }
}

impl Drop for SigintGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = signal::sigaction(Signal::SIGINT, &self.previous);
        }
    }
}

/// Installed once at startup.
pub fn ignore_sigpipe() {
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}
