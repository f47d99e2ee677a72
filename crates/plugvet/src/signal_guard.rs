//! Hard-death guarantees for the worker process.
//!
//! A plugin that faults must not leave a wedged worker behind. The fatal
//! signal handlers re-deliver SIGKILL to our own pid so the process dies
//! immediately and the supervisor observes a clean connection loss. The
//! handlers are process-global, installed once at worker startup, never
//! removed.

#[cfg(unix)]
pub fn install_fatal_signal_guard() {
    use nix::sys::signal::{SigHandler, Signal, signal};

    extern "C" fn kill_without_mercy(_: i32) {
        // Only kill(2), which is async-signal-safe.
        let _ = nix::sys::signal::kill(nix::unistd::Pid::this(), Signal::SIGKILL);
    }

    const FATAL_SIGNALS: [Signal; 5] = [
        Signal::SIGFPE,
        Signal::SIGILL,
        Signal::SIGSEGV,
        Signal::SIGBUS,
        Signal::SIGABRT,
    ];

    for sig in FATAL_SIGNALS {
        // Safety: the handler issues a single async-signal-safe syscall.
        if let Err(e) = unsafe { signal(sig, SigHandler::Handler(kill_without_mercy)) } {
            tracing::warn!(signal = %sig, error = %e, "failed to install fatal signal handler");
        }
    }
}

#[cfg(not(unix))]
pub fn install_fatal_signal_guard() {
    // OS-default abnormal termination is enough off unix.
}

/// Makes panics anywhere in the worker abort after printing, landing in
/// the same SIGABRT path as a faulting plugin.
pub fn install_panic_abort_hook() {
    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        prev(info);
        std::process::abort();
    }));
}
