/// SIGALRM disposition for the watchdog.
///
/// The watchdog never handles SIGALRM itself: expiry must kill the process
/// with no cleanup. The parent may have left SIGALRM ignored or blocked, so
/// both are reset before the first alarm is armed.
use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, SigSet, Signal};

/// Errors that can occur while restoring the alarm signal.
#[derive(Debug)]
pub enum SignalError {
    /// `signal(2)` refused to install the default handler.
    Disposition { signal: Signal, source: Errno },
    /// The signal could not be removed from the blocked mask.
    Unblock { signal: Signal, source: Errno },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::Disposition { signal, source } => {
                write!(f, "failed to reset {} to default action: {}", signal, source)
            }
            SignalError::Unblock { signal, source } => {
                write!(f, "failed to unblock {}: {}", signal, source)
            }
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::Disposition { source, .. } => Some(source),
            SignalError::Unblock { source, .. } => Some(source),
        }
    }
}

/// Make sure a delivered SIGALRM terminates the process.
pub fn restore_default_alarm() -> Result<(), SignalError> {
    let sig = Signal::SIGALRM;

    // SAFETY: installing SIG_DFL registers no Rust code as a handler.
    let previous = unsafe { signal::signal(sig, SigHandler::SigDfl) }.map_err(|e| {
        SignalError::Disposition {
            signal: sig,
            source: e,
        }
    })?;
    if previous != SigHandler::SigDfl {
        tracing::debug!(signal = %sig, "inherited a non-default disposition");
    }

    let mut mask = SigSet::empty();
    mask.add(sig);
    mask.thread_unblock().map_err(|e| SignalError::Unblock {
        signal: sig,
        source: e,
    })?;

    tracing::debug!(signal = %sig, "alarm signal restored to default action");
    Ok(())
}
