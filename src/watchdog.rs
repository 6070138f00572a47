/// Stdin-driven deadline watchdog.
///
/// Arms an alarm, blocks on a one-byte read, and re-arms after every byte.
/// If the alarm fires first the default SIGALRM action kills the process; if
/// the input closes the loop returns and the caller exits with status 1.
use nix::unistd::alarm;
use std::fs::File;
use std::io::Read;
use std::os::fd::AsFd;

/// Exit status reported when the liveness channel closes or fails.
pub const INPUT_CLOSED_EXIT_CODE: u8 = 1;

/// A countdown that terminates the process when it expires.
pub trait Timer {
    /// Replace any pending countdown with one of `secs` seconds.
    /// Zero disarms the countdown.
    fn arm(&mut self, secs: u32);
}

/// `alarm(2)`-backed timer. Expiry delivers SIGALRM to this process.
#[derive(Debug, Default)]
pub struct AlarmTimer;

impl Timer for AlarmTimer {
    fn arm(&mut self, secs: u32) {
        // alarm::set rejects 0; alarm(0) is the cancel call
        if secs == 0 {
            alarm::cancel();
        } else {
            alarm::set(secs);
        }
    }
}

/// Why the read loop stopped.
#[derive(Debug)]
pub enum WatchdogExit {
    /// The supervisor closed its end of the channel.
    EndOfInput { pings: u64 },
    /// Reading the channel failed.
    ReadError { pings: u64, source: std::io::Error },
}

impl WatchdogExit {
    /// Number of liveness pings received before the loop stopped.
    pub fn pings(&self) -> u64 {
        match self {
            WatchdogExit::EndOfInput { pings } => *pings,
            WatchdogExit::ReadError { pings, .. } => *pings,
        }
    }

    pub fn exit_code(&self) -> u8 {
        INPUT_CLOSED_EXIT_CODE
    }
}

/// The watchdog loop, parameterized by its timeout.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    timeout_secs: u32,
}

impl Watchdog {
    pub fn new(timeout_secs: u32) -> Self {
        Self { timeout_secs }
    }

    pub fn timeout_secs(&self) -> u32 {
        self.timeout_secs
    }

    /// Run until `input` ends or errors. Returns only in those cases; timer
    /// expiry is handled outside the loop.
    pub fn run<R: Read, T: Timer>(&self, input: &mut R, timer: &mut T) -> WatchdogExit {
        let mut byte = [0u8; 1];
        let mut pings: u64 = 0;

        loop {
            timer.arm(self.timeout_secs);
            match input.read(&mut byte) {
                Ok(1) => {
                    pings += 1;
                    tracing::trace!(pings, "liveness ping");
                }
                Ok(_) => {
                    tracing::debug!(pings, "liveness channel closed");
                    return WatchdogExit::EndOfInput { pings };
                }
                Err(e) => {
                    tracing::debug!(pings, error = %e, "liveness channel read failed");
                    return WatchdogExit::ReadError { pings, source: e };
                }
            }
        }
    }
}

/// Open an unbuffered reader over file descriptor 0.
///
/// `std::io::stdin()` buffers ahead; reading a duplicate of fd 0 consumes
/// exactly one byte per call.
pub fn stdin_reader() -> std::io::Result<File> {
    let fd = std::io::stdin().as_fd().try_clone_to_owned()?;
    Ok(File::from(fd))
}
