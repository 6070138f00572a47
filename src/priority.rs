/// CPU niceness and Linux I/O priority for the current process (or a child).
///
/// The watchdog moves itself to the lowest CPU priority and the idle I/O class
/// so it never competes with the workload it guards. Both adjustments are best
/// effort: callers log failures and carry on.
use crate::config::PriorityConfig;
use nix::errno::Errno;
use nix::libc;
use serde::Deserialize;

const IOPRIO_CLASS_SHIFT: u32 = 13;
const IOPRIO_PRIO_MASK: u16 = (1 << IOPRIO_CLASS_SHIFT) - 1;
#[cfg(target_os = "linux")]
const IOPRIO_WHO_PROCESS: libc::c_int = 1;

/// Linux I/O scheduling classes (`IOPRIO_CLASS_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IoClass {
    None,
    RealTime,
    BestEffort,
    Idle,
}

impl IoClass {
    fn as_raw(self) -> u16 {
        match self {
            IoClass::None => 0,
            IoClass::RealTime => 1,
            IoClass::BestEffort => 2,
            IoClass::Idle => 3,
        }
    }

    fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(IoClass::None),
            1 => Some(IoClass::RealTime),
            2 => Some(IoClass::BestEffort),
            3 => Some(IoClass::Idle),
            _ => None,
        }
    }
}

/// An I/O priority value: a class plus class-specific data (0..=7 in practice).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPriority {
    pub class: IoClass,
    pub level: u8,
}

impl IoPriority {
    pub const IDLE: IoPriority = IoPriority {
        class: IoClass::Idle,
        level: 0,
    };

    /// Encode as the kernel's `IOPRIO_PRIO_VALUE(class, data)`.
    pub fn encode(self) -> u16 {
        (self.class.as_raw() << IOPRIO_CLASS_SHIFT) | (u16::from(self.level) & IOPRIO_PRIO_MASK)
    }

    /// Decode a raw value as returned by `ioprio_get`.
    pub fn decode(raw: u16) -> Option<Self> {
        let class = IoClass::from_raw(raw >> IOPRIO_CLASS_SHIFT)?;
        let level = u8::try_from(raw & IOPRIO_PRIO_MASK).ok()?;
        Some(IoPriority { class, level })
    }
}

/// Errors from priority syscalls.
#[derive(Debug)]
pub enum PriorityError {
    /// `setpriority`/`getpriority` failed.
    Niceness { source: Errno },
    /// `ioprio_set`/`ioprio_get` failed.
    IoPriority { source: Errno },
    /// The kernel reported a class this crate does not know.
    UnknownIoPriority { raw: i64 },
    /// I/O priorities are a Linux feature.
    Unsupported,
}

impl std::fmt::Display for PriorityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriorityError::Niceness { source } => {
                write!(f, "failed to change CPU niceness: {}", source)
            }
            PriorityError::IoPriority { source } => {
                write!(f, "failed to change I/O priority: {}", source)
            }
            PriorityError::UnknownIoPriority { raw } => {
                write!(f, "unrecognized I/O priority value {:#x}", raw)
            }
            PriorityError::Unsupported => {
                write!(f, "I/O priorities are not supported on this platform")
            }
        }
    }
}

impl std::error::Error for PriorityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PriorityError::Niceness { source } => Some(source),
            PriorityError::IoPriority { source } => Some(source),
            _ => None,
        }
    }
}

/// Set the nice value of the calling process. Raising it needs no privilege.
pub fn set_niceness(niceness: i32) -> Result<(), PriorityError> {
    // SAFETY: plain syscall wrapper, no pointers involved.
    let res = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, niceness) };
    Errno::result(res)
        .map(drop)
        .map_err(|e| PriorityError::Niceness { source: e })
}

/// Read the nice value of `pid` (0 = the calling process).
pub fn niceness_of(pid: u32) -> Result<i32, PriorityError> {
    // -1 is a legal nice value, so errno has to be cleared and checked.
    Errno::clear();
    // SAFETY: plain syscall wrapper, no pointers involved.
    let value = unsafe { libc::getpriority(libc::PRIO_PROCESS, pid as libc::id_t) };
    if value == -1 {
        let errno = Errno::last();
        if errno != Errno::UnknownErrno {
            return Err(PriorityError::Niceness { source: errno });
        }
    }
    Ok(value)
}

/// Set the I/O priority of the whole calling process.
#[cfg(target_os = "linux")]
pub fn set_io_priority(prio: IoPriority) -> Result<(), PriorityError> {
    // SAFETY: ioprio_set takes three integers.
    let res = unsafe {
        libc::syscall(
            libc::SYS_ioprio_set,
            IOPRIO_WHO_PROCESS,
            0 as libc::c_int,
            libc::c_int::from(prio.encode()),
        )
    };
    Errno::result(res)
        .map(drop)
        .map_err(|e| PriorityError::IoPriority { source: e })
}

#[cfg(not(target_os = "linux"))]
pub fn set_io_priority(_prio: IoPriority) -> Result<(), PriorityError> {
    Err(PriorityError::Unsupported)
}

/// Read the I/O priority of `pid` (0 = the calling process).
#[cfg(target_os = "linux")]
pub fn io_priority_of(pid: u32) -> Result<IoPriority, PriorityError> {
    // SAFETY: ioprio_get takes two integers.
    let res = unsafe {
        libc::syscall(
            libc::SYS_ioprio_get,
            IOPRIO_WHO_PROCESS,
            pid as libc::c_int,
        )
    };
    let raw = Errno::result(res).map_err(|e| PriorityError::IoPriority { source: e })?;
    u16::try_from(raw)
        .ok()
        .and_then(IoPriority::decode)
        .ok_or(PriorityError::UnknownIoPriority { raw: raw as i64 })
}

#[cfg(not(target_os = "linux"))]
pub fn io_priority_of(_pid: u32) -> Result<IoPriority, PriorityError> {
    Err(PriorityError::Unsupported)
}

/// What happened when the watchdog tried to lower its priorities.
#[derive(Debug)]
pub struct PriorityReport {
    pub niceness: Result<(), PriorityError>,
    pub io_priority: Result<(), PriorityError>,
}

impl PriorityReport {
    pub fn fully_applied(&self) -> bool {
        self.niceness.is_ok() && self.io_priority.is_ok()
    }
}

/// Apply the configured niceness and I/O priority, logging (not failing) on error.
pub fn deprioritize(config: &PriorityConfig) -> PriorityReport {
    let niceness = set_niceness(config.niceness);
    match &niceness {
        Ok(()) => tracing::debug!(niceness = config.niceness, "lowered CPU priority"),
        Err(e) => tracing::debug!(error = %e, "could not lower CPU priority"),
    }

    let prio = IoPriority {
        class: config.io_class,
        level: config.io_level,
    };
    let io_priority = set_io_priority(prio);
    match &io_priority {
        Ok(()) => tracing::debug!(class = ?prio.class, level = prio.level, "set I/O priority"),
        Err(e) => tracing::debug!(error = %e, "could not set I/O priority"),
    }

    PriorityReport {
        niceness,
        io_priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_idle() {
        assert_eq!(IoPriority::IDLE.encode(), 3 << 13);
    }

    #[test]
    fn test_encode_best_effort_with_level() {
        let prio = IoPriority {
            class: IoClass::BestEffort,
            level: 4,
        };
        assert_eq!(prio.encode(), (2 << 13) | 4);
        assert_eq!(IoPriority::decode(prio.encode()), Some(prio));
    }

    #[test]
    fn test_decode_rejects_unknown_class() {
        assert_eq!(IoPriority::decode(5 << 13), None);
    }

    #[test]
    fn test_decode_zero_is_class_none() {
        // ioprio_get reports 0 for processes that never set a priority
        assert_eq!(
            IoPriority::decode(0),
            Some(IoPriority {
                class: IoClass::None,
                level: 0
            })
        );
    }

    #[test]
    fn test_niceness_of_self_is_readable() {
        let nice = niceness_of(0).unwrap();
        assert!((-20..=19).contains(&nice));
    }

    #[test]
    fn test_setting_current_niceness_succeeds() {
        // Re-applying the current value never needs privilege
        let nice = niceness_of(0).unwrap();
        set_niceness(nice).unwrap();
        assert_eq!(niceness_of(0).unwrap(), nice);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_io_priority_of_self_is_readable() {
        match io_priority_of(0) {
            Ok(_) => {}
            // Some sandboxes filter the syscall
            Err(PriorityError::IoPriority { source })
                if source == Errno::ENOSYS || source == Errno::EPERM => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_deprioritize_survives_rejected_io_priority() {
        // The kernel refuses class data on IOPRIO_CLASS_NONE with EINVAL
        let config = PriorityConfig {
            niceness: niceness_of(0).unwrap(),
            io_class: IoClass::None,
            io_level: 1,
        };
        let report = deprioritize(&config);
        assert!(report.niceness.is_ok());
        assert!(report.io_priority.is_err());
        assert!(!report.fully_applied());
    }

    #[test]
    fn test_error_display() {
        let err = PriorityError::IoPriority {
            source: Errno::EPERM,
        };
        assert!(err.to_string().starts_with("failed to change I/O priority"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
