//! Demand-driven transcoder throttling.
//!
//! The throttle keeps a running transcoder ahead of the play head without
//! exhausting disk or dropping upstream connections. The decision itself is
//! a pure function of a snapshot taken under the controller lock, so the
//! 250 ms ticker and the on-demand invocations from segment serving always
//! converge on the same answer.

use std::time::Duration;

/// Full cycle window of the duty-cycle throttles.
pub const THROTTLE_CYCLE_WINDOW: Duration = Duration::from_secs(1);
/// Active portion of the mid-range duty cycle (~60% active).
pub const THROTTLE_ACTIVE_PORTION: Duration = Duration::from_millis(600);
/// Active portion of the at-cap duty cycle for HTTP sources (~2% active,
/// just enough to keep the upstream TCP stream alive).
pub const CAP_ACTIVE_PORTION: Duration = Duration::from_millis(20);
/// Ahead buffer below which the throttle never engages, protecting
/// time-to-first-frame and shallow buffers.
pub const THROTTLE_MIN_AHEAD_TO_ENGAGE: Duration = Duration::from_secs(12);

/// Snapshot of the throttle-relevant session state.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleSnapshot {
    /// Produced-but-unserved playlist duration
    pub ahead: Duration,
    /// Highest served segment sequence, -1 before playback starts
    pub last_served_seq: i64,
    /// Remote HTTP source (duty-cycled at cap) vs local file (hard pause)
    pub http_source: bool,
    /// A client asset request opened a demand-grace window
    pub in_demand_grace: bool,
    /// Position within the 1-second duty-cycle window
    pub phase: Duration,
    /// Child is currently paused
    pub paused: bool,
    /// The pause came from a duty cycle, not the hard ceiling
    pub paused_by_cap: bool,
}

/// What the controller should do with the child right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAction {
    /// Leave the child as it is
    None,
    /// Stop the child
    Pause {
        /// Record the pause as duty-cycle induced
        by_cap: bool,
    },
    /// Continue the child
    Resume {
        /// Only lift duty-cycle pauses, never a hard-ceiling pause
        only_cap_paused: bool,
    },
}

/// Pure throttle decision over a state snapshot.
///
/// Policy, from the outermost band inward:
/// - demand grace suppresses cap-pauses below the hard ceiling;
/// - at or above `max_buffer_ahead`, local files pause outright (the
///   decoder resumes without losing position) while HTTP sources run a
///   20 ms / 980 ms duty cycle that keeps the upstream connection alive;
/// - at or below half the ceiling, any pause is lifted;
/// - in between, once playback has started and the buffer is deeper than
///   [`THROTTLE_MIN_AHEAD_TO_ENGAGE`], a 600 ms / 400 ms duty cycle bounds
///   long-term CPU near the media's real-time rate;
/// - otherwise the child runs uncapped.
pub fn decide(max_buffer_ahead: Duration, snap: &ThrottleSnapshot) -> ThrottleAction {
    if snap.in_demand_grace && snap.ahead < max_buffer_ahead {
        if snap.paused {
            return ThrottleAction::Resume {
                only_cap_paused: false,
            };
        }
        return ThrottleAction::None;
    }

    if snap.ahead >= max_buffer_ahead {
        if !snap.http_source {
            if snap.paused {
                return ThrottleAction::None;
            }
            return ThrottleAction::Pause { by_cap: false };
        }
        if snap.phase < CAP_ACTIVE_PORTION {
            if snap.paused {
                return ThrottleAction::Resume {
                    only_cap_paused: false,
                };
            }
            return ThrottleAction::None;
        }
        if snap.paused {
            return ThrottleAction::None;
        }
        return ThrottleAction::Pause { by_cap: true };
    }

    if snap.ahead <= max_buffer_ahead / 2 {
        if snap.paused {
            return ThrottleAction::Resume {
                only_cap_paused: false,
            };
        }
        return ThrottleAction::None;
    }

    if snap.ahead >= THROTTLE_MIN_AHEAD_TO_ENGAGE && snap.last_served_seq >= 0 {
        if snap.phase < THROTTLE_ACTIVE_PORTION {
            if snap.paused && snap.paused_by_cap {
                return ThrottleAction::Resume {
                    only_cap_paused: true,
                };
            }
            return ThrottleAction::None;
        }
        if snap.paused {
            return ThrottleAction::None;
        }
        return ThrottleAction::Pause { by_cap: true };
    }

    if snap.paused && snap.paused_by_cap {
        return ThrottleAction::Resume {
            only_cap_paused: true,
        };
    }
    ThrottleAction::None
}

/// Capability for stopping and continuing a child process.
///
/// Injected into the controller so tests can substitute a counting mock.
pub trait ProcessControl: Send + Sync {
    /// Stop the process with the given PID.
    ///
    /// # Errors
    ///
    /// Propagates the OS error when signalling fails.
    fn pause(&self, pid: u32) -> std::io::Result<()>;

    /// Continue the process with the given PID.
    ///
    /// # Errors
    ///
    /// Propagates the OS error when signalling fails.
    fn resume(&self, pid: u32) -> std::io::Result<()>;
}

/// Platform pause/resume: SIGSTOP/SIGCONT on Unix, process suspension via
/// the native kernel entry points on Windows.
#[derive(Debug, Default)]
pub struct PlatformProcessControl;

impl PlatformProcessControl {
    /// Create the platform control.
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl ProcessControl for PlatformProcessControl {
    fn pause(&self, pid: u32) -> std::io::Result<()> {
        signal(pid, libc::SIGSTOP)
    }

    fn resume(&self, pid: u32) -> std::io::Result<()> {
        signal(pid, libc::SIGCONT)
    }
}

#[cfg(unix)]
fn signal(pid: u32, sig: libc::c_int) -> std::io::Result<()> {
    // Safety: kill with a valid signal number; the PID came from a child we
    // spawned ourselves.
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
impl ProcessControl for PlatformProcessControl {
    fn pause(&self, pid: u32) -> std::io::Result<()> {
        windows_impl::suspend(pid)
    }

    fn resume(&self, pid: u32) -> std::io::Result<()> {
        windows_impl::resume(pid)
    }
}

#[cfg(windows)]
mod windows_impl {
    const PROCESS_SUSPEND_RESUME: u32 = 0x0800;
    const PROCESS_QUERY_INFORMATION: u32 = 0x0400;

    #[link(name = "kernel32")]
    extern "system" {
        fn OpenProcess(desired_access: u32, inherit_handle: i32, pid: u32) -> isize;
        fn CloseHandle(handle: isize) -> i32;
    }

    #[link(name = "ntdll")]
    extern "system" {
        fn NtSuspendProcess(handle: isize) -> i32;
        fn NtResumeProcess(handle: isize) -> i32;
    }

    fn with_handle(pid: u32, f: unsafe extern "system" fn(isize) -> i32) -> std::io::Result<()> {
        unsafe {
            let handle = OpenProcess(PROCESS_SUSPEND_RESUME | PROCESS_QUERY_INFORMATION, 0, pid);
            if handle == 0 {
                return Err(std::io::Error::last_os_error());
            }
            let status = f(handle);
            CloseHandle(handle);
            if status != 0 {
                return Err(std::io::Error::other(format!(
                    "process suspend/resume failed with status 0x{status:x}"
                )));
            }
            Ok(())
        }
    }

    pub fn suspend(pid: u32) -> std::io::Result<()> {
        with_handle(pid, NtSuspendProcess)
    }

    pub fn resume(pid: u32) -> std::io::Result<()> {
        with_handle(pid, NtResumeProcess)
    }
}

#[cfg(not(any(unix, windows)))]
impl ProcessControl for PlatformProcessControl {
    fn pause(&self, _pid: u32) -> std::io::Result<()> {
        Ok(())
    }

    fn resume(&self, _pid: u32) -> std::io::Result<()> {
        Ok(())
    }
}

/// Counting mock for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CountingProcessControl {
    /// Number of pause calls observed
    pub pauses: std::sync::atomic::AtomicUsize,
    /// Number of resume calls observed
    pub resumes: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl ProcessControl for CountingProcessControl {
    fn pause(&self, _pid: u32) -> std::io::Result<()> {
        self.pauses
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self, _pid: u32) -> std::io::Result<()> {
        self.resumes
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
