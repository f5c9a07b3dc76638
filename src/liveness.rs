//! Cross-platform "is this PID a live process" predicate.
//!
//! Callers never branch on platform: they hold a [`LivenessProbe`] (usually
//! [`SystemProbe`]) or call [`is_alive`] directly.

/// Answers whether a PID currently names a live, signalable process.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl LivenessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        is_alive(pid)
    }
}

/// Returns `true` when `pid` refers to a live process.
///
/// PID 0 is never considered alive: on Unix, signalling it addresses the
/// caller's whole process group.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    platform::is_alive(pid)
}

#[cfg(unix)]
mod platform {
    use nix::{errno::Errno, sys::signal, unistd::Pid};

    /// Signal 0 performs the permission and existence checks without
    /// delivering anything. `EPERM` means the process exists under another
    /// user, which still counts as alive.
    pub(super) fn is_alive(pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };

        match signal::kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::c_void;

    const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;
    const ERROR_ACCESS_DENIED: u32 = 5;
    const STILL_ACTIVE: u32 = 259;

    unsafe extern "system" {
        fn OpenProcess(access: u32, inherit: i32, pid: u32) -> *mut c_void;
        fn GetExitCodeProcess(process: *mut c_void, exit_code: *mut u32) -> i32;
        fn CloseHandle(handle: *mut c_void) -> i32;
        fn GetLastError() -> u32;
    }

    /// Opening with minimal query rights either succeeds, fails with
    /// access-denied (a protected but running process), or fails because the
    /// PID is gone.
    pub(super) fn is_alive(pid: u32) -> bool {
        // SAFETY: OpenProcess returns null on failure and the handle is closed
        // before returning on every path.
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                return GetLastError() == ERROR_ACCESS_DENIED;
            }

            let mut exit_code: u32 = 0;
            let queried = GetExitCodeProcess(handle, &mut exit_code);
            CloseHandle(handle);

            queried == 0 || exit_code == STILL_ACTIVE
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    pub(super) fn is_alive(_pid: u32) -> bool {
        false
    }
}
