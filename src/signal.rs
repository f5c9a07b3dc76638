//! Launch-time process grouping and termination signals.
//!
//! Workers are started as leaders of their own process group so that a stop
//! reaches wrappers (`uv run ...`) and the interpreters they exec or fork.
use std::{io, process::Command};

/// Prepares `command` so the spawned worker leads a fresh process group.
pub fn configure(command: &mut Command) {
    platform::configure(command);
}

/// Asks `pid` (and its process group) to shut down gracefully.
///
/// A process that is already gone is not an error.
pub fn terminate(pid: u32, service_name: &str) -> io::Result<()> {
    platform::terminate(pid, service_name)
}

/// Kills `pid` (and its process group) without giving it a chance to clean up.
pub fn force_kill(pid: u32, service_name: &str) -> io::Result<()> {
    platform::force_kill(pid, service_name)
}

#[cfg(unix)]
mod platform {
    use std::{io, os::unix::process::CommandExt, process::Command};

    use nix::{
        errno::Errno,
        sys::signal::{self, Signal},
        unistd::Pid,
    };
    use tracing::{debug, warn};

    pub fn configure(command: &mut Command) {
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    pub fn terminate(pid: u32, service_name: &str) -> io::Result<()> {
        send(pid, Signal::SIGTERM, service_name)
    }

    pub fn force_kill(pid: u32, service_name: &str) -> io::Result<()> {
        send(pid, Signal::SIGKILL, service_name)
    }

    fn send(pid: u32, sig: Signal, service_name: &str) -> io::Result<()> {
        let Ok(raw) = i32::try_from(pid) else {
            return Ok(());
        };
        if raw <= 0 {
            return Ok(());
        }
        let pid = Pid::from_raw(raw);

        let own_pgid = unsafe { libc::getpgid(0) };
        let child_pgid = unsafe { libc::getpgid(raw) };

        if child_pgid > 1 && child_pgid != own_pgid {
            match signal::killpg(Pid::from_raw(child_pgid), sig) {
                Ok(()) => debug!("Sent {sig} to process group {child_pgid} of '{service_name}'"),
                Err(Errno::ESRCH) => {}
                Err(Errno::EPERM) => warn!(
                    "Insufficient permissions to signal process group {child_pgid} for \
                     '{service_name}'. Falling back to direct signal"
                ),
                Err(err) => return Err(io::Error::from(err)),
            }
        }

        match signal::kill(pid, sig) {
            Ok(()) => {
                debug!("Sent {sig} to '{service_name}' (PID {pid})");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(io::Error::from(err)),
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::{
        io,
        os::windows::process::CommandExt,
        process::{Command, Stdio},
    };

    use tracing::debug;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    pub fn configure(command: &mut Command) {
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    pub fn terminate(pid: u32, service_name: &str) -> io::Result<()> {
        taskkill(pid, false, service_name)
    }

    pub fn force_kill(pid: u32, service_name: &str) -> io::Result<()> {
        taskkill(pid, true, service_name)
    }

    fn taskkill(pid: u32, force: bool, service_name: &str) -> io::Result<()> {
        let mut command = Command::new("taskkill");
        command.args(["/PID", &pid.to_string(), "/T"]);
        if force {
            command.arg("/F");
        }
        let status = command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        debug!("taskkill for '{service_name}' (PID {pid}, force={force}) exited with {status}");
        // taskkill also fails when the process is already gone; liveness
        // polling decides whether the stop worked.
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use std::{io, process::Command};

    pub fn configure(_command: &mut Command) {}

    pub fn terminate(_pid: u32, _service_name: &str) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process signalling is not supported on this platform",
        ))
    }

    pub fn force_kill(pid: u32, service_name: &str) -> io::Result<()> {
        terminate(pid, service_name)
    }
}
