//! Liveness probes for a supervised process.

use std::io;
use std::process::{Child, ExitStatus};

/// How a process ended, as far as the probe can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDetail {
    Code(i32),
    Signal(i32),
    /// The process is gone but its status is not observable.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Running,
    Exited(ExitDetail),
}

/// Polls one process without blocking.
pub trait ProcessProbe {
    fn pid(&self) -> u32;
    fn poll(&mut self) -> io::Result<ProbeStatus>;
    /// Kill a hung process; best effort.
    fn terminate(&mut self);
}

fn detail_of(status: ExitStatus) -> ExitDetail {
    if let Some(code) = status.code() {
        return ExitDetail::Code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitDetail::Signal(signal);
        }
    }
    ExitDetail::Unknown
}

/// Probe for a child this process spawned; exit status is exact.
pub struct ChildProbe {
    child: Child,
}

impl ChildProbe {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl ProcessProbe for ChildProbe {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn poll(&mut self) -> io::Result<ProbeStatus> {
        Ok(match self.child.try_wait()? {
            Some(status) => ProbeStatus::Exited(detail_of(status)),
            None => ProbeStatus::Running,
        })
    }

    fn terminate(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Probe for a process found by pid; exit status is unknown.
pub struct PidProbe {
    pid: u32,
    #[cfg(unix)]
    raw: libc::pid_t,
}

impl PidProbe {
    /// Attach to `pid`.
    ///
    /// `0` and values past `i32::MAX` do not name one process (`kill` reads
    /// them as a process group), so they fail with `InvalidInput`. Platforms
    /// without a liveness check fail with `Unsupported`.
    pub fn new(pid: u32) -> io::Result<Self> {
        let raw = i32::try_from(pid)
            .ok()
            .filter(|raw| *raw > 0)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("pid {} does not name a single process", pid),
                )
            })?;
        #[cfg(unix)]
        {
            Ok(Self { pid, raw })
        }
        #[cfg(not(unix))]
        {
            let _ = raw;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "attaching to a running process is not supported on this platform",
            ))
        }
    }

    /// Whether the process currently exists.
    pub fn is_alive(&self) -> bool {
        #[cfg(unix)]
        {
            // SAFETY: signal 0 only checks existence and permission.
            let result = unsafe { libc::kill(self.raw, 0) };
            if result == 0 {
                return !is_zombie(self.pid);
            }
            // EPERM: exists, owned by someone else.
            io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }
        #[cfg(not(unix))]
        {
            // Unreachable: `new` refuses non-unix platforms.
            true
        }
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Format: pid (comm) state ...
    stat.rfind(')')
        .and_then(|end| stat.get(end + 2..))
        .and_then(|rest| rest.chars().next())
        == Some('Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

impl ProcessProbe for PidProbe {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn poll(&mut self) -> io::Result<ProbeStatus> {
        Ok(if self.is_alive() {
            ProbeStatus::Running
        } else {
            ProbeStatus::Exited(ExitDetail::Unknown)
        })
    }

    fn terminate(&mut self) {
        #[cfg(unix)]
        // SAFETY: `raw` is a positive pid checked in `new`.
        unsafe {
            libc::kill(self.raw, libc::SIGKILL);
        }
    }
}
