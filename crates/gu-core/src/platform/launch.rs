//! Starting the updated application.

use super::{HostPlatform, PlatformError};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info};

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// What to start and where its output goes.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Script run to completion before the executable starts.
    pub launch_script: Option<PathBuf>,
    /// Directory receiving `stdout.log` / `stderr.log`; inherited when `None`.
    pub output_dir: Option<PathBuf>,
}

/// A started target process.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub executable: PathBuf,
    pub working_dir: PathBuf,
    pub stdout_log: Option<PathBuf>,
    pub stderr_log: Option<PathBuf>,
    child: Option<Child>,
}

impl ProcessHandle {
    pub(crate) fn from_child(child: Child, request: &LaunchRequest) -> Self {
        let logs = request.output_dir.as_ref();
        Self {
            pid: child.id(),
            executable: request.executable.clone(),
            working_dir: request.working_dir.clone(),
            stdout_log: logs.map(|d| d.join(STDOUT_LOG)),
            stderr_log: logs.map(|d| d.join(STDERR_LOG)),
            child: Some(child),
        }
    }

    /// Handle for a process this updater did not start.
    pub fn external(pid: u32, executable: PathBuf, working_dir: PathBuf) -> Self {
        Self {
            pid,
            executable,
            working_dir,
            stdout_log: None,
            stderr_log: None,
            child: None,
        }
    }

    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }
}

/// Result of a launch request.
#[derive(Debug)]
pub enum LaunchOutcome {
    Started(ProcessHandle),
    /// The host application relaunches itself; nothing to supervise.
    Deferred,
}

pub(crate) fn launch(host: HostPlatform, request: &LaunchRequest) -> Result<LaunchOutcome, PlatformError> {
    if matches!(host, HostPlatform::Android | HostPlatform::Ios) {
        info!(platform = %host, "launch deferred to the host application");
        return Ok(LaunchOutcome::Deferred);
    }

    if let Some(script) = &request.launch_script {
        run_script(host, script, &request.working_dir)?;
    }

    if !request.executable.exists() {
        return Err(PlatformError::Launch {
            executable: request.executable.clone(),
            message: "executable not found".to_string(),
        });
    }

    let mut command = if host == HostPlatform::MacOs
        && request.executable.extension().is_some_and(|e| e == "app")
    {
        let mut cmd = Command::new("open");
        cmd.arg("-W").arg("-a").arg(&request.executable);
        if !request.args.is_empty() {
            cmd.arg("--args").args(&request.args);
        }
        cmd
    } else {
        let mut cmd = Command::new(&request.executable);
        cmd.args(&request.args);
        cmd
    };
    command.current_dir(&request.working_dir).stdin(Stdio::null());

    if let Some(dir) = &request.output_dir {
        fs::create_dir_all(dir).map_err(|e| PlatformError::io(dir, e))?;
        let stdout = File::create(dir.join(STDOUT_LOG)).map_err(|e| PlatformError::io(dir, e))?;
        let stderr = File::create(dir.join(STDERR_LOG)).map_err(|e| PlatformError::io(dir, e))?;
        command.stdout(stdout).stderr(stderr);
    }

    let child = command.spawn().map_err(|e| PlatformError::Launch {
        executable: request.executable.clone(),
        message: e.to_string(),
    })?;
    let handle = ProcessHandle::from_child(child, request);
    info!(
        pid = handle.pid,
        executable = %request.executable.display(),
        "target launched"
    );
    Ok(LaunchOutcome::Started(handle))
}

fn run_script(host: HostPlatform, script: &Path, working_dir: &Path) -> Result<(), PlatformError> {
    let mut command = match host {
        HostPlatform::Windows => {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(script);
            cmd
        }
        _ => {
            let mut cmd = Command::new("sh");
            cmd.arg(script);
            cmd
        }
    };
    debug!(script = %script.display(), "running launch script");
    let status = command
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .status()
        .map_err(|e| PlatformError::Launch {
            executable: script.to_path_buf(),
            message: e.to_string(),
        })?;
    if !status.success() {
        return Err(PlatformError::Launch {
            executable: script.to_path_buf(),
            message: format!("launch script exited with {}", status),
        });
    }
    Ok(())
}
