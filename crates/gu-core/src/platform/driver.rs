//! Driver (kernel artifact) lifecycle through host commands.
//!
//! | platform | install                       | uninstall                         | export                         |
//! |----------|-------------------------------|-----------------------------------|--------------------------------|
//! | Windows  | `pnputil /add-driver <inf> /install` | `pnputil /delete-driver <name> /uninstall /force` | `dism /online /export-driver /destination:<dir>` |
//! | Linux    | `insmod <ko>`                 | `modprobe -r <name>`              | (none)                         |
//! | macOS    | `kextload <kext>`             | `kextunload -b <name>`            | (none)                         |
//!
//! Mobile platforms have no driver support.

use super::HostPlatform;
use crate::executor::InterpretError;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

/// Captured result of a host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

/// Runs host commands; swapped out in tests.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs commands with `std::process::Command`.
#[derive(Debug, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Records commands and answers with canned output.
#[derive(Debug, Default)]
pub struct RecordingCommandRunner {
    calls: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, CommandOutput)>>,
}

impl RecordingCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands whose rendered line starts with `prefix`.
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push((prefix.to_string(), output));
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl CommandRunner for RecordingCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line.clone());
        }
        let canned = self.responses.lock().ok().and_then(|responses| {
            responses
                .iter()
                .rev()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, out)| out.clone())
        });
        Ok(canned.unwrap_or(CommandOutput {
            success: true,
            status: "exit status: 0".to_string(),
            ..Default::default()
        }))
    }
}

/// Platform-specific driver operations.
#[derive(Clone)]
pub struct DriverRegistrar {
    host: HostPlatform,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for DriverRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistrar").field("host", &self.host).finish()
    }
}

impl DriverRegistrar {
    pub fn new(host: HostPlatform, runner: Arc<dyn CommandRunner>) -> Self {
        Self { host, runner }
    }

    /// Driver file extension, `None` where drivers are unsupported.
    pub fn extension(&self) -> Option<&'static str> {
        match self.host {
            HostPlatform::Windows => Some("inf"),
            HostPlatform::Linux => Some("ko"),
            HostPlatform::MacOs => Some("kext"),
            HostPlatform::Android | HostPlatform::Ios => None,
        }
    }

    /// Name the host knows a driver file by.
    pub fn artifact_name(&self, source: &Path) -> String {
        match self.host {
            // pnputil addresses drivers by their inf file name.
            HostPlatform::Windows => source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            _ => source
                .file_stem()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    pub fn install(&self, source: &Path) -> Result<(), InterpretError> {
        let src = source.to_string_lossy().into_owned();
        match self.host {
            HostPlatform::Windows => self.exec("pnputil", &["/add-driver", &src, "/install"]),
            HostPlatform::Linux => self.exec("insmod", &[&src]),
            HostPlatform::MacOs => self.exec("kextload", &[&src]),
            HostPlatform::Android | HostPlatform::Ios => Err(self.unsupported("driver install")),
        }
    }

    /// Remove a registered driver. A driver that is not registered is left alone.
    pub fn uninstall(&self, name: &str) -> Result<(), InterpretError> {
        if !self.is_registered(name)? {
            return Ok(());
        }
        match self.host {
            HostPlatform::Windows => {
                self.exec("pnputil", &["/delete-driver", name, "/uninstall", "/force"])
            }
            HostPlatform::Linux => self.exec("modprobe", &["-r", name]),
            HostPlatform::MacOs => self.exec("kextunload", &["-b", name]),
            HostPlatform::Android | HostPlatform::Ios => Err(self.unsupported("driver uninstall")),
        }
    }

    /// Export the installed copy of `name` into `destination`.
    ///
    /// Returns the exported file when the platform supports export.
    pub fn export(&self, name: &str, destination: &Path) -> Result<Option<PathBuf>, InterpretError> {
        match self.host {
            HostPlatform::Windows => {
                std::fs::create_dir_all(destination)
                    .map_err(|e| InterpretError::io(destination, e))?;
                let dest = format!("/destination:{}", destination.display());
                self.exec("dism", &["/online", "/export-driver", &dest])?;
                let exported = destination.join(name);
                Ok(exported.exists().then_some(exported))
            }
            _ => Ok(None),
        }
    }

    pub fn is_registered(&self, name: &str) -> Result<bool, InterpretError> {
        match self.host {
            HostPlatform::Windows => {
                let out = self.query("pnputil", &["/enum-drivers"])?;
                Ok(out.stdout.to_lowercase().contains(&name.to_lowercase()))
            }
            HostPlatform::Linux => {
                let out = self.query("lsmod", &[])?;
                Ok(out
                    .stdout
                    .lines()
                    .skip(1)
                    .any(|line| line.split_whitespace().next() == Some(name)))
            }
            HostPlatform::MacOs => {
                let out = self.query("kextstat", &["-l", "-b", name])?;
                Ok(!out.stdout.trim().is_empty())
            }
            HostPlatform::Android | HostPlatform::Ios => Ok(false),
        }
    }

    fn unsupported(&self, what: &str) -> InterpretError {
        InterpretError::Unsupported(format!("{} on {}", what, self.host))
    }

    fn query(&self, program: &str, args: &[&str]) -> Result<CommandOutput, InterpretError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner
            .run(program, &args)
            .map_err(|e| InterpretError::io(program, e))
    }

    fn exec(&self, program: &str, args: &[&str]) -> Result<(), InterpretError> {
        let out = self.query(program, args)?;
        if out.success {
            Ok(())
        } else {
            Err(InterpretError::Command {
                program: program.to_string(),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}
