//! What the control panel does, independent of how it is drawn.
//!
//! Each [`Action`] runs on its own worker thread and reports back through a
//! channel; the UI only ever sees [`ActionOutcome`] values.

use crate::scheduler::DEFAULT_TIME;
use crate::telemetry::{catch_panic, panic_message};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use tracing::{info, warn};

pub const AGENT_LABEL: &str = "com.whimsy.daily";
pub const INSTALLER_SCRIPT: &str = "install_whimsy.sh";
pub const PROJECT_DIR_VAR: &str = "WHIMSY_PROJECT_DIR";

#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} failed ({status})")]
    CommandFailed { program: String, status: ExitStatus },
    #[error("home directory not found")]
    NoHome,
    #[error("missing whimsy binary at {}", .0.display())]
    MissingBinary(PathBuf),
    #[error("missing installer script at {}", .0.display())]
    MissingInstaller(PathBuf),
    #[error("action panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Where the panel finds the things it launches.
#[derive(Debug, Clone)]
pub struct Layout {
    pub project_dir: PathBuf,
    pub cli_binary: PathBuf,
    pub installer: PathBuf,
    pub descriptor: PathBuf,
    /// Service-manager command that unloads the agent; the descriptor path is appended.
    pub unload: Vec<OsString>,
}

impl Layout {
    /// The project directory is `WHIMSY_PROJECT_DIR` if set, else the nearest
    /// ancestor of the panel executable holding the installer script, else
    /// the working directory.
    pub fn detect() -> Result<Self, PanelError> {
        let exe = std::env::current_exe()?;
        let project_dir = match std::env::var_os(PROJECT_DIR_VAR) {
            Some(dir) => PathBuf::from(dir),
            None => match find_project_dir(&exe) {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            },
        };
        let cli_binary = exe.with_file_name(format!("whimsy{}", std::env::consts::EXE_SUFFIX));
        let home = dirs::home_dir().ok_or(PanelError::NoHome)?;

        Ok(Self {
            installer: project_dir.join(INSTALLER_SCRIPT),
            descriptor: home
                .join("Library")
                .join("LaunchAgents")
                .join(format!("{AGENT_LABEL}.plist")),
            unload: vec!["launchctl".into(), "unload".into()],
            project_dir,
            cli_binary,
        })
    }

    /// Both things the panel launches must exist before it opens.
    pub fn ensure_cli(&self) -> Result<(), PanelError> {
        if !self.cli_binary.exists() {
            return Err(PanelError::MissingBinary(self.cli_binary.clone()));
        }
        if !self.installer.exists() {
            return Err(PanelError::MissingInstaller(self.installer.clone()));
        }
        Ok(())
    }

    pub fn send_now_command(&self) -> Command {
        let mut cmd = Command::new(&self.cli_binary);
        cmd.arg("--send-now").current_dir(&self.project_dir);
        cmd
    }

    pub fn install_command(&self) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg(&self.installer)
            .args(["--launchd", "--install", "--binary"])
            .arg(&self.cli_binary)
            .args(["--time", DEFAULT_TIME, "--project-dir"])
            .arg(&self.project_dir)
            .current_dir(&self.project_dir);
        cmd
    }

    fn unload_command(&self) -> Option<Command> {
        let (program, args) = self.unload.split_first()?;
        let mut cmd = Command::new(program);
        cmd.args(args).arg(&self.descriptor);
        Some(cmd)
    }
}

/// Nearest ancestor of `start` that contains the installer script.
pub fn find_project_dir(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(INSTALLER_SCRIPT).is_file())
        .map(Path::to_path_buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Unknown,
    Installed,
    NotInstalled,
}

impl ScheduleStatus {
    /// The descriptor file existing is the only signal.
    pub fn of_descriptor(descriptor: &Path) -> Self {
        if descriptor.exists() {
            Self::Installed
        } else {
            Self::NotInstalled
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "Checking status...",
            Self::Installed => "Status: Daily Schedule INSTALLED ✅",
            Self::NotInstalled => "Status: Daily Schedule NOT INSTALLED",
        }
    }

    pub fn can_install(self) -> bool {
        self == Self::NotInstalled
    }

    pub fn can_uninstall(self) -> bool {
        self == Self::Installed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SendNow,
    Install,
    Uninstall,
}

impl Action {
    /// Question to put to the user before starting, if any.
    pub fn confirmation(self) -> Option<&'static str> {
        match self {
            Self::SendNow => Some("Send a love note immediately?"),
            Self::Install => None,
            Self::Uninstall => Some("Stop the daily emails?"),
        }
    }

    pub fn success_message(self) -> &'static str {
        match self {
            Self::SendNow => "Email sent successfully!",
            Self::Install => "Daily schedule installed for 08:00!",
            Self::Uninstall => "Schedule uninstalled.",
        }
    }

    /// Blocking; meant for a worker thread.
    pub fn perform(self, layout: &Layout) -> Result<(), PanelError> {
        match self {
            Self::SendNow => run_checked(&mut layout.send_now_command()),
            Self::Install => run_checked(&mut layout.install_command()),
            Self::Uninstall => uninstall(layout),
        }
    }
}

#[derive(Debug)]
pub struct ActionOutcome {
    pub action: Action,
    pub result: Result<(), PanelError>,
}

/// Run `action` on a fresh thread. `wake` is called once the outcome is
/// queued so the UI can redraw.
pub fn spawn(
    action: Action,
    layout: Layout,
    wake: impl FnOnce() + Send + 'static,
) -> Receiver<ActionOutcome> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        info!(?action, "Starting panel action");
        let result = catch_panic(|| action.perform(&layout))
            .unwrap_or_else(|payload| Err(PanelError::Panicked(panic_message(payload.as_ref()))));
        match &result {
            Ok(()) => info!(?action, "Panel action finished"),
            Err(e) => warn!(?action, error = %e, "Panel action failed"),
        }
        let _ = tx.send(ActionOutcome { action, result });
        wake();
    });
    rx
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

fn run_checked(cmd: &mut Command) -> Result<(), PanelError> {
    let program = program_name(cmd);
    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|source| PanelError::Spawn {
            program: program.clone(),
            source,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        warn!(
            %program,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Command exited unsuccessfully"
        );
        Err(PanelError::CommandFailed {
            program,
            status: output.status,
        })
    }
}

/// Unload the agent, then delete its descriptor.
///
/// An unload that fails (not loaded, or no service manager at all) is logged
/// and ignored; only failing to delete the descriptor is an error.
fn uninstall(layout: &Layout) -> Result<(), PanelError> {
    if let Some(mut cmd) = layout.unload_command() {
        let program = program_name(&cmd);
        match cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(%program, %status, "Unload reported failure; continuing"),
            Err(e) => warn!(%program, error = %e, "Unload could not run; continuing"),
        }
    }

    match std::fs::remove_file(&layout.descriptor) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
