//! Single-instance bookkeeping and signal-driven control of a running preview.

use anyhow::{bail, Context, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::ffi::c_int;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

const PROCESS_NAME: &str = "live-preview";

static STOP: AtomicBool = AtomicBool::new(false);
static PAUSE: AtomicBool = AtomicBool::new(false);
static RESUME: AtomicBool = AtomicBool::new(false);
static TOGGLE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Stop,
    Pause,
    Resume,
    Toggle,
}

impl ControlRequest {
    pub fn signal(self) -> Signal {
        match self {
            ControlRequest::Stop => Signal::SIGTERM,
            ControlRequest::Pause => Signal::SIGUSR1,
            ControlRequest::Resume => Signal::SIGUSR2,
            ControlRequest::Toggle => Signal::SIGHUP,
        }
    }

    fn flag(self) -> &'static AtomicBool {
        match self {
            ControlRequest::Stop => &STOP,
            ControlRequest::Pause => &PAUSE,
            ControlRequest::Resume => &RESUME,
            ControlRequest::Toggle => &TOGGLE,
        }
    }

    const ALL: [ControlRequest; 4] = [
        ControlRequest::Stop,
        ControlRequest::Pause,
        ControlRequest::Resume,
        ControlRequest::Toggle,
    ];
}

extern "C" fn on_signal(signum: c_int) {
    // only atomics in here
    for request in ControlRequest::ALL {
        if request.signal() as c_int == signum {
            request.flag().store(true, Ordering::SeqCst);
        }
    }
}

/// Routes SIGTERM, SIGUSR1, SIGUSR2 and SIGHUP to [`take_requests`].
pub fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for request in ControlRequest::ALL {
        unsafe { signal::sigaction(request.signal(), &action) }
            .with_context(|| format!("Failed to install {} handler", request.signal()))?;
    }
    Ok(())
}

/// Requests received since the last call, in a fixed order.
pub fn take_requests() -> Vec<ControlRequest> {
    ControlRequest::ALL
        .into_iter()
        .filter(|r| r.flag().swap(false, Ordering::SeqCst))
        .collect()
}

pub fn pid_file_path() -> PathBuf {
    // XDG_RUNTIME_DIR is per-user with proper permissions
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir).join(format!("{PROCESS_NAME}.pid"));
    }
    if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(dir).join(format!("{PROCESS_NAME}.pid"));
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(format!(".local/state/{PROCESS_NAME}.pid"));
    }
    std::env::temp_dir().join(format!("{PROCESS_NAME}.pid"))
}

pub fn write_pid_file() -> Result<()> {
    let path = pid_file_path();
    fs::write(&path, format!("{}\n", process::id()))
        .with_context(|| format!("Failed to write {}", path.display()))
}

pub fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_preview_process(pid: Pid) -> bool {
    fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|comm| comm.trim() == PROCESS_NAME)
        .unwrap_or(false)
}

/// PID of a live instance, removing the PID file if it is stale.
pub fn running_instance() -> Option<Pid> {
    let pid = fs::read_to_string(pid_file_path())
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()
        .map(Pid::from_raw);
    match pid {
        Some(pid) if is_preview_process(pid) && signal::kill(pid, None).is_ok() => Some(pid),
        _ => {
            remove_pid_file();
            None
        }
    }
}

/// Delivers `request` to the running instance.
pub fn send(request: ControlRequest) -> Result<()> {
    let Some(pid) = running_instance() else {
        bail!("No running {PROCESS_NAME} instance found");
    };
    signal::kill(pid, request.signal())
        .with_context(|| format!("Failed to signal PID {pid}"))?;
    tracing::info!(%pid, ?request, "sent control request");
    Ok(())
}
