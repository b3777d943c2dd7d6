//! OS process boundary: liveness checks, signals and forced termination by PID.
//!
//! Children are spawned as process-group leaders, so signals go to the whole group
//! as well as the PID itself.

use std::time::Duration;

use serde::Serialize;

/// Signals devrack sends to processes it manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigTerm,
    SigKill,
}

impl ProcessSignal {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessSignal::SigTerm => "SIGTERM",
            ProcessSignal::SigKill => "SIGKILL",
        }
    }
}

/// How an out-of-band termination ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminateOutcome {
    /// Nothing was running under that PID.
    AlreadyExited,
    /// Exited after the graceful signal.
    Terminated,
    /// Needed the forced kill.
    Killed,
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence and permission.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(unix)]
pub fn send_signal(pid: u32, signal: ProcessSignal) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }
    let sig = match signal {
        ProcessSignal::SigTerm => libc::SIGTERM,
        ProcessSignal::SigKill => libc::SIGKILL,
    };
    unsafe {
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    const STILL_ACTIVE: u32 = 259;
    if pid == 0 {
        return false;
    }
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return false;
        }
        let mut code: u32 = 0;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        ok != 0 && code == STILL_ACTIVE
    }
}

#[cfg(windows)]
pub fn send_signal(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};
    unsafe {
        match signal {
            // Windows has no SIGTERM; CTRL_BREAK is the closest console signal we can emit.
            ProcessSignal::SigTerm => {
                let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
            }
            ProcessSignal::SigKill => {
                let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
                if handle != 0 {
                    let _ = TerminateProcess(handle, 1);
                    CloseHandle(handle);
                }
            }
        }
    }
}

#[cfg(all(not(unix), not(windows)))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(all(not(unix), not(windows)))]
pub fn send_signal(_pid: u32, _signal: ProcessSignal) {}

/// Polls liveness until the PID is gone or `timeout` elapses. Returns `true` if it exited.
pub async fn wait_for_pid_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Graceful signal, then a forced kill if the PID outlives `grace`.
///
/// Used for processes we do not own a handle to, such as orphans from a previous session.
pub async fn terminate_pid(pid: u32, grace: Duration) -> TerminateOutcome {
    if !is_process_alive(pid) {
        return TerminateOutcome::AlreadyExited;
    }
    send_signal(pid, ProcessSignal::SigTerm);
    if wait_for_pid_exit(pid, grace).await {
        return TerminateOutcome::Terminated;
    }
    send_signal(pid, ProcessSignal::SigKill);
    TerminateOutcome::Killed
}
