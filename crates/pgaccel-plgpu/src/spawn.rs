//! Child-process supervision.
//!
//! The compiled procedure runs in a forked child. The child closes every
//! inherited descriptor above stderr and execs the binary; the parent reaps
//! it with a WNOHANG loop interleaved with bounded latch waits, escalating
//! host cancellation to SIGKILL. A SIGCHLD handler only wakes the session
//! latch; the wait loop does the actual reap.

use std::ffi::CString;
use std::io;
use std::path::Path;
use std::time::Duration;

use pgaccel_core::interrupt::check_for_interrupts;
use pgaccel_core::latch::session_latch;

use crate::error::PlGpuError;

/// Classified child outcome: exit 0 left a result in the result segment,
/// exit 1 stands for the null value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildStatus {
    Value,
    Null,
}

/// Run `binary [-a <argseg>] [-r <resultseg>] -- <token>...` to completion.
pub fn exec_procedure(
    binary: &Path,
    arg_segment: Option<&str>,
    result_segment: Option<&str>,
    tokens: &[String],
) -> Result<ChildStatus, PlGpuError> {
    let command = cstring(&binary.display().to_string())?;
    let mut argv_owned: Vec<CString> = Vec::with_capacity(tokens.len() + 6);
    argv_owned.push(command.clone());
    if let Some(name) = arg_segment {
        argv_owned.push(cstring("-a")?);
        argv_owned.push(cstring(name)?);
    }
    if let Some(name) = result_segment {
        argv_owned.push(cstring("-r")?);
        argv_owned.push(cstring(name)?);
    }
    argv_owned.push(cstring("--")?);
    for token in tokens {
        argv_owned.push(cstring(token)?);
    }
    let mut argv: Vec<*const libc::c_char> = argv_owned.iter().map(|s| s.as_ptr()).collect();
    argv.push(std::ptr::null());

    // Everything the child touches is prepared before fork(2): the fd list,
    // the argv vector and the error message all exist already, so the child
    // only performs async-signal-safe calls.
    let inherited_fds = list_open_fds();

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(PlGpuError::ChildSpawnFailure(io::Error::last_os_error()));
    }
    if pid == 0 {
        exec_child(&command, &argv, &inherited_fds);
    }

    let status = wait_child(pid)?;
    if libc::WIFSIGNALED(status) {
        return Err(PlGpuError::ScriptSignalled(libc::WTERMSIG(status)));
    }
    match libc::WEXITSTATUS(status) {
        0 => Ok(ChildStatus::Value),
        1 => Ok(ChildStatus::Null),
        code => Err(PlGpuError::ScriptAbnormalExit(code)),
    }
}

/// Snapshot of the process's open descriptors above stderr, taken from the
/// fd directory before forking.
fn list_open_fds() -> Vec<libc::c_int> {
    let mut fds = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<libc::c_int>() {
                if fd > 2 {
                    fds.push(fd);
                }
            }
        }
    }
    fds
}

fn exec_child(command: &CString, argv: &[*const libc::c_char], fds: &[libc::c_int]) -> ! {
    // Nothing except stdin/stdout/stderr may leak into the procedure.
    for &fd in fds {
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }

    unsafe {
        libc::execv(command.as_ptr(), argv.as_ptr());
        let msg = b"failed on execv of GPU procedure\n";
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(2);
    }
}

extern "C" fn sigchld_handler(_signo: libc::c_int) {
    // wake the wait loop; reaping happens there
    session_latch().set();
}

fn install_sigchld() -> Result<libc::sigaction, PlGpuError> {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = sigchld_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART;
    let mut saved: libc::sigaction = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigaction(libc::SIGCHLD, &action, &mut saved) } != 0 {
        return Err(PlGpuError::ChildWaitFailure(io::Error::last_os_error()));
    }
    Ok(saved)
}

fn restore_sigchld(saved: &libc::sigaction) {
    unsafe {
        libc::sigaction(libc::SIGCHLD, saved, std::ptr::null_mut());
    }
}

fn wait_child(child: libc::pid_t) -> Result<libc::c_int, PlGpuError> {
    // Touch the latch before the handler can fire.
    let latch = session_latch();
    let saved = install_sigchld()?;

    let result = loop {
        if let Err(cancel) = check_for_interrupts() {
            unsafe {
                libc::kill(child, libc::SIGKILL);
                // reap so the error path leaves no zombie behind
                libc::waitpid(child, std::ptr::null_mut(), 0);
            }
            break Err(PlGpuError::Core(cancel));
        }

        let mut status: libc::c_int = 0;
        let rv = unsafe { libc::waitpid(child, &mut status, libc::WNOHANG) };
        if rv > 0 {
            if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
                break Ok(status);
            }
        } else if rv < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            break Err(PlGpuError::ChildWaitFailure(err));
        }

        latch.wait(Duration::from_secs(5));
        latch.reset();
    };

    restore_sigchld(&saved);
    result
}

fn cstring(text: &str) -> Result<CString, PlGpuError> {
    CString::new(text).map_err(|_| {
        PlGpuError::ChildSpawnFailure(io::Error::from(io::ErrorKind::InvalidInput))
    })
}
