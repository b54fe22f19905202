//! Self-pipe latch.
//!
//! `set()` only writes one byte to a non-blocking pipe, so it is safe to call
//! from a signal handler; the waiting side polls the read end with a timeout.

use std::io;
use std::sync::OnceLock;
use std::time::Duration;

pub struct Latch {
    read_fd: libc::c_int,
    write_fd: libc::c_int,
}

impl Latch {
    pub fn new() -> io::Result<Latch> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Latch {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Wake any waiter. Async-signal-safe: a single write(2), EAGAIN ignored
    /// (the pipe already holds a wakeup byte).
    pub fn set(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    /// Wait until the latch is set or `timeout` elapses. Returns true when
    /// the latch was set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.read_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        rc > 0 && (pfd.revents & libc::POLLIN) != 0
    }

    /// Drain pending wakeup bytes so the next wait blocks again.
    pub fn reset(&self) {
        let mut buf = [0u8; 16];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Latch {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

// The fds are plain integers; writes from other threads/handlers are the point.
unsafe impl Send for Latch {}
unsafe impl Sync for Latch {}

static SESSION_LATCH: OnceLock<Latch> = OnceLock::new();

/// The session latch shared between the child-wait loop and signal handlers.
/// Initialized on first use; callers installing signal handlers must touch it
/// before the handler can fire.
pub fn session_latch() -> &'static Latch {
    SESSION_LATCH.get_or_init(|| Latch::new().expect("failed to create session latch pipe"))
}
