//! Pipe-based wakeup channel.
//!
//! One byte written wakes one wait. Notifications never get lost: a byte
//! written before the waiter blocks is consumed by its next wait. Both ends
//! only use `read`/`write`, so notifying is async-signal-safe.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::HalResult;

/// A unidirectional wakeup channel backed by a pipe.
#[derive(Debug)]
pub struct Pipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Pipe {
    /// Create a new pipe.
    pub fn new() -> HalResult<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for both descriptors
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Wake one waiter.
    pub fn notify(&self) {
        let byte = 0u8;
        loop {
            // SAFETY: writing one byte from a valid buffer
            let rv = unsafe { libc::write(self.write_fd, (&byte as *const u8).cast(), 1) };
            if rv == 1 || !interrupted(rv) {
                return;
            }
        }
    }

    /// Block until notified.
    pub fn wait(&self) {
        let mut byte = 0u8;
        loop {
            // SAFETY: reading one byte into a valid buffer
            let rv = unsafe { libc::read(self.read_fd, (&mut byte as *mut u8).cast(), 1) };
            if rv == 1 || !interrupted(rv) {
                return;
            }
        }
    }

    /// Block until notified or until `timeout` elapses. Returns whether a
    /// notification was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut poll = libc::pollfd {
            fd: self.read_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        loop {
            // SAFETY: one valid pollfd
            let rv = unsafe { libc::poll(&mut poll, 1, millis) };
            if rv > 0 {
                self.wait();
                return true;
            }
            if rv == 0 || !interrupted(rv as isize) {
                return false;
            }
        }
    }
}

fn interrupted(rv: isize) -> bool {
    rv < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted
}

impl Drop for Pipe {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned by this pipe
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn notify_before_wait_is_not_lost() {
        let pipe = Pipe::new().unwrap();
        pipe.notify();
        pipe.notify();
        pipe.wait();
        pipe.wait();
        assert!(!pipe.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn wakes_waiting_thread() {
        let pipe = Arc::new(Pipe::new().unwrap());
        let waiter = {
            let pipe = Arc::clone(&pipe);
            std::thread::spawn(move || pipe.wait())
        };
        pipe.notify();
        waiter.join().unwrap();
    }
}
