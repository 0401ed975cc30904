//! `select(2)` backend.
//!
//! Interest lives in two descriptor bitmaps kept by this process. Every wait
//! copies both masters, hands them to the kernel and scans `0..=max_fd` for
//! set bits, so cost grows with the highest registered descriptor rather
//! than with the number of ready ones. Level-triggered.

use super::{close_not_registrable, Backend, Readiness};
use crate::runtime::interest::Interest;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

const FD_SETSIZE: usize = libc::FD_SETSIZE as usize;

pub struct SelectBackend {
    read_set: libc::fd_set,
    write_set: libc::fd_set,
    /// Token for each registered descriptor, indexed by descriptor.
    tokens: Vec<Option<usize>>,
    /// Highest registered descriptor, -1 when empty.
    max_fd: RawFd,
}

impl SelectBackend {
    pub fn new() -> Self {
        // SAFETY: fd_set is plain data; FD_ZERO initializes it fully.
        let (read_set, write_set) = unsafe {
            let mut read_set: libc::fd_set = mem::zeroed();
            let mut write_set: libc::fd_set = mem::zeroed();
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            (read_set, write_set)
        };

        Self {
            read_set,
            write_set,
            tokens: vec![None; FD_SETSIZE],
            max_fd: -1,
        }
    }

    /// Number of registered descriptors.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tokens.iter().filter(|t| t.is_some()).count()
    }

    fn slot(fd: RawFd) -> io::Result<usize> {
        if fd < 0 || fd as usize >= FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {fd} outside select range (FD_SETSIZE {FD_SETSIZE})"),
            ));
        }
        Ok(fd as usize)
    }

    fn apply(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if interest.is_close() {
            return Err(close_not_registrable());
        }
        // SAFETY: fd was checked against FD_SETSIZE by the caller.
        unsafe {
            if interest.wants_read() {
                libc::FD_SET(fd, &mut self.read_set);
            } else {
                libc::FD_CLR(fd, &mut self.read_set);
            }
            if interest.wants_write() {
                libc::FD_SET(fd, &mut self.write_set);
            } else {
                libc::FD_CLR(fd, &mut self.write_set);
            }
        }
        Ok(())
    }

    fn not_registered(fd: RawFd) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("descriptor {fd} is not registered"),
        )
    }
}

impl Default for SelectBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SelectBackend {
    fn register(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let slot = Self::slot(fd)?;
        if self.tokens[slot].is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} already registered"),
            ));
        }

        self.apply(fd, interest)?;
        self.tokens[slot] = Some(token);
        self.max_fd = self.max_fd.max(fd);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let slot = Self::slot(fd)?;
        if self.tokens[slot] != Some(token) {
            return Err(Self::not_registered(fd));
        }
        self.apply(fd, interest)
    }

    fn deregister(&mut self, fd: RawFd, token: usize) -> io::Result<()> {
        let slot = Self::slot(fd)?;
        if self.tokens[slot] != Some(token) {
            return Err(Self::not_registered(fd));
        }

        // SAFETY: fd is within FD_SETSIZE.
        unsafe {
            libc::FD_CLR(fd, &mut self.read_set);
            libc::FD_CLR(fd, &mut self.write_set);
        }
        self.tokens[slot] = None;

        while self.max_fd >= 0 && self.tokens[self.max_fd as usize].is_none() {
            self.max_fd -= 1;
        }
        Ok(())
    }

    fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();

        // select overwrites its arguments, so hand it copies of the masters.
        let mut read_set = self.read_set;
        let mut write_set = self.write_set;

        let mut tv = timeout.map(|d| libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        });
        let tv_ptr = match tv {
            Some(ref mut tv) => tv as *mut libc::timeval,
            None => ptr::null_mut(),
        };

        // SAFETY: both sets are initialized and outlive the call.
        let nready = unsafe {
            libc::select(
                self.max_fd + 1,
                &mut read_set,
                &mut write_set,
                ptr::null_mut(),
                tv_ptr,
            )
        };

        if nready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        // Every set bit counts once towards nready; stop once all are found.
        let mut remaining = nready as usize;
        let mut fd = 0;
        while fd <= self.max_fd && remaining > 0 {
            // SAFETY: fd <= max_fd < FD_SETSIZE.
            let (readable, writable) = unsafe {
                (
                    libc::FD_ISSET(fd, &read_set),
                    libc::FD_ISSET(fd, &write_set),
                )
            };
            remaining = remaining.saturating_sub(readable as usize + writable as usize);

            if readable || writable {
                if let Some(token) = self.tokens[fd as usize] {
                    ready.push(Readiness {
                        token,
                        readable,
                        writable,
                    });
                }
            }
            fd += 1;
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "select"
    }
}
