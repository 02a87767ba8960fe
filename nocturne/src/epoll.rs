//! Thin façade over epoll.
//!
//! Registration (`add`/`modify`/`remove`) is thread-safe per fd, which is
//! what lets worker threads re-arm their own connection after finishing a
//! task instead of round-tripping through the reactor.

use std::io;
use std::os::unix::io::RawFd;

pub const EV_IN: u32 = libc::EPOLLIN as u32;
pub const EV_OUT: u32 = libc::EPOLLOUT as u32;
pub const EV_RDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EV_HUP: u32 = libc::EPOLLHUP as u32;
pub const EV_ERR: u32 = libc::EPOLLERR as u32;
pub const EV_ONESHOT: u32 = libc::EPOLLONESHOT as u32;
pub const EV_ET: u32 = libc::EPOLLET as u32;

/// One ready entry out of `Epoller::wait`.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Event(libc::epoll_event);

impl Event {
    pub fn zeroed() -> Self {
        Event(libc::epoll_event { events: 0, u64: 0 })
    }

    pub fn fd(&self) -> RawFd {
        let e = self.0;
        e.u64 as RawFd
    }

    pub fn mask(&self) -> u32 {
        let e = self.0;
        e.events
    }
}

pub struct Epoller {
    epfd: RawFd,
}

impl Epoller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    /// Register `fd` with the given event mask. The fd doubles as the token.
    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    /// Re-arm `fd` with a new mask (also resets one-shot disarm).
    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Already gone is fine: close() drops fds from the set itself.
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Block up to `timeout_ms` (-1 = indefinitely, 0 = poll) and fill
    /// `events` with the ready entries. EINTR reports zero events.
    pub fn wait(&self, events: &mut [Event], timeout_ms: i32) -> io::Result<usize> {
        let rc = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr() as *mut libc::epoll_event,
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(rc as usize)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_reports_readable_pipe() {
        let ep = Epoller::new().unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        ep.add(rd, EV_IN).unwrap();
        let mut events = vec![Event::zeroed(); 8];

        // Nothing written yet: a zero-timeout poll sees nothing.
        assert_eq!(ep.wait(&mut events, 0).unwrap(), 0);

        unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) };
        let n = ep.wait(&mut events, 100).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].fd(), rd);
        assert!(events[0].mask() & EV_IN != 0);

        ep.modify(rd, EV_IN | EV_ONESHOT).unwrap();
        ep.remove(rd).unwrap();
        // Removing twice is tolerated.
        ep.remove(rd).unwrap();

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
