//! Thin wrapper over the kernel's readiness multiplexer (epoll).
//!
//! Only the socket reactor touches this. Registrations always watch for
//! readability; write interest is toggled on demand. Each registration
//! carries a `u64` token that comes back with the event.

use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::unistd::close;
use std::os::unix::io::RawFd;

pub const MAX_EVENT: usize = 64;

#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub token: u64,
    pub read: bool,
    pub write: bool,
}

pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> nix::Result<Poller> {
        let epfd = epoll_create1(EpollCreateFlags::empty())?;
        Ok(Poller { epfd })
    }

    pub fn add(&self, fd: RawFd, token: u64) -> nix::Result<()> {
        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN, token);
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut ev)
    }

    /// Keep read interest, enable or disable write interest.
    pub fn set_write(&self, fd: RawFd, token: u64, enable: bool) -> nix::Result<()> {
        let flags = if enable {
            EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT
        } else {
            EpollFlags::EPOLLIN
        };
        let mut ev = EpollEvent::new(flags, token);
        epoll_ctl(self.epfd, EpollOp::EpollCtlMod, fd, &mut ev)
    }

    pub fn del(&self, fd: RawFd) {
        let _ = epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None::<&mut EpollEvent>);
    }

    /// Block until something is ready; translate into `out`. Returns the
    /// number of events filled in.
    pub fn wait(&self, out: &mut [Event]) -> nix::Result<usize> {
        let mut raw = [EpollEvent::empty(); MAX_EVENT];
        let max = out.len().min(MAX_EVENT);
        let n = epoll_wait(self.epfd, &mut raw[..max], -1)?;
        for i in 0..n {
            let flags = raw[i].events();
            out[i] = Event {
                token: raw[i].data(),
                read: flags.intersects(
                    EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR,
                ),
                write: flags.contains(EpollFlags::EPOLLOUT),
            };
        }
        Ok(n)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let _ = close(self.epfd);
    }
}
