//! Receive-readiness back-ends.
//!
//! The measurement core never multiplexes anything itself; it calls
//! [`Receiver::recv`] and gets back one message. The primitive underneath
//! (a plain blocking call, a non-blocking spin, or a readiness
//! multiplexer wrapped around a non-blocking call) is chosen at init time
//! and makes no semantic difference, only a latency one.
//! Extra idle descriptors can be registered to grow the readiness set.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

/// Bound on every multiplexer wait; also the server's data-path receive
/// timeout, so its loop gets regular chances to poll the control channel.
pub const TIMEOUT_MS: u64 = 100;

/// Non-blocking receive attempts before a spinning receiver gives up.
const SPIN_BOUND: u32 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MuxerKind {
    #[default]
    None,
    Select,
    Poll,
    Epoll,
    EpollMod,
    EpollAddDel,
}

impl FromStr for MuxerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "select" => Ok(Self::Select),
            "poll" => Ok(Self::Poll),
            "epoll" => Ok(Self::Epoll),
            "epoll_mod" => Ok(Self::EpollMod),
            "epoll_adddel" => Ok(Self::EpollAddDel),
            other => Err(format!("unknown muxer '{}'", other)),
        }
    }
}

impl std::fmt::Display for MuxerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Select => "select",
            Self::Poll => "poll",
            Self::Epoll => "epoll",
            Self::EpollMod => "epoll_mod",
            Self::EpollAddDel => "epoll_adddel",
        };
        write!(f, "{}", name)
    }
}

/// How bytes come off the descriptor: `recv(2)` for sockets, `read(2)`
/// for pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvCall {
    Recv,
    Read,
}

pub struct Receiver {
    call: RecvCall,
    kind: MuxerKind,
    spin: bool,
    select_fds: Vec<RawFd>,
    select_max: RawFd,
    pollfds: Vec<libc::pollfd>,
    epoll: Option<OwnedFd>,
}

impl Receiver {
    pub fn new(kind: MuxerKind, spin: bool, call: RecvCall) -> Result<Self> {
        if spin && kind == MuxerKind::Select {
            bail!("spin is not supported with the select muxer");
        }

        let epoll = match kind {
            MuxerKind::Epoll | MuxerKind::EpollMod | MuxerKind::EpollAddDel => {
                let fd = unsafe { libc::epoll_create1(0) };
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Some(unsafe { OwnedFd::from_raw_fd(fd) })
            }
            _ => None,
        };

        Ok(Self {
            call,
            kind,
            spin,
            select_fds: Vec::new(),
            select_max: 0,
            pollfds: Vec::new(),
            epoll,
        })
    }

    /// Registers a descriptor with the readiness set. A no-op for the
    /// plain and spinning receivers, and for `epoll_adddel`, which
    /// registers around every receive instead.
    pub fn add(&mut self, fd: RawFd) -> Result<()> {
        match self.kind {
            MuxerKind::None | MuxerKind::EpollAddDel => {}
            MuxerKind::Select => {
                if fd >= libc::FD_SETSIZE as RawFd {
                    bail!("fd {} does not fit in a select set", fd);
                }
                self.select_fds.push(fd);
                self.select_max = self.select_max.max(fd);
            }
            MuxerKind::Poll => self.pollfds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            }),
            MuxerKind::Epoll | MuxerKind::EpollMod => {
                self.epoll_ctl(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32)?;
            }
        }
        Ok(())
    }

    /// Receives one message of up to `buf.len()` bytes. With `wait_all`
    /// (stream transports) it keeps reading until the buffer is full or
    /// the peer goes away. `Ok(0)` is end-of-stream; a timed-out wait or
    /// exhausted spin surfaces as `WouldBlock`.
    pub fn recv(&mut self, fd: RawFd, buf: &mut [u8], wait_all: bool) -> io::Result<usize> {
        match self.kind {
            MuxerKind::None if self.spin => self.recv_spin(fd, buf, wait_all),
            MuxerKind::None => self.recv_blocking(fd, buf, wait_all),
            MuxerKind::EpollMod => {
                self.epoll_ctl_io(libc::EPOLL_CTL_MOD, fd, libc::EPOLLIN as u32)?;
                let out = self.recv_muxed(fd, buf, wait_all);
                self.epoll_ctl_io(libc::EPOLL_CTL_MOD, fd, 0)?;
                out
            }
            MuxerKind::EpollAddDel => {
                self.epoll_ctl_io(libc::EPOLL_CTL_ADD, fd, libc::EPOLLIN as u32)?;
                let out = self.recv_muxed(fd, buf, wait_all);
                self.epoll_ctl_io(libc::EPOLL_CTL_DEL, fd, 0)?;
                out
            }
            _ => self.recv_muxed(fd, buf, wait_all),
        }
    }

    fn sys_recv(&self, fd: RawFd, buf: &mut [u8], dontwait: bool) -> io::Result<usize> {
        // The read(2) path has no per-call flag; non-blocking semantics
        // there require O_NONBLOCK on the descriptor, which the spin
        // setup arranges.
        let rc = unsafe {
            match self.call {
                RecvCall::Recv => libc::recv(
                    fd,
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    if dontwait { libc::MSG_DONTWAIT } else { 0 },
                ),
                RecvCall::Read => libc::read(fd, buf.as_mut_ptr().cast(), buf.len()),
            }
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    fn recv_blocking(&self, fd: RawFd, buf: &mut [u8], wait_all: bool) -> io::Result<usize> {
        let mut got = 0;
        loop {
            match self.sys_recv(fd, &mut buf[got..], false) {
                Ok(0) => return Ok(got),
                Ok(n) => {
                    got += n;
                    if !wait_all || got == buf.len() {
                        return Ok(got);
                    }
                }
                Err(e) => return if got > 0 { Ok(got) } else { Err(e) },
            }
        }
    }

    fn recv_spin(&self, fd: RawFd, buf: &mut [u8], wait_all: bool) -> io::Result<usize> {
        let mut got = 0;
        let mut attempts = 0u32;
        loop {
            match self.sys_recv(fd, &mut buf[got..], true) {
                Ok(0) => return Ok(got),
                Ok(n) => {
                    got += n;
                    if !wait_all || got == buf.len() {
                        return Ok(got);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    attempts += 1;
                    if attempts > SPIN_BOUND {
                        return if got > 0 { Ok(got) } else { Err(e) };
                    }
                }
                Err(e) => return if got > 0 { Ok(got) } else { Err(e) },
            }
        }
    }

    fn recv_muxed(&mut self, fd: RawFd, buf: &mut [u8], wait_all: bool) -> io::Result<usize> {
        let mut got = 0;
        loop {
            if !self.wait_readable(fd)? {
                return if got > 0 {
                    Ok(got)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            }
            match self.sys_recv(fd, &mut buf[got..], true) {
                Ok(0) => return Ok(got),
                Ok(n) => {
                    got += n;
                    if !wait_all || got == buf.len() {
                        return Ok(got);
                    }
                }
                // The multiplexer can report readiness that a racing
                // reader already consumed; treat it like a timeout.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if got > 0 { Ok(got) } else { Err(e) };
                }
                Err(e) => return if got > 0 { Ok(got) } else { Err(e) },
            }
        }
    }

    /// Waits up to [`TIMEOUT_MS`] for `fd` to become readable. A spinning
    /// receiver polls with a zero timeout until the same deadline.
    fn wait_readable(&mut self, fd: RawFd) -> io::Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(TIMEOUT_MS);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait_ms = if self.spin { 0 } else { remaining.as_millis() as i32 };
            let ready = match self.kind {
                MuxerKind::Select => self.select_once(fd, wait_ms)?,
                MuxerKind::Poll => self.poll_once(fd, wait_ms)?,
                _ => self.epoll_once(fd, wait_ms)?,
            };
            if ready {
                return Ok(true);
            }
            if remaining.is_zero() {
                return Ok(false);
            }
        }
    }

    fn select_once(&self, fd: RawFd, wait_ms: i32) -> io::Result<bool> {
        let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut set);
            for &reg in &self.select_fds {
                libc::FD_SET(reg, &mut set);
            }
        }
        let mut tv = libc::timeval {
            tv_sec: (wait_ms / 1000) as libc::time_t,
            tv_usec: (wait_ms % 1000) as libc::suseconds_t * 1000,
        };
        let rc = unsafe {
            libc::select(
                self.select_max + 1,
                &mut set,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            )
        };
        match rc {
            0 => Ok(false),
            n if n > 0 => Ok(unsafe { libc::FD_ISSET(fd, &set) }),
            _ => {
                let e = io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn poll_once(&mut self, fd: RawFd, wait_ms: i32) -> io::Result<bool> {
        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                wait_ms,
            )
        };
        match rc {
            0 => Ok(false),
            n if n > 0 => Ok(self
                .pollfds
                .iter()
                .any(|p| p.fd == fd && p.revents & libc::POLLIN != 0)),
            _ => {
                let e = io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn epoll_once(&self, fd: RawFd, wait_ms: i32) -> io::Result<bool> {
        let Some(epfd) = self.epoll.as_ref().map(|e| e.as_raw_fd()) else {
            return Err(io::ErrorKind::InvalidInput.into());
        };
        let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::epoll_wait(epfd, &mut event, 1, wait_ms) };
        match rc {
            0 => Ok(false),
            n if n > 0 => Ok(event.u64 == fd as u64),
            _ => {
                let e = io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn epoll_ctl(&self, op: i32, fd: RawFd, events: u32) -> Result<()> {
        self.epoll_ctl_io(op, fd, events).map_err(Into::into)
    }

    fn epoll_ctl_io(&self, op: i32, fd: RawFd, events: u32) -> io::Result<()> {
        let Some(epoll) = self.epoll.as_ref() else {
            return Err(io::ErrorKind::InvalidInput.into());
        };
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn muxer_names_parse() {
        assert_eq!("none".parse::<MuxerKind>().unwrap(), MuxerKind::None);
        assert_eq!("".parse::<MuxerKind>().unwrap(), MuxerKind::None);
        assert_eq!("EPOLL".parse::<MuxerKind>().unwrap(), MuxerKind::Epoll);
        assert_eq!(
            "epoll_adddel".parse::<MuxerKind>().unwrap(),
            MuxerKind::EpollAddDel
        );
        assert!("kqueue".parse::<MuxerKind>().is_err());
    }

    #[test]
    fn spin_with_select_is_rejected() {
        assert!(Receiver::new(MuxerKind::Select, true, RecvCall::Recv).is_err());
    }

    fn pair_with_payload(payload: &[u8]) -> (UnixStream, UnixStream) {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(payload).unwrap();
        (a, b)
    }

    #[test]
    fn poll_muxer_delivers_a_full_record() {
        let (_a, b) = pair_with_payload(b"0123456789abcdef");
        let mut rx = Receiver::new(MuxerKind::Poll, false, RecvCall::Recv).unwrap();
        rx.add(b.as_raw_fd()).unwrap();

        let mut buf = [0u8; 16];
        let n = rx.recv(b.as_raw_fd(), &mut buf, true).unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf, b"0123456789abcdef");
    }

    #[test]
    fn epoll_muxer_times_out_as_would_block() {
        let (_a, b) = UnixStream::pair().unwrap();
        let mut rx = Receiver::new(MuxerKind::Epoll, false, RecvCall::Recv).unwrap();
        rx.add(b.as_raw_fd()).unwrap();

        let mut buf = [0u8; 8];
        let err = rx.recv(b.as_raw_fd(), &mut buf, false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn epoll_adddel_registers_around_each_receive() {
        let (_a, b) = pair_with_payload(b"ping");
        let mut rx = Receiver::new(MuxerKind::EpollAddDel, false, RecvCall::Recv).unwrap();

        let mut buf = [0u8; 4];
        // Twice, to prove the fd really was deleted and re-added.
        assert_eq!(rx.recv(b.as_raw_fd(), &mut buf, true).unwrap(), 4);
        let err = rx.recv(b.as_raw_fd(), &mut buf, false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
