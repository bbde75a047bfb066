//! Data-path endpoints.
//!
//! One uniform surface over five transports: TCP, unicast/multicast UDP,
//! OS pipes, and local stream/datagram socketpairs. The core only ever
//! sends one message and receives one message; everything
//! transport-specific is settled here at setup time.

use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixStream};

use anyhow::{Context, Result, bail};
use codec::FdType;

use crate::muxer::{Receiver, RecvCall};

/// Sending half of a data path.
pub enum DataTx {
    Udp(UdpSocket),
    Tcp(TcpStream),
    UnixStream(UnixStream),
    UnixDatagram(UnixDatagram),
    Pipe(OwnedFd),
}

impl DataTx {
    /// Sends one message. Callers check the returned count against the
    /// message length; a short send fails the test rather than being
    /// retried, since a retry would distort the pacing.
    pub fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Udp(s) => s.send(buf),
            Self::Tcp(s) => s.write(buf),
            Self::UnixStream(s) => s.write(buf),
            Self::UnixDatagram(s) => s.send(buf),
            Self::Pipe(fd) => {
                let rc =
                    unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
                if rc < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(rc as usize)
                }
            }
        }
    }
}

/// Receiving half of a data path. Actual receives go through
/// [`Receiver`]; this only owns the descriptor and knows how to read it.
pub enum DataRx {
    Udp(UdpSocket),
    Tcp(TcpStream),
    UnixStream(UnixStream),
    UnixDatagram(UnixDatagram),
    Pipe(OwnedFd),
}

impl DataRx {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Self::Udp(s) => s.as_raw_fd(),
            Self::Tcp(s) => s.as_raw_fd(),
            Self::UnixStream(s) => s.as_raw_fd(),
            Self::UnixDatagram(s) => s.as_raw_fd(),
            Self::Pipe(fd) => fd.as_raw_fd(),
        }
    }

    pub fn recv_call(&self) -> RecvCall {
        match self {
            Self::Pipe(_) => RecvCall::Read,
            _ => RecvCall::Recv,
        }
    }
}

/// Both halves of one side of a local transport.
pub struct LocalEnds {
    pub rx: DataRx,
    pub tx: DataTx,
}

/// Endpoints for a client and the server it is about to fork. Both
/// processes inherit all four descriptors; each drops the other's half.
pub struct LocalPair {
    pub client: LocalEnds,
    pub server: LocalEnds,
}

/// Builds the descriptor pairs for a local transport, before the fork.
/// Pipes are unidirectional so bidirectional flow takes two of them;
/// spinning receivers additionally need the read ends non-blocking since
/// `read(2)` has no per-call equivalent of MSG_DONTWAIT.
pub fn local_pair(kind: FdType, spin: bool) -> Result<LocalPair> {
    match kind {
        FdType::Pipe => {
            let (c_read, s_write) = sys_pipe()?;
            let (s_read, c_write) = sys_pipe()?;
            if spin {
                set_nonblocking(c_read.as_raw_fd())?;
                set_nonblocking(s_read.as_raw_fd())?;
            }
            Ok(LocalPair {
                client: LocalEnds {
                    rx: DataRx::Pipe(c_read),
                    tx: DataTx::Pipe(c_write),
                },
                server: LocalEnds {
                    rx: DataRx::Pipe(s_read),
                    tx: DataTx::Pipe(s_write),
                },
            })
        }
        FdType::UnixStream => {
            let (c, s) = UnixStream::pair().context("socketpair")?;
            Ok(LocalPair {
                client: LocalEnds {
                    rx: DataRx::UnixStream(c.try_clone()?),
                    tx: DataTx::UnixStream(c),
                },
                server: LocalEnds {
                    rx: DataRx::UnixStream(s.try_clone()?),
                    tx: DataTx::UnixStream(s),
                },
            })
        }
        FdType::UnixDatagram => {
            let (c, s) = UnixDatagram::pair().context("socketpair")?;
            Ok(LocalPair {
                client: LocalEnds {
                    rx: DataRx::UnixDatagram(c.try_clone()?),
                    tx: DataTx::UnixDatagram(c),
                },
                server: LocalEnds {
                    rx: DataRx::UnixDatagram(s.try_clone()?),
                    tx: DataTx::UnixDatagram(s),
                },
            })
        }
        _ => bail!("{} is not a local transport", kind),
    }
}

fn sys_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error()).context("pipe");
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error()).context("fcntl O_NONBLOCK");
    }
    Ok(())
}

/// How many idle descriptors of each kind to park in the readiness set.
/// They carry no traffic; they exist to measure how the multiplexer
/// scales with set size.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleFdCounts {
    pub n_pipe: u32,
    pub n_unix_d: u32,
    pub n_unix_s: u32,
    pub n_udp: u32,
    pub n_tcpc: u32,
    pub n_tcpl: u32,
}

impl IdleFdCounts {
    pub fn any(&self) -> bool {
        self.n_pipe + self.n_unix_d + self.n_unix_s + self.n_udp + self.n_tcpc + self.n_tcpl
            > 0
    }
}

/// Keeps the idle descriptors alive for the life of the test.
pub struct IdleFds {
    _pipes: Vec<OwnedFd>,
    _unix_d: Vec<UnixDatagram>,
    _unix_s: Vec<UnixStream>,
    _udp: Vec<UdpSocket>,
    _tcp: Vec<TcpStream>,
    _listeners: Vec<TcpListener>,
}

pub fn register_idle_fds(
    mux: &mut Receiver,
    counts: &IdleFdCounts,
    tcpc_serv: Option<&str>,
) -> Result<IdleFds> {
    let mut pipes = Vec::new();
    let mut i = 0;
    while i < counts.n_pipe {
        let (r, w) = sys_pipe()?;
        mux.add(r.as_raw_fd())?;
        i += 1;
        if i < counts.n_pipe {
            // The write end is never readable, but it still pads the set
            // without burning an extra pipe.
            mux.add(w.as_raw_fd())?;
            i += 1;
        }
        pipes.push(r);
        pipes.push(w);
    }

    let mut unix_d = Vec::new();
    let mut i = 0;
    while i < counts.n_unix_d {
        let (a, b) = UnixDatagram::pair()?;
        mux.add(a.as_raw_fd())?;
        i += 1;
        if i < counts.n_unix_d {
            mux.add(b.as_raw_fd())?;
            i += 1;
        }
        unix_d.push(a);
        unix_d.push(b);
    }

    let mut unix_s = Vec::new();
    let mut i = 0;
    while i < counts.n_unix_s {
        let (a, b) = UnixStream::pair()?;
        mux.add(a.as_raw_fd())?;
        i += 1;
        if i < counts.n_unix_s {
            mux.add(b.as_raw_fd())?;
            i += 1;
        }
        unix_s.push(a);
        unix_s.push(b);
    }

    let mut udp = Vec::new();
    for _ in 0..counts.n_udp {
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        mux.add(sock.as_raw_fd())?;
        udp.push(sock);
    }

    let mut tcp = Vec::new();
    if counts.n_tcpc > 0 {
        let Some(serv) = tcpc_serv else {
            bail!("--n-tcpc needs --tcpc-serv <host:port>");
        };
        for _ in 0..counts.n_tcpc {
            let stream = TcpStream::connect(serv)
                .with_context(|| format!("idle tcp connect to {}", serv))?;
            mux.add(stream.as_raw_fd())?;
            tcp.push(stream);
        }
    }

    let mut listeners = Vec::new();
    for _ in 0..counts.n_tcpl {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        mux.add(listener.as_raw_fd())?;
        listeners.push(listener);
    }

    Ok(IdleFds {
        _pipes: pipes,
        _unix_d: unix_d,
        _unix_s: unix_s,
        _udp: udp,
        _tcp: tcp,
        _listeners: listeners,
    })
}

/// Splits `host[:port]`, falling back to `default_port`.
pub fn parse_hostport(s: &str, default_port: u16) -> Result<(String, u16)> {
    match s.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("bad port in '{}'", s))?;
            Ok((host.to_string(), port))
        }
        None => Ok((s.to_string(), default_port)),
    }
}

pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {}:{}", host, port))?
        .next()
        .with_context(|| format!("no address for {}:{}", host, port))
}

pub fn bind_to_device(fd: RawFd, dev: &str) -> Result<()> {
    if dev.len() >= libc::IFNAMSIZ {
        bail!("interface name '{}' too long", dev);
    }
    let mut name = [0u8; libc::IFNAMSIZ];
    name[..dev.len()].copy_from_slice(dev.as_bytes());
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr().cast(),
            (dev.len() + 1) as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("SO_BINDTODEVICE");
    }
    Ok(())
}

/// Selects the outgoing interface for multicast sends. The interface is
/// named by its IPv4 address.
pub fn set_multicast_if(sock: &UdpSocket, intf: Ipv4Addr) -> Result<()> {
    let addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(intf.octets()),
    };
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MULTICAST_IF,
            (&addr as *const libc::in_addr).cast(),
            std::mem::size_of::<libc::in_addr>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("IP_MULTICAST_IF");
    }
    Ok(())
}

pub enum Forked {
    Parent { child: libc::pid_t },
    Child,
}

/// Forks the co-located server. Called before any thread exists, so the
/// child inherits a single-threaded, fully predictable image.
pub fn fork() -> Result<Forked> {
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()).context("fork"),
        0 => Ok(Forked::Child),
        pid => Ok(Forked::Parent { child: pid }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostport_parsing() {
        assert_eq!(
            parse_hostport("example.com:7000", 2049).unwrap(),
            ("example.com".to_string(), 7000)
        );
        assert_eq!(
            parse_hostport("example.com", 2049).unwrap(),
            ("example.com".to_string(), 2049)
        );
        assert!(parse_hostport("example.com:notaport", 2049).is_err());
    }

    #[test]
    fn local_pair_round_trips_a_message() {
        for kind in [FdType::Pipe, FdType::UnixStream, FdType::UnixDatagram] {
            let mut pair = local_pair(kind, false).unwrap();

            assert_eq!(pair.client.tx.send(b"abcd").unwrap(), 4);
            let mut rx = Receiver::new(
                crate::muxer::MuxerKind::None,
                false,
                pair.server.rx.recv_call(),
            )
            .unwrap();
            let mut buf = [0u8; 4];
            let n = rx
                .recv(pair.server.rx.raw_fd(), &mut buf, kind.is_stream())
                .unwrap();
            assert_eq!(&buf[..n], b"abcd");

            assert_eq!(pair.server.tx.send(b"efgh").unwrap(), 4);
            let mut rx = Receiver::new(
                crate::muxer::MuxerKind::None,
                false,
                pair.client.rx.recv_call(),
            )
            .unwrap();
            let n = rx
                .recv(pair.client.rx.raw_fd(), &mut buf, kind.is_stream())
                .unwrap();
            assert_eq!(&buf[..n], b"efgh");
        }
    }

    #[test]
    fn udp_is_not_a_local_transport() {
        assert!(local_pair(FdType::Udp, false).is_err());
    }
}
