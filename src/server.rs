//! The reflecting server.
//!
//! Single thread, one client. The loop drains the data path, feeds every
//! request to the session state machine, and emits one fixed-size reply
//! whenever the client asked for one. Between data receives it glances
//! at the control channel for message-size changes and for the orderly
//! close that ends the run.

use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use codec::control::{get_str, put_int, put_str};
use codec::{FdType, Reply, Request, flags};
use service::Sessions;

use crate::config::Config;
use crate::control::{self, ControlEvent, ControlStream, Negotiated};
use crate::muxer::{self, MuxerKind, Receiver};
use crate::transport::{self, DataRx, DataTx, LocalEnds};
use crate::tsc;

const RECV_BUF: usize = 64 * 1024;

/// Binds the control port, waits for one client, serves it, exits.
pub fn run_standalone(cfg: &Config) -> Result<()> {
    let listener = listen_reuseaddr(cfg.port)?;
    log::info!("server: waiting for client to connect...");
    let (stream, peer) = listener.accept().context("control accept")?;
    log::info!("server: client connected from {}", peer);
    drop(listener);

    serve(cfg, ControlStream::Tcp(stream), None)
}

/// A listener with SO_REUSEADDR, so back-to-back runs can share the
/// well-known control port without waiting out TIME_WAIT.
fn listen_reuseaddr(port: u16) -> Result<TcpListener> {
    let fd = unsafe { libc::socket(libc::PF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("socket");
    }
    let listener = unsafe { TcpListener::from_raw_fd(fd) };

    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("SO_REUSEADDR");
    }

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: 0 },
        sin_zero: [0; 8],
    };
    let rc = unsafe {
        libc::bind(
            fd,
            (&addr as *const libc::sockaddr_in).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("binding control port {}", port));
    }
    if unsafe { libc::listen(fd, 1) } < 0 {
        return Err(io::Error::last_os_error()).context("listen");
    }
    Ok(listener)
}

enum ServerData {
    Udp { sock: UdpSocket, peer: SocketAddr },
    Tcp { stream: TcpStream },
    Local { rx: DataRx, tx: DataTx },
}

impl ServerData {
    fn rx(&self) -> DataRxRef {
        match self {
            Self::Udp { sock, .. } => DataRxRef::Socket(sock.as_raw_fd()),
            Self::Tcp { stream } => DataRxRef::Socket(stream.as_raw_fd()),
            Self::Local { rx, .. } => match rx {
                DataRx::Pipe(fd) => DataRxRef::Pipe(fd.as_raw_fd()),
                other => DataRxRef::Socket(other.raw_fd()),
            },
        }
    }

    fn send_reply(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Udp { sock, peer } => sock.send_to(buf, *peer),
            Self::Tcp { stream } => stream.write(buf),
            Self::Local { tx, .. } => tx.send(buf),
        }
    }
}

enum DataRxRef {
    Socket(std::os::fd::RawFd),
    Pipe(std::os::fd::RawFd),
}

impl DataRxRef {
    fn fd(&self) -> std::os::fd::RawFd {
        match self {
            Self::Socket(fd) | Self::Pipe(fd) => *fd,
        }
    }

    fn recv_call(&self) -> muxer::RecvCall {
        match self {
            Self::Socket(_) => muxer::RecvCall::Recv,
            Self::Pipe(_) => muxer::RecvCall::Read,
        }
    }
}

/// Serves one client over an established control stream. `local` carries
/// the inherited data descriptors when this process was forked for a
/// local transport.
pub fn serve(cfg: &Config, mut cs: ControlStream, local: Option<LocalEnds>) -> Result<()> {
    control::server_send_version(&mut cs)?;
    let opts = control::server_recv_opts(&mut cs)?;
    // Informational only; the client echoes it into its output header.
    put_str(&mut cs, &std::env::var("LD_PRELOAD").unwrap_or_default())?;

    if let Some(core) = opts.server_core {
        crate::pin_core(core)?;
    }

    let mut data = build_data_path(cfg, &opts, &mut cs, local)?;

    // The plain blocking receiver cannot time out on a pipe, and without
    // timeouts the control channel would never get polled; fall back to
    // the equivalent wait-then-read form.
    let muxer_kind = match (opts.fd_type, opts.muxer, opts.spin) {
        (FdType::Pipe, MuxerKind::None, false) => MuxerKind::Poll,
        (_, kind, _) => kind,
    };
    let rx = data.rx();
    let mut mux = Receiver::new(muxer_kind, opts.spin, rx.recv_call())?;
    mux.add(rx.fd())?;
    let _idle = transport::register_idle_fds(&mut mux, &opts.idle, cfg.tcpc_serv.as_deref())?;

    let mut sessions = Sessions::new();
    let peer = match &data {
        ServerData::Udp { peer, .. } => Some(*peer),
        _ => None,
    };
    sessions
        .register(peer)
        .map_err(|e| anyhow::anyhow!("registering client: {}", e))?;

    let fd = data.rx().fd();
    let wait_all = opts.fd_type.is_stream();
    let mut recv_size = RECV_BUF;
    let mut buf = vec![0u8; RECV_BUF];
    let mut reply_buf = [0u8; Reply::WIRE_SIZE];

    cs.set_nonblocking(true)?;
    loop {
        match mux.recv(fd, &mut buf[..recv_size.min(RECV_BUF)], wait_all) {
            Ok(0) => {
                log::info!("server: data path closed by peer");
                break;
            }
            Ok(n) => {
                let req = Request::decode(&buf[..n])
                    .map_err(|e| anyhow::anyhow!("bad request ({} bytes): {}", n, e))?;
                let session = sessions.primary_mut().expect("client registered above");
                if session.absorb(&req) {
                    let mut reply = Reply {
                        request: req,
                        s_timestamp: 0,
                        gap_stats: session.gap_stats(),
                    };
                    if req.flags & flags::TIMESTAMP != 0 {
                        reply.s_timestamp = tsc::now();
                    }
                    reply.encode(&mut reply_buf)?;
                    let sent = data.send_reply(&reply_buf).context("sending reply")?;
                    if sent != Reply::WIRE_SIZE {
                        bail!("short reply send ({} of {} bytes)", sent, Reply::WIRE_SIZE);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                match control::poll_control(&mut cs)? {
                    ControlEvent::Idle => {}
                    ControlEvent::Resize(size) => {
                        recv_size = size;
                        cs.set_nonblocking(false)?;
                        put_int(&mut cs, 0)?;
                        cs.set_nonblocking(true)?;
                    }
                    ControlEvent::Closed => break,
                }
            }
            Err(e) => return Err(e).context("server: data path"),
        }
    }
    Ok(())
}

fn build_data_path(
    cfg: &Config,
    opts: &Negotiated,
    cs: &mut ControlStream,
    local: Option<LocalEnds>,
) -> Result<ServerData> {
    if opts.fd_type.is_local() {
        let ends = local.with_context(|| {
            format!("{} requires a server forked by the client", opts.fd_type)
        })?;
        // Keep the control channel pollable under the plain blocking
        // receiver; pipes get the same effect via the poll fallback.
        let timeout = Some(Duration::from_millis(muxer::TIMEOUT_MS));
        match &ends.rx {
            DataRx::UnixStream(s) => s.set_read_timeout(timeout)?,
            DataRx::UnixDatagram(s) => s.set_read_timeout(timeout)?,
            _ => {}
        }
        return Ok(ServerData::Local {
            rx: ends.rx,
            tx: ends.tx,
        });
    }

    match opts.fd_type {
        FdType::Udp => {
            let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("data socket")?;
            if let Some(dev) = &cfg.bindtodev {
                transport::bind_to_device(sock.as_raw_fd(), dev)?;
            }
            if let Some(group) = &opts.mcast {
                let group: Ipv4Addr = group.parse().context("multicast group")?;
                // The server's own flag wins over the client's suggestion.
                let intf = cfg
                    .mcast_intf
                    .as_deref()
                    .or(opts.mcast_intf.as_deref())
                    .map(|s| s.parse::<Ipv4Addr>().context("multicast interface"))
                    .transpose()?
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                sock.join_multicast_v4(&group, &intf)?;
            }
            sock.set_read_timeout(Some(Duration::from_millis(muxer::TIMEOUT_MS)))?;
            put_int(cs, i32::from(sock.local_addr()?.port()))?;

            // Reply destination registration.
            let hostport = get_str(cs)?;
            log::info!("server: client 0 at {}", hostport);
            let (host, port) = transport::parse_hostport(&hostport, 0)?;
            let peer = transport::resolve(&host, port)?;
            Ok(ServerData::Udp { sock, peer })
        }
        FdType::Tcp => {
            let listener =
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).context("data listener")?;
            put_int(cs, i32::from(listener.local_addr()?.port()))?;
            let (stream, _) = listener.accept().context("data accept")?;
            if opts.nodelay {
                stream.set_nodelay(true)?;
            }
            stream.set_read_timeout(Some(Duration::from_millis(muxer::TIMEOUT_MS)))?;
            Ok(ServerData::Tcp { stream })
        }
        other => bail!("unsupported transport {}", other),
    }
}
