//! Control-channel setup and handshake.
//!
//! A single reliable stream per test run: TCP when client and server are
//! separate hosts, one half of a unix socketpair when the server was
//! forked locally. The handshake pins down versions, forwards the
//! client's option block, and hands back the data-path parameters. After
//! setup the only mid-test traffic is message-size renegotiation, which
//! the server picks up by polling between data receives.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use codec::FdType;
use codec::control::{get_int, get_str, put_int, put_str};

use crate::config::Config;
use crate::muxer::MuxerKind;
use crate::transport::{IdleFdCounts, parse_hostport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bumped whenever the record layout or handshake order changes. Checked
/// on connect exactly like the version, so two builds that would
/// misparse each other's bytes never get as far as the data path.
pub const WIRE_REVISION: &str = "sb-wire-3";

const CONNECT_ATTEMPTS: u32 = 100;
const CONNECT_RETRY: Duration = Duration::from_millis(100);

pub enum ControlStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ControlStream {
    pub fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_nonblocking(on),
            Self::Unix(s) => s.set_nonblocking(on),
        }
    }
}

impl Read for ControlStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for ControlStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

/// Connects to the server's control port. A freshly forked server may
/// not be listening yet, so refused connections are retried for a while.
pub fn connect(hostport: &str, default_port: u16) -> Result<ControlStream> {
    let (host, port) = parse_hostport(hostport, default_port)?;
    let mut attempts = 0;
    loop {
        match TcpStream::connect((host.as_str(), port)) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(ControlStream::Tcp(stream));
            }
            Err(e)
                if e.kind() == io::ErrorKind::ConnectionRefused
                    && attempts + 1 < CONNECT_ATTEMPTS =>
            {
                attempts += 1;
                if attempts == 1 {
                    log::info!("client: waiting for server to start");
                }
                std::thread::sleep(CONNECT_RETRY);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("connecting to {}:{}", host, port));
            }
        }
    }
}

pub fn server_send_version(cs: &mut ControlStream) -> Result<()> {
    put_str(cs, VERSION)?;
    put_str(cs, WIRE_REVISION)?;
    Ok(())
}

pub fn client_check_version(cs: &mut ControlStream) -> Result<()> {
    let server_version = get_str(cs)?;
    let server_revision = get_str(cs)?;
    if server_version != VERSION {
        bail!(
            "version mismatch: client={} server={}",
            VERSION,
            server_version
        );
    }
    if server_revision != WIRE_REVISION {
        bail!(
            "wire revision mismatch: client={} server={}",
            WIRE_REVISION,
            server_revision
        );
    }
    Ok(())
}

/// The option block the server needs before it can build its data path.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub fd_type: FdType,
    pub connect: bool,
    pub spin: bool,
    pub muxer: MuxerKind,
    pub mcast: Option<String>,
    pub mcast_intf: Option<String>,
    pub mcast_loop: bool,
    pub idle: IdleFdCounts,
    pub server_core: Option<usize>,
    pub nodelay: bool,
}

pub fn client_send_opts(
    cs: &mut ControlStream,
    cfg: &Config,
    fd_type: FdType,
    server_core: Option<usize>,
) -> Result<()> {
    put_int(cs, fd_type.into())?;
    put_int(cs, cfg.connect as i32)?;
    put_int(cs, cfg.spin as i32)?;
    put_str(cs, &cfg.serv_muxer().to_string())?;
    put_str(cs, cfg.mcast_group().as_deref().unwrap_or(""))?;
    put_str(cs, cfg.mcast_intf.as_deref().unwrap_or(""))?;
    put_int(cs, cfg.mcast_loop as i32)?;
    put_int(cs, cfg.n_pipe as i32)?;
    put_int(cs, cfg.n_unix_s as i32)?;
    put_int(cs, cfg.n_unix_d as i32)?;
    put_int(cs, cfg.n_udp as i32)?;
    put_int(cs, cfg.n_tcpc as i32)?;
    put_int(cs, cfg.n_tcpl as i32)?;
    put_int(cs, server_core.map(|c| c as i32).unwrap_or(-1))?;
    put_int(cs, cfg.nodelay as i32)?;
    Ok(())
}

pub fn server_recv_opts(cs: &mut ControlStream) -> Result<Negotiated> {
    let fd_type = FdType::try_from(get_int(cs)?).context("negotiated fd type")?;
    let connect = get_int(cs)? != 0;
    let spin = get_int(cs)? != 0;
    let muxer = get_str(cs)?
        .parse::<MuxerKind>()
        .map_err(|e| anyhow::anyhow!(e))?;
    let opt = |s: String| if s.is_empty() { None } else { Some(s) };
    let mcast = opt(get_str(cs)?);
    let mcast_intf = opt(get_str(cs)?);
    let mcast_loop = get_int(cs)? != 0;
    let idle = IdleFdCounts {
        n_pipe: get_int(cs)? as u32,
        n_unix_s: get_int(cs)? as u32,
        n_unix_d: get_int(cs)? as u32,
        n_udp: get_int(cs)? as u32,
        n_tcpc: get_int(cs)? as u32,
        n_tcpl: get_int(cs)? as u32,
    };
    let server_core = match get_int(cs)? {
        core if core >= 0 => Some(core as usize),
        _ => None,
    };
    let nodelay = get_int(cs)? != 0;

    Ok(Negotiated {
        fd_type,
        connect,
        spin,
        muxer,
        mcast,
        mcast_intf,
        mcast_loop,
        idle,
        server_core,
        nodelay,
    })
}

/// Renegotiates the server's expected receive size; used once before RTT
/// calibration (reply-sized symmetric ping-pongs) and once before the
/// sweep (the configured message size).
pub fn negotiate_msg_size(cs: &mut ControlStream, size: usize) -> Result<()> {
    put_int(cs, size as i32)?;
    let ack = get_int(cs)?;
    if ack != 0 {
        bail!("unexpected message size ack {}", ack);
    }
    Ok(())
}

/// What the server found when glancing at the control channel between
/// data receives.
#[derive(Debug, PartialEq, Eq)]
pub enum ControlEvent {
    Idle,
    Resize(usize),
    Closed,
}

/// Non-blocking peek at the control channel; the stream must already be
/// in non-blocking mode. Frames are all-or-nothing: a partial integer is
/// a protocol error, not something to resume.
pub fn poll_control(cs: &mut ControlStream) -> Result<ControlEvent> {
    let mut buf = [0u8; 4];
    match cs.read(&mut buf) {
        Ok(0) => Ok(ControlEvent::Closed),
        Ok(4) => Ok(ControlEvent::Resize(i32::from_le_bytes(buf) as usize)),
        Ok(n) => bail!("short control read ({} of 4 bytes)", n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ControlEvent::Idle),
        Err(e) => Err(e).context("control socket"),
    }
}
