//! The client's receive thread.
//!
//! One dedicated thread blocks on the reply path, timestamps arrivals,
//! and appends selected samples to a pre-allocated record array. The
//! sender steers it through a tiny command machine: `Wait` (idle), `Go`
//! (drain replies until a STOP flag), `Exit` (teardown), with `New`
//! covering the window before the thread has finished initialising.
//!
//! Commands and acknowledging state changes travel through one mutex and
//! one condvar; every transition notifies, and every wait re-checks its
//! predicate. The record array sits behind its own lock, held briefly by
//! the receive thread per reply while in `Go`, and read by the sender
//! only after the thread has confirmed it is back in `Wait`; that
//! confirmation is the ownership handover.

use std::net::{Ipv4Addr, UdpSocket};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use codec::{FdType, Reply, flags};
use parking_lot::{Condvar, Mutex};

use crate::muxer::{MuxerKind, Receiver};
use crate::transport::{DataRx, IdleFdCounts, register_idle_fds};
use crate::tsc;

const REPLY_BUF: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxCmd {
    New,
    Wait,
    Go,
    Exit,
}

/// One saved latency sample, all times in raw cycle-counter units.
#[derive(Debug, Default, Clone, Copy)]
pub struct RxRecord {
    pub ts_send: u64,
    pub ts_recv: u64,
    pub seq: u32,
    pub send_lateness: u32,
}

/// The record array plus the most recent reply, whose gap counters the
/// sender reads at the end of a phase.
#[derive(Default)]
pub struct RxRecords {
    pub recs: Vec<RxRecord>,
    pub cap: usize,
    pub last_reply: Option<Reply>,
}

struct RxState {
    cmd: RxCmd,
    state: RxCmd,
    sync_seq: u32,
    rx_port: u16,
}

struct RxShared {
    sync: Mutex<RxState>,
    cond: Condvar,
    records: Mutex<RxRecords>,
}

/// How to obtain the reply-path endpoint: UDP receivers bind their own
/// socket on the thread (after pinning, for locality) and report the
/// port; every other transport hands a ready descriptor in.
pub enum Endpoint {
    UdpEphemeral,
    Given(DataRx),
}

pub struct Setup {
    pub muxer: MuxerKind,
    pub spin: bool,
    pub idle: IdleFdCounts,
    pub tcpc_serv: Option<String>,
    pub fd_type: FdType,
    pub recs_max: usize,
    pub core: Option<usize>,
}

pub struct RxHandle {
    shared: Arc<RxShared>,
    thread: Option<JoinHandle<()>>,
}

/// Spawns the receive thread and waits for it to finish initialising.
pub fn start(setup: Setup, endpoint: Endpoint) -> Result<RxHandle> {
    let shared = Arc::new(RxShared {
        sync: Mutex::new(RxState {
            cmd: RxCmd::Wait,
            state: RxCmd::New,
            sync_seq: 0,
            rx_port: 0,
        }),
        cond: Condvar::new(),
        records: Mutex::new(RxRecords::default()),
    });

    let thread_shared = shared.clone();
    let thread = std::thread::Builder::new()
        .name("client-rx".into())
        .spawn(move || {
            if let Err(e) = thread_main(&thread_shared, setup, endpoint) {
                // The sender cannot recover from a dead receive path;
                // fail the whole test like any other transport error.
                log::error!("client: receive thread failed: {:#}", e);
                std::process::exit(3);
            }
        })?;

    let handle = RxHandle {
        shared,
        thread: Some(thread),
    };
    handle.wait_state_leave(RxCmd::New);
    ensure!(handle.state() == RxCmd::Wait, "receive thread init raced");
    Ok(handle)
}

impl RxHandle {
    pub fn set_cmd(&self, cmd: RxCmd) {
        let mut st = self.shared.sync.lock();
        st.cmd = cmd;
        drop(st);
        self.shared.cond.notify_all();
    }

    pub fn cmd(&self) -> RxCmd {
        self.shared.sync.lock().cmd
    }

    pub fn state(&self) -> RxCmd {
        self.shared.sync.lock().state
    }

    /// Blocks until the thread's state is no longer `from`.
    pub fn wait_state_leave(&self, from: RxCmd) {
        let mut st = self.shared.sync.lock();
        while st.state == from {
            self.shared.cond.wait(&mut st);
        }
    }

    pub fn set_sync_seq(&self, seq: u32) {
        self.shared.sync.lock().sync_seq = seq;
    }

    /// Waits until the receive thread has seen the sync reply carrying
    /// `seq`, or the deadline passes. Spurious wakeups just re-check.
    pub fn wait_sync(&self, seq: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.sync.lock();
        while st.sync_seq != seq {
            if self.shared.cond.wait_until(&mut st, deadline).timed_out() {
                return st.sync_seq == seq;
            }
        }
        true
    }

    /// The port of the thread-bound UDP reply socket; zero for other
    /// transports.
    pub fn rx_port(&self) -> u16 {
        self.shared.sync.lock().rx_port
    }

    /// Reads the record array. Only meaningful once the thread is back
    /// in `Wait`; the phase protocol guarantees that before anyone calls
    /// this.
    pub fn with_records<T>(&self, f: impl FnOnce(&RxRecords) -> T) -> T {
        f(&self.shared.records.lock())
    }
}

impl Drop for RxHandle {
    fn drop(&mut self) {
        // Orderly teardown is only possible from Wait; on error paths the
        // thread may be parked in a receive, and the process is exiting
        // anyway.
        if self.state() == RxCmd::Wait {
            self.set_cmd(RxCmd::Exit);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn thread_main(shared: &RxShared, setup: Setup, endpoint: Endpoint) -> Result<()> {
    if let Some(core) = setup.core {
        crate::pin_core(core)?;
    }

    // Allocate and bind after pinning so pages and flows land on the
    // right core.
    let rx = match endpoint {
        Endpoint::UdpEphemeral => {
            DataRx::Udp(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("reply socket")?)
        }
        Endpoint::Given(rx) => rx,
    };
    let mut mux = Receiver::new(setup.muxer, setup.spin, rx.recv_call())?;
    mux.add(rx.raw_fd())?;
    let _idle = register_idle_fds(&mut mux, &setup.idle, setup.tcpc_serv.as_deref())?;

    {
        let mut records = shared.records.lock();
        records.recs = Vec::with_capacity(setup.recs_max);
        records.cap = setup.recs_max;
    }

    let port = match &rx {
        DataRx::Udp(sock) => sock.local_addr()?.port(),
        _ => 0,
    };

    let mut buf = vec![0u8; REPLY_BUF];
    // Stream transports deliver replies back-to-back; read exactly one
    // record's worth so messages stay framed.
    let want = if setup.fd_type.is_stream() {
        Reply::WIRE_SIZE
    } else {
        REPLY_BUF
    };
    let wait_all = setup.fd_type.is_stream();
    let fd = rx.raw_fd();

    let mut st = shared.sync.lock();
    st.rx_port = port;
    while st.state != RxCmd::Exit {
        if st.state != st.cmd {
            st.state = st.cmd;
            shared.cond.notify_all();
        }
        match st.state {
            RxCmd::Wait => shared.cond.wait(&mut st),
            RxCmd::Go => {
                drop(st);
                run_go(shared, &mut mux, fd, &mut buf[..want], wait_all)?;
                st = shared.sync.lock();
                st.state = RxCmd::Wait;
                shared.cond.notify_all();
            }
            RxCmd::New | RxCmd::Exit => {}
        }
    }
    Ok(())
}

/// Drains replies until one carries the STOP flag.
fn run_go(
    shared: &RxShared,
    mux: &mut Receiver,
    fd: RawFd,
    buf: &mut [u8],
    wait_all: bool,
) -> Result<()> {
    {
        let mut records = shared.records.lock();
        records.recs.clear();
        records.last_reply = None;
    }

    loop {
        let n = mux
            .recv(fd, buf, wait_all)
            .context("client: error receiving reply")?;
        let now = tsc::now();
        if n < Reply::WIRE_SIZE {
            bail!("client: short reply ({} of {} bytes)", n, Reply::WIRE_SIZE);
        }
        let reply = Reply::decode(&buf[..n]).map_err(|e| anyhow::anyhow!("bad reply: {}", e))?;

        {
            let mut records = shared.records.lock();
            records.last_reply = Some(reply);
            if reply.request.flags & flags::SAVE != 0 {
                // Overflow would silently corrupt the tail of the results.
                ensure!(
                    records.recs.len() < records.cap,
                    "client: record array overflow ({} records)",
                    records.cap
                );
                records.recs.push(RxRecord {
                    ts_send: reply.request.timestamp,
                    ts_recv: now,
                    seq: reply.request.seq,
                    send_lateness: reply.request.send_lateness,
                });
            }
        }

        if reply.request.flags & flags::SYNC != 0 {
            let mut st = shared.sync.lock();
            st.sync_seq = reply.request.seq;
            drop(st);
            shared.cond.notify_all();
        }

        if reply.request.flags & flags::STOP != 0 {
            return Ok(());
        }
    }
}
