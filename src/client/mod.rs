//! The measuring client.
//!
//! The main thread is the sender: it paces messages against the cycle
//! counter, never receives, and only ever blocks waiting for a sync
//! acknowledgement from the receive thread ([`rx`]). Sends and receives
//! live on separate descriptors, so the sender never parks inside a
//! receive and the receive thread is never disturbed by sends.

pub mod rx;

use std::net::{Ipv4Addr, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use codec::control::{get_int, get_str, put_str};
use codec::{FdType, GapStats, Reply, Request, flags};

use self::rx::{RxCmd, RxHandle, RxRecord};
use crate::config::{Config, parse_affinity};
use crate::control::{self, ControlStream};
use crate::report;
use crate::server;
use crate::stats::Summary;
use crate::transport::{
    self, DataRx, DataTx, Forked, LocalEnds, bind_to_device, parse_hostport, set_multicast_if,
};
use crate::tsc::{self, Tsc};

const WARMUP_ROUNDS: u32 = 100;
const WARMUP_TIMEOUT: Duration = Duration::from_secs(1);
const RTT_ROUNDS: u32 = 1000;
const RTT_SYNC_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_RETRIES: u32 = 10;
const STOP_TIMEOUT: Duration = Duration::from_millis(100);

/// Client entry: sorts out the server (remote, forked co-located, or
/// forked with inherited local descriptors), then runs the measurement.
pub fn run(cfg: Config) -> Result<()> {
    let fd_type = cfg.fd_type.expect("client entered without a transport");
    ensure!(
        cfg.msg_size >= Request::WIRE_SIZE,
        "--msgsize must be at least {}",
        Request::WIRE_SIZE
    );
    ensure!(cfg.millisec > 0, "--millisec must be positive");
    ensure!(cfg.samples_target() > 0, "--samples must be positive");

    let local = fd_type.is_local() || cfg.host.is_none();
    let affinity_text = cfg.affinity.clone().unwrap_or_else(|| {
        // Core 0 tends to collect OS housekeeping, so avoid it. Two
        // co-located spinners must not share a core either.
        let cores = if local && cfg.spin { "1,2" } else { "1,1" };
        cores.to_string()
    });
    let affinity = parse_affinity(&affinity_text).map_err(|e| anyhow::anyhow!(e))?;

    if fd_type.is_local() {
        ensure!(
            cfg.host.is_none(),
            "{} runs against a forked local server; no host argument",
            fd_type
        );
        let pair = transport::local_pair(fd_type, cfg.spin)?;
        let (cs_client, cs_server) = UnixStream::pair().context("control socketpair")?;
        match transport::fork()? {
            Forked::Child => {
                drop(cs_client);
                drop(pair.client);
                run_forked_server(&cfg, ControlStream::Unix(cs_server), Some(pair.server));
            }
            Forked::Parent { .. } => {
                drop(cs_server);
                drop(pair.server);
                run_client(
                    cfg,
                    fd_type,
                    ControlStream::Unix(cs_client),
                    Some(pair.client),
                    "localhost",
                    affinity,
                    &affinity_text,
                )
            }
        }
    } else {
        let hostport = match cfg.host.clone() {
            Some(host) => host,
            None => {
                match transport::fork()? {
                    Forked::Child => run_forked_standalone(&cfg),
                    Forked::Parent { .. } => {}
                }
                "localhost".to_string()
            }
        };
        let cs = control::connect(&hostport, cfg.port)?;
        run_client(cfg, fd_type, cs, None, &hostport, affinity, &affinity_text)
    }
}

fn run_forked_server(cfg: &Config, cs: ControlStream, local: Option<LocalEnds>) -> ! {
    log::set_max_level(log::LevelFilter::Error);
    let code = match server::serve(cfg, cs, local) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("server: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run_forked_standalone(cfg: &Config) -> ! {
    log::set_max_level(log::LevelFilter::Error);
    let code = match server::run_standalone(cfg) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("server: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run_client(
    cfg: Config,
    fd_type: FdType,
    mut cs: ControlStream,
    local_ends: Option<LocalEnds>,
    hostport: &str,
    affinity: Option<(usize, usize)>,
    affinity_text: &str,
) -> Result<()> {
    control::client_check_version(&mut cs)?;

    let (client_core, server_core) = match affinity {
        Some((c, s)) => (Some(c), Some(s)),
        None => (None, None),
    };
    if let Some(core) = client_core {
        crate::pin_core(core)?;
    }
    let tsc = Tsc::measure();

    control::client_send_opts(&mut cs, &cfg, fd_type, server_core)?;
    let server_env = get_str(&mut cs)?;

    let rx_setup = rx::Setup {
        muxer: cfg.muxer(),
        spin: cfg.spin,
        idle: cfg.idle_counts(),
        tcpc_serv: cfg.tcpc_serv.clone(),
        fd_type,
        recs_max: cfg.samples_target() as usize * 3,
        core: client_core.map(|c| c + 1),
    };

    let (tx, rx) = match fd_type {
        FdType::Udp => {
            let port = get_int(&mut cs)? as u16;
            let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            if let Some(dev) = &cfg.bindtodev {
                bind_to_device(sock.as_raw_fd(), dev)?;
            }
            if let Some(intf) = &cfg.mcast_intf {
                set_multicast_if(&sock, intf.parse().context("--mcastintf")?)?;
            }
            if let Some(group) = cfg.mcast_group() {
                sock.set_multicast_loop_v4(cfg.mcast_loop)?;
                let group: Ipv4Addr = group.parse().context("--mcast")?;
                sock.connect((group, port))?;
            } else {
                let (host, _) = parse_hostport(hostport, 0)?;
                sock.connect((host.as_str(), port))?;
            }

            let rx = rx::start(rx_setup, rx::Endpoint::UdpEphemeral)?;
            // Tell the server where to aim the reflected replies.
            let reply_hostport = format!("{}:{}", sock.local_addr()?.ip(), rx.rx_port());
            put_str(&mut cs, &reply_hostport)?;
            (DataTx::Udp(sock), rx)
        }
        FdType::Tcp => {
            let port = get_int(&mut cs)? as u16;
            let (host, _) = parse_hostport(hostport, 0)?;
            let stream = TcpStream::connect((host.as_str(), port))
                .with_context(|| format!("data connect to {}:{}", host, port))?;
            if cfg.nodelay {
                stream.set_nodelay(true)?;
            }
            let rx = rx::start(
                rx_setup,
                rx::Endpoint::Given(DataRx::Tcp(stream.try_clone()?)),
            )?;
            (DataTx::Tcp(stream), rx)
        }
        _ => {
            let ends = local_ends.expect("local transport without inherited descriptors");
            let rx = rx::start(rx_setup, rx::Endpoint::Given(ends.rx))?;
            (ends.tx, rx)
        }
    };

    let msg_len = cfg.msg_size;
    let mut client = Client {
        cfg,
        cs,
        tsc,
        tx,
        rx,
        req: Request::default(),
        buf: vec![0u8; msg_len.max(Reply::WIRE_SIZE)],
        msg_len,
        next_seq: 0,
        ret_lat: Summary::default(),
        server_env,
    };
    client.run_sweep(affinity_text)
}

/// One completed rate phase, ready for reporting.
pub struct Phase {
    pub target: u32,
    pub tx_mps: i64,
    pub rx_mps: i64,
    pub recs: Vec<RxRecord>,
    pub gap: GapStats,
    pub n_fall_behinds: u32,
    /// first scheduled send time, the zero point for raw dumps
    pub ts_start: u64,
    pub msg_len: usize,
}

struct Client {
    cfg: Config,
    cs: ControlStream,
    tsc: Tsc,
    tx: DataTx,
    rx: RxHandle,
    /// persistent message header; `reply_seq` and `send_lateness` carry
    /// across phases on purpose
    req: Request,
    buf: Vec<u8>,
    msg_len: usize,
    next_seq: u32,
    ret_lat: Summary,
    server_env: String,
}

impl Client {
    fn run_sweep(&mut self, affinity_text: &str) -> Result<()> {
        report::print_preamble(&self.cfg, &self.tsc, &self.server_env, affinity_text);

        self.measure_rtt()?;
        report::print_return_latency(&self.ret_lat);
        report::print_column_headers();

        control::negotiate_msg_size(&mut self.cs, self.cfg.msg_size)?;
        self.set_msg_len(self.cfg.msg_size);

        let rates = self.cfg.rates;
        for target in rates.targets() {
            let phase = self.do_test(target)?;
            if let Some(prefix) = self.cfg.raw.clone() {
                report::write_raw(&prefix, &self.tsc, &phase, self.ret_lat.mean, self.cfg.rtt)?;
            }
            report::print_result_line(
                &self.tsc,
                &phase,
                self.ret_lat.mean,
                self.cfg.rtt,
                self.cfg.percentile,
            );
            if self.cfg.stop != 0 && tx_not_keeping_up(phase.tx_mps, target, self.cfg.stop) {
                log::warn!(
                    "client: TX rate is {}% of target; stopping",
                    phase.tx_mps * 100 / i64::from(target)
                );
                break;
            }
        }
        Ok(())
    }

    fn set_msg_len(&mut self, len: usize) {
        self.msg_len = len;
        self.buf = vec![0u8; len.max(Reply::WIRE_SIZE)];
    }

    fn send_req(&mut self) -> Result<()> {
        self.req.encode(&mut self.buf)?;
        let sent = self.tx.send(&self.buf[..self.msg_len])?;
        ensure!(
            sent == self.msg_len,
            "short send ({} of {} bytes)",
            sent,
            self.msg_len
        );
        Ok(())
    }

    /// Sends one sync-flagged request and waits for its reflection.
    /// `Ok(false)` is a timeout; transport trouble is an error.
    fn sync(&mut self, extra_flags: u8, timeout: Duration) -> Result<bool> {
        let seq = self.next_seq;
        self.rx.set_sync_seq(seq.wrapping_sub(1));

        self.req.flags = flags::SYNC | extra_flags;
        self.req.reply_seq = self.req.reply_seq.wrapping_add(1);
        self.req.seq = seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.send_req()?;

        Ok(self.rx.wait_sync(seq, timeout))
    }

    /// Drains in-flight state and resets the server's counters before a
    /// measurement phase.
    fn warmup(&mut self) -> Result<()> {
        for _ in 0..WARMUP_ROUNDS {
            if !self.sync(flags::RESET, WARMUP_TIMEOUT)? {
                bail!("client: timeout waiting for synchronisation message");
            }
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        ensure!(self.rx.cmd() == RxCmd::Wait, "receive thread not idle");
        self.rx.set_cmd(RxCmd::Go);
        self.next_seq = 0;
        self.warmup()
    }

    /// Ends a phase: parks the receive thread, then knocks it out of its
    /// drain loop with STOP syncs. A lossy transport may eat some, hence
    /// the retries; losing all of them fails the test.
    fn stop(&mut self) -> Result<()> {
        self.rx.set_cmd(RxCmd::Wait);
        let mut stopped = false;
        for _ in 0..STOP_RETRIES {
            if self.sync(flags::STOP, STOP_TIMEOUT)? {
                stopped = true;
                break;
            }
        }
        if !stopped {
            bail!("client: sync messages at end of test lost");
        }
        self.rx.wait_state_leave(RxCmd::Go);
        ensure!(self.rx.state() == RxCmd::Wait, "receive thread not parked");
        Ok(())
    }

    /// Round-trip calibration: symmetric ping-pongs (forward messages
    /// sized like replies), half of which estimates the return-path
    /// latency that one-way results subtract.
    fn measure_rtt(&mut self) -> Result<()> {
        control::negotiate_msg_size(&mut self.cs, Reply::WIRE_SIZE)?;
        self.set_msg_len(Reply::WIRE_SIZE);

        self.start()?;

        self.rx.set_sync_seq(self.next_seq.wrapping_sub(1));
        self.req.flags = flags::SAVE | flags::RESET | flags::SYNC;
        for _ in 0..RTT_ROUNDS {
            let seq = self.next_seq;
            self.req.seq = seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            self.req.reply_seq = self.req.reply_seq.wrapping_add(1);
            self.req.timestamp = tsc::now();
            self.send_req()?;
            // Individual losses are fine; the samples that made it back
            // still calibrate.
            let _ = self.rx.wait_sync(seq, RTT_SYNC_TIMEOUT);
        }

        self.stop()?;

        let tsc = self.tsc;
        let mut rtt: Vec<i64> = self.rx.with_records(|r| {
            r.recs
                .iter()
                .map(|rec| tsc.nsec(rec.ts_recv.wrapping_sub(rec.ts_send)) as i64)
                .collect()
        });
        let mut summary =
            Summary::over(&mut rtt, self.cfg.percentile).context("no RTT samples survived")?;
        // Halve the location stats into a one-way estimate; the stddev
        // stays a round-trip figure and the output says so.
        summary.scale_down(2);
        self.ret_lat = summary;
        Ok(())
    }

    /// One rate phase: the TSC-paced send loop.
    fn do_test(&mut self, target: u32) -> Result<Phase> {
        self.start()?;

        let millisec = self.cfg.millisec;
        let samples = u64::from(self.cfg.samples_target());
        let reply_every =
            (u64::from(target) * millisec / 1000 / samples.max(1)).max(1);
        let ticks_per_msg = self.tsc.hz / u64::from(target).max(1);
        let max_fall_behind = self.cfg.max_burst * ticks_per_msg;
        let start_seq = self.next_seq;
        let mut n_fall_behinds = 0u32;
        let mut msgs_since_reply = 0u64;

        let ts_begin = tsc::now();
        let mut ts_next_send = ts_begin + ticks_per_msg;
        let ts_start = ts_next_send;
        let ts_end = ts_begin + self.tsc.hz / 1000 * millisec;
        self.req.timestamp = ts_begin;
        self.req.flags = flags::SAVE;

        while self.req.timestamp < ts_end {
            let seq = self.next_seq;
            self.req.seq = seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            msgs_since_reply += 1;
            if msgs_since_reply == reply_every {
                self.req.reply_seq = self.req.reply_seq.wrapping_add(1);
                msgs_since_reply = 0;
            }

            while self.req.timestamp < ts_next_send {
                self.req.timestamp = tsc::now();
            }
            if is_fall_behind(
                self.req.timestamp,
                ts_next_send,
                max_fall_behind,
                self.req.send_lateness,
            ) {
                // A discrete stall: restart the schedule from here rather
                // than racing to catch up and flooding the receiver.
                ts_next_send = self.req.timestamp;
                n_fall_behinds += 1;
            }
            self.req.send_lateness = self.req.timestamp.wrapping_sub(ts_next_send) as u32;

            self.send_req()?;
            ts_next_send += ticks_per_msg;
        }

        let end_seq = self.next_seq;
        self.stop()?;

        let (recs, gap) = self.rx.with_records(|r| {
            (
                r.recs.clone(),
                r.last_reply.map(|rep| rep.gap_stats).unwrap_or_default(),
            )
        });

        let n_tx = u64::from(end_seq.wrapping_sub(start_seq));
        let n_rx = n_tx.saturating_sub(gap.n_msgs_dropped);
        Ok(Phase {
            target,
            tx_mps: (n_tx * 1000 / millisec) as i64,
            rx_mps: (n_rx * 1000 / millisec) as i64,
            recs,
            gap,
            n_fall_behinds,
            ts_start,
            msg_len: self.msg_len,
        })
    }
}

/// A schedule miss is a discrete stall, not gradual drift: the sender is
/// far past its slot *and* the previous message was not already badly
/// late.
fn is_fall_behind(now: u64, ts_next_send: u64, max_fall_behind: u64, prev_lateness: u32) -> bool {
    now > ts_next_send + max_fall_behind && u64::from(prev_lateness) < max_fall_behind / 5
}

fn tx_not_keeping_up(tx_mps: i64, target: u32, stop_pct: u32) -> bool {
    tx_mps * 100 / i64::from(target) < i64::from(stop_pct)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stall_past_the_burst_cap_is_a_fall_behind() {
        let ticks_per_msg = 1000;
        let max_fall_behind = 10 * ticks_per_msg;
        let ts_next = 1_000_000;

        // 50k cycles late after an on-time message: one discrete miss.
        assert!(is_fall_behind(ts_next + 50_000, ts_next, max_fall_behind, 0));
    }

    #[test]
    fn gradual_drift_is_not_a_fall_behind() {
        let max_fall_behind = 10_000;
        let ts_next = 1_000_000;

        // Not far enough past the slot.
        assert!(!is_fall_behind(ts_next + 9_999, ts_next, max_fall_behind, 0));
        // Far past, but the previous send was already late too: the
        // sender is drifting, not stalled, so the schedule stands.
        assert!(!is_fall_behind(
            ts_next + 50_000,
            ts_next,
            max_fall_behind,
            3_000
        ));
    }

    #[test]
    fn snap_suppresses_a_second_count() {
        // After the snap the lateness recorded is zero-ish only when the
        // schedule restarted; a following message right on the new slot
        // must not count again.
        let max_fall_behind = 10_000;
        let ts_next = 2_000_000;
        assert!(is_fall_behind(ts_next + 50_000, ts_next, max_fall_behind, 0));
        let snapped = ts_next + 50_000;
        assert!(!is_fall_behind(snapped + 10, snapped, max_fall_behind, 0));
    }

    #[test]
    fn early_stop_threshold() {
        assert!(tx_not_keeping_up(89_999, 100_000, 90));
        assert!(!tx_not_keeping_up(90_000, 100_000, 90));
        assert!(!tx_not_keeping_up(150_000, 100_000, 90));
    }
}
