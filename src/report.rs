//! Result output.
//!
//! Measurement rows go to stdout: a block of `#` header lines, then one
//! tab-separated row per completed rate. Raw per-sample dumps go to
//! `<prefix>-<msglen>-<rate>.dat` files. Diagnostics never land here;
//! they go through the logger to stderr.

use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};

use crate::client::Phase;
use crate::client::rx::RxRecord;
use crate::config::Config;
use crate::control::VERSION;
use crate::stats::Summary;
use crate::tsc::Tsc;

pub fn print_preamble(cfg: &Config, tsc: &Tsc, server_env: &str, affinity: &str) {
    println!("# version={}", VERSION);
    println!("# tsc_hz={}", tsc.hz);
    println!("# server LD_PRELOAD={}", server_env);
    println!(
        "# options: {}{}{}",
        if cfg.connect { "connect " } else { "" },
        if cfg.spin { "spin " } else { "" },
        if cfg.rtt { "rtt " } else { "" },
    );
    println!("# muxer={} serv-muxer={}", cfg.muxer(), cfg.serv_muxer());
    println!("# affinity={}", affinity);
    println!(
        "# multicast={} loop={}",
        cfg.mcast_group().as_deref().unwrap_or("NO"),
        cfg.mcast_loop as i32
    );
    println!("# percentile={}", cfg.percentile);
    let _ = std::io::stdout().flush();
}

pub fn print_return_latency(summary: &Summary) {
    println!("# return_latency={}", summary.mean);
    // The location stats above are RTT/2; the spread is still a
    // round-trip figure.
    println!("# return_latency_stddev={} (round-trip, not halved)", summary.stddev);
}

pub fn print_column_headers() {
    println!("#");
    println!(
        "#mps\tmps\tmps\t\
         latency\tlatency\tlatency\tlatency\tlatency\tlatency\tlatency\t\
         sendjit\tsendjit\tsendjit\tsendjit\t\
         gaps\tgaps\tgaps"
    );
    println!(
        "#target\tsend\trecv\t\
         mean\tmin\tmedian\tmax\t%ile\tstddev\tsamples\t\
         mean\tmin\tmax\tbehind\t\
         n_gaps\tn_drops\tn_ooo"
    );
    let _ = std::io::stdout().flush();
}

/// End-to-end latency of one saved sample in integer nanoseconds. The
/// one-way figure subtracts the calibrated return-path mean and may go
/// negative; it is reported as measured, not clamped.
pub fn latency_ns(tsc: &Tsc, rec: &RxRecord, ret_mean: i64, rtt: bool) -> i64 {
    let mut ns = tsc.nsec(rec.ts_recv.wrapping_sub(rec.ts_send)) as i64;
    if !rtt {
        ns -= ret_mean;
    }
    ns
}

/// The slot this sample was scheduled for, recovered from the actual
/// send time and how late it was.
fn target_send_ts(rec: &RxRecord) -> u64 {
    rec.ts_send.wrapping_sub(u64::from(rec.send_lateness))
}

pub fn print_result_line(tsc: &Tsc, phase: &Phase, ret_mean: i64, rtt: bool, percentile: f64) {
    let mut lat: Vec<i64> = phase
        .recs
        .iter()
        .map(|r| latency_ns(tsc, r, ret_mean, rtt))
        .collect();
    let mut jit: Vec<i64> = phase
        .recs
        .iter()
        .map(|r| tsc.nsec(u64::from(r.send_lateness)) as i64)
        .collect();
    let l = Summary::over(&mut lat, percentile).unwrap_or_default();
    let j = Summary::over(&mut jit, percentile).unwrap_or_default();

    println!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        phase.target,
        phase.tx_mps,
        phase.rx_mps,
        l.mean,
        l.min,
        l.median,
        l.max,
        l.percentile,
        l.stddev,
        phase.recs.len(),
        j.mean,
        j.min,
        j.max,
        phase.n_fall_behinds,
        phase.gap.n_gaps,
        phase.gap.n_msgs_dropped,
        phase.gap.n_ooo,
    );
    let _ = std::io::stdout().flush();
}

fn to_secs(tsc: &Tsc, ts: u64, ts_start: u64) -> f64 {
    1e-9 * tsc.nsec(ts.wrapping_sub(ts_start)) as f64
}

fn raw_line(tsc: &Tsc, rec: &RxRecord, ts_start: u64, ret_mean: i64, rtt: bool) -> String {
    format!(
        "{:.9}\t{:.9}\t{:.9}",
        to_secs(tsc, target_send_ts(rec), ts_start),
        to_secs(tsc, rec.ts_send, ts_start),
        1e-9 * latency_ns(tsc, rec, ret_mean, rtt) as f64,
    )
}

/// Dumps every saved sample of a phase, times in seconds relative to the
/// phase's first scheduled send.
pub fn write_raw(
    prefix: &str,
    tsc: &Tsc,
    phase: &Phase,
    ret_mean: i64,
    rtt: bool,
) -> Result<()> {
    let path = format!("{}-{}-{}.dat", prefix, phase.msg_len, phase.target);
    let file = File::create(&path).with_context(|| format!("creating '{}'", path))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "#send-target(ns)\tsend-actual(ns)\tlatency(ns)")?;
    for rec in &phase.recs {
        writeln!(out, "{}", raw_line(tsc, rec, phase.ts_start, ret_mean, rtt))?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gigahertz() -> Tsc {
        Tsc { hz: 1_000_000_000 }
    }

    #[test]
    fn one_way_latency_subtracts_the_return_estimate() {
        let tsc = gigahertz();
        let rec = RxRecord {
            ts_send: 1_000,
            ts_recv: 5_000,
            seq: 0,
            send_lateness: 0,
        };
        assert_eq!(latency_ns(&tsc, &rec, 1_500, false), 2_500);
        assert_eq!(latency_ns(&tsc, &rec, 1_500, true), 4_000);
    }

    #[test]
    fn one_way_latency_may_be_negative() {
        let tsc = gigahertz();
        let rec = RxRecord {
            ts_send: 0,
            ts_recv: 100,
            seq: 0,
            send_lateness: 0,
        };
        assert_eq!(latency_ns(&tsc, &rec, 500, false), -400);
    }

    #[test]
    fn raw_lines_carry_nine_fractional_digits() {
        let tsc = gigahertz();
        let rec = RxRecord {
            ts_send: 2_000_000_000, // one second past the phase start
            ts_recv: 2_000_000_450,
            seq: 1,
            send_lateness: 250,
        };
        let line = raw_line(&tsc, &rec, 1_000_000_000, 0, true);
        assert_eq!(line, "0.999999750\t1.000000000\t0.000000450");
    }
}
