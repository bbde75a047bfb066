//! Command-line surface.
//!
//! One binary, two roles: with a transport argument it runs as the
//! measuring client, without one it runs as a reflecting server. A client
//! given no host forks its own co-located server.

use std::str::FromStr;

use clap::Parser;
use codec::FdType;

use crate::muxer::MuxerKind;
use crate::transport::IdleFdCounts;

/// The sweep of target message rates, `<min>-<max>[+<step>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSweep {
    pub min: u32,
    pub max: u32,
    pub step: u32,
}

impl RateSweep {
    pub const DEFAULT_MIN: u32 = 50_000;
    pub const DEFAULT_MAX: u32 = 5_000_000;
    pub const DEFAULT_STEP: u32 = 50_000;

    pub fn targets(&self) -> impl Iterator<Item = u32> + use<> {
        (self.min..=self.max).step_by(self.step as usize)
    }
}

impl Default for RateSweep {
    fn default() -> Self {
        Self {
            min: Self::DEFAULT_MIN,
            max: Self::DEFAULT_MAX,
            step: Self::DEFAULT_STEP,
        }
    }
}

impl FromStr for RateSweep {
    type Err = String;

    /// `MIN-MAX+STEP`; `MIN-MAX` defaults the step to `MIN`; a lone `MIN`
    /// also defaults the step to `MIN` and keeps the default ceiling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| format!("bad rate '{}' in '{}'", v, s))
        };

        let sweep = match s.split_once('-') {
            None => {
                let min = parse(s)?;
                Self {
                    min,
                    max: Self::DEFAULT_MAX,
                    step: min,
                }
            }
            Some((min, rest)) => {
                let min = parse(min)?;
                let (max, step) = match rest.split_once('+') {
                    None => (parse(rest)?, min),
                    Some((max, step)) => (parse(max)?, parse(step)?),
                };
                Self { min, max, step }
            }
        };

        if sweep.min == 0 || sweep.step == 0 {
            return Err(format!("rates in '{}' must be positive", s));
        }
        if sweep.max < sweep.min {
            return Err(format!("empty rate range '{}'", s));
        }
        Ok(sweep)
    }
}

impl std::fmt::Display for RateSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}+{}", self.min, self.max, self.step)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
pub struct Config {
    /// message size (bytes)
    #[arg(long = "msgsize", default_value_t = 24)]
    pub msg_size: usize,

    /// target message rates <min>-<max>[+<step>]
    #[arg(long, default_value_t = RateSweep::default(), value_parser = RateSweep::from_str)]
    pub rates: RateSweep,

    /// time per test (millisec)
    #[arg(long, default_value_t = 2000)]
    pub millisec: u64,

    /// latency samples per test (default: one per millisecond of test time)
    #[arg(long)]
    pub samples: Option<u32>,

    /// stop when the achieved TX rate drops below this percentage of target
    #[arg(long, default_value_t = 90)]
    pub stop: u32,

    /// max burst length tolerated before a schedule miss is declared
    #[arg(long = "maxburst", default_value_t = 100)]
    pub max_burst: u64,

    /// server control port
    #[arg(long, default_value_t = 2049)]
    pub port: u16,

    /// connect() the UDP socket
    #[arg(long)]
    pub connect: bool,

    /// spin on non-blocking recv()
    #[arg(long)]
    pub spin: bool,

    /// readiness back-end: none, select, poll, epoll, epoll_mod, epoll_adddel
    #[arg(long, value_parser = MuxerKind::from_str)]
    pub muxer: Option<MuxerKind>,

    /// server-side readiness back-end (same as client's by default)
    #[arg(long = "serv-muxer", value_parser = MuxerKind::from_str)]
    pub serv_muxer: Option<MuxerKind>,

    /// report round-trip time instead of subtracting the return-path estimate
    #[arg(long)]
    pub rtt: bool,

    /// dump raw per-sample results to files with this prefix
    #[arg(long)]
    pub raw: Option<String>,

    /// latency percentile to report
    #[arg(long, default_value_t = 99.0)]
    pub percentile: f64,

    /// multicast group for UDP data traffic
    #[arg(long)]
    pub mcast: Option<String>,

    /// multicast interface, by IPv4 address
    #[arg(long = "mcastintf")]
    pub mcast_intf: Option<String>,

    /// set IP_MULTICAST_LOOP
    #[arg(long = "mcastloop")]
    pub mcast_loop: bool,

    /// bind data sockets to this device (SO_BINDTODEVICE)
    #[arg(long = "bindtodev")]
    pub bindtodev: Option<String>,

    /// idle pipes to add to the readiness set
    #[arg(long = "n-pipe", default_value_t = 0)]
    pub n_pipe: u32,

    /// idle unix datagram sockets to add to the readiness set
    #[arg(long = "n-unix-d", default_value_t = 0)]
    pub n_unix_d: u32,

    /// idle unix stream sockets to add to the readiness set
    #[arg(long = "n-unix-s", default_value_t = 0)]
    pub n_unix_s: u32,

    /// idle UDP sockets to add to the readiness set
    #[arg(long = "n-udp", default_value_t = 0)]
    pub n_udp: u32,

    /// idle connected TCP sockets to add to the readiness set
    #[arg(long = "n-tcpc", default_value_t = 0)]
    pub n_tcpc: u32,

    /// idle TCP listeners to add to the readiness set
    #[arg(long = "n-tcpl", default_value_t = 0)]
    pub n_tcpl: u32,

    /// host:port the idle TCP sockets connect to
    #[arg(long = "tcpc-serv")]
    pub tcpc_serv: Option<String>,

    /// <client-core>,<server-core>; "", "any" or "none" disable pinning
    #[arg(long)]
    pub affinity: Option<String>,

    /// enable TCP_NODELAY on TCP data sockets
    #[arg(long)]
    pub nodelay: bool,

    /// transport for the data path; omit to run as a server
    #[arg(value_name = "tcp|udp|pipe|unix_stream|unix_datagram", value_parser = FdType::from_str)]
    pub fd_type: Option<FdType>,

    /// server to connect to; omit to fork a co-located one
    #[arg(value_name = "host[:port]")]
    pub host: Option<String>,
}

impl Config {
    pub fn samples_target(&self) -> u32 {
        self.samples.unwrap_or(self.millisec as u32)
    }

    pub fn muxer(&self) -> MuxerKind {
        self.muxer.unwrap_or_default()
    }

    pub fn serv_muxer(&self) -> MuxerKind {
        self.serv_muxer.or(self.muxer).unwrap_or_default()
    }

    pub fn idle_counts(&self) -> IdleFdCounts {
        IdleFdCounts {
            n_pipe: self.n_pipe,
            n_unix_d: self.n_unix_d,
            n_unix_s: self.n_unix_s,
            n_udp: self.n_udp,
            n_tcpc: self.n_tcpc,
            n_tcpl: self.n_tcpl,
        }
    }

    /// The multicast group in effect: naming an interface without a group
    /// implies the default group.
    pub fn mcast_group(&self) -> Option<String> {
        match (&self.mcast, &self.mcast_intf) {
            (Some(group), _) => Some(group.clone()),
            (None, Some(_)) => Some("224.1.2.49".to_string()),
            (None, None) => None,
        }
    }
}

/// Parses `--affinity`. `None` means no pinning.
pub fn parse_affinity(s: &str) -> Result<Option<(usize, usize)>, String> {
    if s.is_empty() || s.eq_ignore_ascii_case("any") || s.eq_ignore_ascii_case("none") {
        return Ok(None);
    }

    let parse = |v: &str| {
        v.trim()
            .parse::<usize>()
            .map_err(|_| format!("bad --affinity '{}'", s))
    };
    match s.split_once(',') {
        Some((client, server)) => Ok(Some((parse(client)?, parse(server)?))),
        None => Err(format!("bad --affinity '{}': expected <client>,<server>", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_full_form() {
        let sweep: RateSweep = "1000-9000+2000".parse().unwrap();
        assert_eq!(
            sweep,
            RateSweep {
                min: 1000,
                max: 9000,
                step: 2000
            }
        );
        assert_eq!(
            sweep.targets().collect::<Vec<_>>(),
            [1000, 3000, 5000, 7000, 9000]
        );
    }

    #[test]
    fn rates_without_step_use_min_as_step() {
        let sweep: RateSweep = "1000-3000".parse().unwrap();
        assert_eq!(sweep.step, 1000);
        assert_eq!(sweep.targets().collect::<Vec<_>>(), [1000, 2000, 3000]);
    }

    #[test]
    fn single_rate_keeps_default_ceiling() {
        let sweep: RateSweep = "10000".parse().unwrap();
        assert_eq!(sweep.min, 10_000);
        assert_eq!(sweep.step, 10_000);
        assert_eq!(sweep.max, RateSweep::DEFAULT_MAX);
    }

    #[test]
    fn bad_rates_are_rejected() {
        assert!("".parse::<RateSweep>().is_err());
        assert!("0".parse::<RateSweep>().is_err());
        assert!("5000-1000".parse::<RateSweep>().is_err());
        assert!("1000-2000+0".parse::<RateSweep>().is_err());
        assert!("10k-20k".parse::<RateSweep>().is_err());
    }

    #[test]
    fn affinity_forms() {
        assert_eq!(parse_affinity("1,2").unwrap(), Some((1, 2)));
        assert_eq!(parse_affinity("").unwrap(), None);
        assert_eq!(parse_affinity("any").unwrap(), None);
        assert_eq!(parse_affinity("NONE").unwrap(), None);
        assert!(parse_affinity("3").is_err());
        assert!(parse_affinity("a,b").is_err());
    }

    #[test]
    fn samples_default_to_one_per_millisecond() {
        let cfg = Config::try_parse_from(["stream-bench", "--millisec", "500", "udp"]).unwrap();
        assert_eq!(cfg.samples_target(), 500);

        let cfg =
            Config::try_parse_from(["stream-bench", "--samples", "100", "udp"]).unwrap();
        assert_eq!(cfg.samples_target(), 100);
    }

    #[test]
    fn server_muxer_falls_back_to_clients() {
        let cfg = Config::try_parse_from(["stream-bench", "--muxer", "poll", "udp"]).unwrap();
        assert_eq!(cfg.serv_muxer(), MuxerKind::Poll);

        let cfg = Config::try_parse_from([
            "stream-bench",
            "--muxer",
            "poll",
            "--serv-muxer",
            "epoll",
            "udp",
        ])
        .unwrap();
        assert_eq!(cfg.serv_muxer(), MuxerKind::Epoll);

        let cfg = Config::try_parse_from(["stream-bench", "udp"]).unwrap();
        assert_eq!(cfg.serv_muxer(), MuxerKind::None);
    }

    #[test]
    fn interface_without_group_implies_default_group() {
        let cfg =
            Config::try_parse_from(["stream-bench", "--mcastintf", "192.168.0.1", "udp"])
                .unwrap();
        assert_eq!(cfg.mcast_group().as_deref(), Some("224.1.2.49"));

        let cfg = Config::try_parse_from(["stream-bench", "udp"]).unwrap();
        assert_eq!(cfg.mcast_group(), None);
    }

    #[test]
    fn positionals_select_the_role() {
        let cfg = Config::try_parse_from(["stream-bench"]).unwrap();
        assert!(cfg.fd_type.is_none());

        let cfg = Config::try_parse_from(["stream-bench", "udp", "box1:7000"]).unwrap();
        assert_eq!(cfg.fd_type, Some(FdType::Udp));
        assert_eq!(cfg.host.as_deref(), Some("box1:7000"));

        assert!(Config::try_parse_from(["stream-bench", "sctp"]).is_err());
    }
}
