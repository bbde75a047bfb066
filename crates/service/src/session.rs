use std::net::SocketAddr;

use codec::{GapStats, Request, flags};

use crate::Error;

/// Per-client reflection state.
///
/// The server keeps one of these per registered client and feeds it every
/// request received on the data path. Sequence comparisons use 32-bit
/// serial arithmetic: a sequence is "behind" when the wrapped difference
/// is negative as a signed value, so the counters stay correct across
/// sequence wrap.
#[derive(Debug, Clone)]
pub struct Session {
    addr: Option<SocketAddr>,
    seq_expected: u32,
    reply_seq: u8,
    gap_stats: GapStats,
}

impl Session {
    /// `addr` is the reply destination for datagram transports; stream
    /// transports reply down the same channel and register no address.
    pub fn new(addr: Option<SocketAddr>) -> Self {
        Self {
            addr,
            seq_expected: 0,
            reply_seq: 0,
            gap_stats: GapStats::default(),
        }
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn seq_expected(&self) -> u32 {
        self.seq_expected
    }

    pub fn gap_stats(&self) -> GapStats {
        self.gap_stats
    }

    /// Applies one received request and reports whether a reply is due.
    ///
    /// A reply is due exactly when the request's `reply_seq` differs from
    /// the last one seen, which is how the client asks for a reflection
    /// without the server replying to every paced message.
    pub fn absorb(&mut self, req: &Request) -> bool {
        if req.flags & flags::RESET != 0 {
            self.seq_expected = req.seq.wrapping_add(1);
            self.gap_stats = GapStats::default();
        } else if req.seq == self.seq_expected {
            self.seq_expected = self.seq_expected.wrapping_add(1);
        } else if (req.seq.wrapping_sub(self.seq_expected) as i32) < 0 {
            self.gap_stats.n_ooo += 1;
        } else {
            self.gap_stats.n_msgs_dropped +=
                u64::from(req.seq.wrapping_sub(self.seq_expected));
            self.seq_expected = req.seq.wrapping_add(1);
            self.gap_stats.n_gaps += 1;
        }

        if req.reply_seq != self.reply_seq {
            self.reply_seq = req.reply_seq;
            true
        } else {
            false
        }
    }
}

/// The client table.
///
/// Provisioned as a collection even though the protocol admits a single
/// client; a second registration is rejected rather than silently merged
/// into the first client's counters.
#[derive(Debug, Default)]
pub struct Sessions {
    clients: Vec<Session>,
}

impl Sessions {
    const MAX_CLIENTS: usize = 1;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, addr: Option<SocketAddr>) -> Result<usize, Error> {
        if self.clients.len() >= Self::MAX_CLIENTS {
            return Err(Error::TooManyClients);
        }

        self.clients.push(Session::new(addr));
        Ok(self.clients.len() - 1)
    }

    /// All data-path traffic is accounted to the first client.
    pub fn primary_mut(&mut self) -> Option<&mut Session> {
        self.clients.first_mut()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
