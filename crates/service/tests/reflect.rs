use anyhow::Result;
use codec::{GapStats, Request, flags};
use stream_bench_service::{Error, Session, Sessions};

fn req(seq: u32) -> Request {
    Request { seq, ..Default::default() }
}

fn feed(session: &mut Session, seqs: &[u32]) {
    for &seq in seqs {
        session.absorb(&req(seq));
    }
}

#[test]
fn in_order_stream_counts_nothing() {
    let mut s = Session::new(None);
    feed(&mut s, &[0, 1, 2, 3]);

    assert_eq!(s.seq_expected(), 4);
    assert_eq!(s.gap_stats(), GapStats::default());
}

#[test]
fn reset_reseeds_sequence_and_clears_counters() {
    let mut s = Session::new(None);
    feed(&mut s, &[0, 1, 2]);

    let mut reset = req(100);
    reset.flags = flags::RESET;
    s.absorb(&reset);

    assert_eq!(s.seq_expected(), 101);
    assert_eq!(s.gap_stats(), GapStats::default());
}

#[test]
fn forward_gap_accumulates_dropped_count() {
    let mut s = Session::new(None);
    feed(&mut s, &[0, 1, 5]);

    assert_eq!(s.seq_expected(), 6);
    let gaps = s.gap_stats();
    assert_eq!(gaps.n_msgs_dropped, 3);
    assert_eq!(gaps.n_gaps, 1);
    assert_eq!(gaps.n_ooo, 0);
}

#[test]
fn out_of_order_is_counted_without_moving_expected() {
    let mut s = Session::new(None);
    feed(&mut s, &[0, 1, 2, 1]);

    assert_eq!(s.seq_expected(), 3);
    let gaps = s.gap_stats();
    assert_eq!(gaps.n_msgs_dropped, 0);
    assert_eq!(gaps.n_gaps, 0);
    assert_eq!(gaps.n_ooo, 1);
}

#[test]
fn dropped_total_is_the_sum_of_gap_sizes() {
    let mut s = Session::new(None);
    feed(&mut s, &[0, 4, 5, 10]);

    let gaps = s.gap_stats();
    assert_eq!(gaps.n_msgs_dropped, 3 + 4);
    assert_eq!(gaps.n_gaps, 2);
}

#[test]
fn serial_arithmetic_survives_sequence_wrap() {
    let mut s = Session::new(None);

    let mut reset = req(u32::MAX - 1);
    reset.flags = flags::RESET;
    s.absorb(&reset);
    assert_eq!(s.seq_expected(), u32::MAX);

    // The wrap itself is not a gap.
    feed(&mut s, &[u32::MAX, 0, 1]);
    assert_eq!(s.seq_expected(), 2);
    assert_eq!(s.gap_stats(), GapStats::default());

    // A stale pre-wrap sequence is behind, not a huge forward jump.
    feed(&mut s, &[u32::MAX]);
    assert_eq!(s.seq_expected(), 2);
    assert_eq!(s.gap_stats().n_ooo, 1);
}

#[test]
fn replaying_a_sequence_yields_identical_stats() {
    let trace = [0u32, 1, 2, 7, 7, 3, 8, 9, 20];

    let mut a = Session::new(None);
    let mut b = Session::new(None);
    feed(&mut a, &trace);
    feed(&mut b, &trace);

    assert_eq!(a.gap_stats(), b.gap_stats());
    assert_eq!(a.seq_expected(), b.seq_expected());
}

#[test]
fn reply_due_only_when_reply_seq_changes() {
    let mut s = Session::new(None);

    let mut m = req(0);
    assert!(!s.absorb(&m)); // reply_seq still 0

    m.seq = 1;
    m.reply_seq = 1;
    assert!(s.absorb(&m));

    m.seq = 2;
    assert!(!s.absorb(&m)); // unchanged again

    m.seq = 3;
    m.reply_seq = 2;
    assert!(s.absorb(&m));
}

#[test]
fn second_client_is_rejected() -> Result<()> {
    let mut sessions = Sessions::new();
    assert_eq!(sessions.register(None)?, 0);
    assert_eq!(sessions.register(None), Err(Error::TooManyClients));
    assert_eq!(sessions.len(), 1);
    Ok(())
}
