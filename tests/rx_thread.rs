//! Exercises the receive thread's command machine against a scripted
//! reply feed over a local datagram pair.

use std::os::unix::net::UnixDatagram;
use std::time::Duration;

use anyhow::Result;
use codec::{FdType, GapStats, Reply, Request, flags};
use stream_bench::client::rx::{self, Endpoint, RxCmd, Setup};
use stream_bench::muxer::MuxerKind;
use stream_bench::transport::{DataRx, IdleFdCounts};

fn reply_bytes(seq: u32, fl: u8) -> Vec<u8> {
    let reply = Reply {
        request: Request {
            timestamp: 1111,
            seq,
            send_lateness: 22,
            flags: fl,
            reply_seq: 0,
        },
        s_timestamp: 0,
        gap_stats: GapStats {
            n_msgs_dropped: 9,
            ..Default::default()
        },
    };
    let mut buf = vec![0u8; Reply::WIRE_SIZE];
    reply.encode(&mut buf).unwrap();
    buf
}

fn start_rx(recs_max: usize) -> Result<(UnixDatagram, rx::RxHandle)> {
    let (feeder, rx_end) = UnixDatagram::pair()?;
    let handle = rx::start(
        Setup {
            muxer: MuxerKind::None,
            spin: false,
            idle: IdleFdCounts::default(),
            tcpc_serv: None,
            fd_type: FdType::UnixDatagram,
            recs_max,
            core: None,
        },
        Endpoint::Given(DataRx::UnixDatagram(rx_end)),
    )?;
    Ok((feeder, handle))
}

#[test]
fn saves_syncs_and_stops() -> Result<()> {
    let (feeder, handle) = start_rx(8)?;
    assert_eq!(handle.state(), RxCmd::Wait);

    handle.set_cmd(RxCmd::Go);
    handle.set_sync_seq(4);

    feeder.send(&reply_bytes(5, flags::SAVE | flags::SYNC))?;
    assert!(handle.wait_sync(5, Duration::from_secs(5)));

    feeder.send(&reply_bytes(6, flags::SAVE))?;
    feeder.send(&reply_bytes(7, flags::STOP))?;
    handle.wait_state_leave(RxCmd::Go);
    assert_eq!(handle.state(), RxCmd::Wait);

    handle.with_records(|r| {
        assert_eq!(r.recs.len(), 2);
        assert_eq!(r.recs[0].seq, 5);
        assert_eq!(r.recs[0].ts_send, 1111);
        assert_eq!(r.recs[0].send_lateness, 22);
        assert!(r.recs[0].ts_recv > 0);
        assert_eq!(r.recs[1].seq, 6);
        // The gap counters of the final reply are what the sender
        // reports for the phase.
        assert_eq!(r.last_reply.unwrap().request.seq, 7);
        assert_eq!(r.last_reply.unwrap().gap_stats.n_msgs_dropped, 9);
    });
    Ok(())
}

#[test]
fn a_new_phase_clears_the_record_array() -> Result<()> {
    let (feeder, handle) = start_rx(8)?;

    handle.set_cmd(RxCmd::Go);
    feeder.send(&reply_bytes(0, flags::SAVE))?;
    feeder.send(&reply_bytes(1, flags::STOP))?;
    handle.wait_state_leave(RxCmd::Go);
    assert_eq!(handle.with_records(|r| r.recs.len()), 1);

    handle.set_cmd(RxCmd::Go);
    feeder.send(&reply_bytes(10, flags::STOP))?;
    handle.wait_state_leave(RxCmd::Go);

    handle.with_records(|r| {
        assert!(r.recs.is_empty());
        assert_eq!(r.last_reply.unwrap().request.seq, 10);
    });
    Ok(())
}

#[test]
fn sync_without_save_records_nothing() -> Result<()> {
    let (feeder, handle) = start_rx(8)?;

    handle.set_cmd(RxCmd::Go);
    handle.set_sync_seq(2);
    feeder.send(&reply_bytes(3, flags::SYNC))?;
    assert!(handle.wait_sync(3, Duration::from_secs(5)));

    feeder.send(&reply_bytes(4, flags::STOP))?;
    handle.wait_state_leave(RxCmd::Go);
    assert_eq!(handle.with_records(|r| r.recs.len()), 0);
    Ok(())
}

#[test]
fn wait_sync_times_out_without_a_matching_reply() -> Result<()> {
    let (feeder, handle) = start_rx(8)?;
    handle.set_cmd(RxCmd::Go);
    handle.set_sync_seq(0);
    assert!(!handle.wait_sync(99, Duration::from_millis(50)));

    // Park the thread again so teardown stays orderly.
    feeder.send(&reply_bytes(1, flags::STOP))?;
    handle.wait_state_leave(RxCmd::Go);
    Ok(())
}
