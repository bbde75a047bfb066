use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use stream_bench_codec::{GapStats, Reply, Request, flags};

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("message");
    group.throughput(Throughput::Elements(1));

    // The sender re-encodes a request for every paced message, so this is
    // the hot path of the whole tool.
    let mut req = Request {
        timestamp: 0x1234_5678_9abc_def0,
        seq: 0,
        send_lateness: 17,
        flags: flags::SAVE,
        reply_seq: 3,
    };
    let mut buf = [0u8; Request::WIRE_SIZE];
    group.bench_function("encode_request", |bencher| {
        bencher.iter(|| {
            req.seq = req.seq.wrapping_add(1);
            req.encode(&mut buf).unwrap();
        })
    });

    let reply = Reply {
        request: req,
        s_timestamp: 42,
        gap_stats: GapStats {
            n_msgs_dropped: 5,
            n_gaps: 1,
            n_ooo: 0,
        },
    };
    let mut reply_buf = [0u8; Reply::WIRE_SIZE];
    reply.encode(&mut reply_buf).unwrap();
    group.bench_function("decode_reply", |bencher| {
        bencher.iter(|| Reply::decode(&reply_buf).unwrap())
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
