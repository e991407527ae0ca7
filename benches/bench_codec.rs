use criterion::{black_box, criterion_group, criterion_main, Criterion};
use usc::{decode_container, encode_to_container, Config, Mode};

fn repetitive_log(n: usize) -> Vec<Vec<u8>> {
    (0..n)
        .map(|i| {
            format!(
                "2024-03-01 10:00:00 INFO dfs.DataNode: Receiving block blk_{} src: 10.0.0.{} dest: 10.0.1.{}\n",
                1_000_000_000_000u64 + i as u64,
                i % 250 + 1,
                (i * 3) % 250 + 1
            )
            .into_bytes()
        })
        .collect()
}

fn varied_trace(n: usize) -> Vec<Vec<u8>> {
    (0..n)
        .map(|i| {
            let h = (i as u64).wrapping_mul(2654435761) % 1_000_000;
            match i % 4 {
                0 => format!("agent tool_call name=search args_hash={:08x}\n", h),
                1 => format!("agent tool_result bytes={} latency_ms={}\n", h % 9000, h % 500),
                2 => format!("worker-{} heartbeat seq={}\n", i % 4, 100000 + i),
                _ => format!("### note {} ###\n", i),
            }
            .into_bytes()
        })
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let repetitive = repetitive_log(2000);
    let varied = varied_trace(2000);

    for (name, corpus) in [("repetitive", &repetitive), ("varied", &varied)] {
        for (mode_name, mode) in [("stream", Mode::Stream), ("cold", Mode::Cold)] {
            let cfg = Config {
                mode,
                ..Config::default()
            };
            c.bench_function(&format!("encode_{name}_{mode_name}_2k"), |b| {
                b.iter(|| black_box(encode_to_container(corpus.iter(), &cfg).unwrap()))
            });
        }
    }
}

fn bench_decode(c: &mut Criterion) {
    let corpus = repetitive_log(2000);
    let blob = encode_to_container(corpus.iter(), &Config::default()).unwrap();
    c.bench_function("decode_repetitive_stream_2k", |b| {
        b.iter(|| black_box(decode_container(black_box(&blob)).unwrap()))
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
