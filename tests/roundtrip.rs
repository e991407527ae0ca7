//! End-to-end properties: byte-exact roundtrip, determinism, bank
//! monotonicity, mask integrity, fallback safety, and the steady-state
//! behavior of long repetitive streams.

use usc::canon::{uncanonicalize, Canonicalizer};
use usc::packet::{decode_data_packet, decode_dict_packet, PacketKind};
use usc::{
    decode, decode_container, encode, encode_to_container, unpack_container, verify_roundtrip,
    Config, Mode,
};

fn lines(strs: &[&str]) -> Vec<Vec<u8>> {
    strs.iter().map(|s| s.as_bytes().to_vec()).collect()
}

fn mixed_corpus() -> Vec<Vec<u8>> {
    let mut out = lines(&[
        "2024-01-01 00:00:00 worker-1 started job 1000001\n",
        "2024-01-01 00:00:01 worker-2 started job 1000002\n",
        "\n",
        "free text without much structure\n",
        "2024-01-01T00:00:02.500Z worker-1 finished job 1000001 rc=0\n",
        "uid=550e8400-e29b-41d4-a716-446655440000 login from 10.0.0.17\n",
        "uid=6ba7b810-9dad-11d1-80b4-00c04fd430c8 login from 10.0.0.18\n",
        "checksum deadbeefcafef00d verified\n",
        "tab\tseparated\tfields here\n",
        "unicode: grüße aus köln ✓\n",
    ]);
    // Invalid UTF-8 passes through as an opaque raw row.
    out.push(vec![0xFF, 0xFE, b'x', b'\n']);
    // Final line without a terminator.
    out.push(b"no trailing newline".to_vec());
    out
}

#[test]
fn p1_roundtrip_all_modes_and_windows() {
    let input = mixed_corpus();
    for mode in [Mode::Stream, Mode::HotLiteFull, Mode::Cold] {
        for window in [1u32, 3, 25] {
            let cfg = Config {
                mode,
                window_size: window,
                ..Config::default()
            };
            verify_roundtrip(&input, &cfg).unwrap_or_else(|e| {
                panic!("roundtrip failed for mode {mode:?} window {window}: {e}")
            });
        }
    }
}

#[test]
fn p1_roundtrip_without_canonicalization() {
    let cfg = Config {
        canonicalize: false,
        ..Config::default()
    };
    verify_roundtrip(&mixed_corpus(), &cfg).unwrap();
}

#[test]
fn p2_encode_is_deterministic() {
    let input = mixed_corpus();
    for mode in [Mode::Stream, Mode::Cold] {
        let cfg = Config {
            mode,
            window_size: 3,
            ..Config::default()
        };
        let a = encode_to_container(input.iter(), &cfg).unwrap();
        let b = encode_to_container(input.iter(), &cfg).unwrap();
        assert_eq!(a, b, "mode {mode:?}");
    }
}

#[test]
fn p3_template_ids_are_monotone_across_prefixes() {
    let input = mixed_corpus();
    let cfg = Config::default();
    let short = encode(input[..6].iter(), &cfg).unwrap();
    let full = encode(input.iter(), &cfg).unwrap();
    let short_dict = decode_dict_packet(&short[0].bytes).unwrap();
    let full_dict = decode_dict_packet(&full[0].bytes).unwrap();
    assert!(short_dict.bank.len() <= full_dict.bank.len());
    for tid in 0..short_dict.bank.len() as u32 {
        assert_eq!(
            short_dict.bank.get(tid).unwrap().to_string(),
            full_dict.bank.get(tid).unwrap().to_string(),
            "template {tid} renumbered"
        );
    }
}

#[test]
fn p4_row_counts_partition_across_packets() {
    let input = mixed_corpus();
    let cfg = Config {
        window_size: 4,
        ..Config::default()
    };
    let blob = encode_to_container(input.iter(), &cfg).unwrap();
    let (_, packets) = unpack_container(&blob).unwrap();
    let dict = decode_dict_packet(&packets[0].bytes).unwrap();
    let mut total = 0usize;
    for p in &packets[1..] {
        assert_eq!(p.kind, PacketKind::Data);
        let rows = decode_data_packet(&p.bytes, &dict).unwrap();
        assert!(rows.len() <= 4);
        total += rows.len();
    }
    assert_eq!(total, input.len());
}

#[test]
fn p5_fallback_values_decode_exactly() {
    // Slot promotes to INT over the first window, then a later window holds
    // a parameter-like value of a different shape and must fall back without
    // losing a byte.
    let mut input: Vec<Vec<u8>> = (0..30)
        .map(|i| format!("queue depth {}\n", i * 3).into_bytes())
        .collect();
    input.push(b"queue depth 10.0.0.9\n".to_vec());
    input.push(b"queue depth 93\n".to_vec());
    let cfg = Config {
        window_size: 10,
        ..Config::default()
    };
    verify_roundtrip(&input, &cfg).unwrap();
}

#[test]
fn p6_canonicalizer_inverts_on_hostile_lines() {
    let canon = Canonicalizer::new();
    let cases = [
        "",
        "\n",
        "1234567890",
        "0001234567 padded epoch\n",
        "9999-99-99 99:99:99 impossible\n",
        "deadbeef DEADBEEF dEaDbEeF\n",
        "550e8400-e29b-41d4-a716-446655440000\n",
        "2024-02-29 23:59:59.123456789 leap day\n",
        "x 12345678901234567890123 overlong digits\n",
        "already has <TS> marker and 1234567890\n",
    ];
    for line in cases {
        let (c, toks) = canon.canonicalize(line);
        assert_eq!(uncanonicalize(&c, &toks).unwrap(), line, "line {line:?}");
    }
}

#[test]
fn p7_packet_sizes_settle_on_stationary_stream() {
    let input: Vec<Vec<u8>> =
        std::iter::repeat(b"081109 203518 148 INFO dfs.DataNode: Receiving block blk_-1608999687919862906\n".to_vec())
            .take(1000)
            .collect();
    let cfg = Config {
        window_size: 25,
        ..Config::default()
    };
    let packets = encode(input.iter(), &cfg).unwrap();
    assert_eq!(packets[0].kind, PacketKind::Dict);
    assert_eq!(packets.len(), 1 + 40);
    let sizes: Vec<usize> = packets[1..].iter().map(|p| p.len()).collect();
    for w in sizes.windows(2) {
        assert!(w[1] <= w[0], "packet grew: {sizes:?}");
    }
    // Converges immediately: full windows are byte-identical.
    assert!(sizes[1..].iter().all(|&s| s == sizes[0]));
}

#[test]
fn scenario_repetitive_template() {
    let line = "081109 203518 148 INFO dfs.DataNode: Receiving block blk_-1608999687919862906\n";
    let input: Vec<Vec<u8>> = std::iter::repeat(line.as_bytes().to_vec()).take(100).collect();
    let cfg = Config {
        window_size: 100,
        ..Config::default()
    };
    let packets = encode(input.iter(), &cfg).unwrap();
    assert_eq!(packets.len(), 2);
    let dict = decode_dict_packet(&packets[0].bytes).unwrap();
    assert_eq!(dict.bank.len(), 1);

    let raw: usize = input.iter().map(|l| l.len()).sum();
    let data = packets[1].len();
    assert!(
        data * 5 < raw,
        "steady-state packet too large: {data} bytes for {raw} raw"
    );
    assert_eq!(decode(packets.iter()).unwrap(), input);
}

#[test]
fn scenario_two_interleaved_templates() {
    let input = lines(&["A 1", "B 2", "A 3", "B 4"]);
    let cfg = Config {
        window_size: 4,
        ..Config::default()
    };
    let packets = encode(input.iter(), &cfg).unwrap();
    let dict = decode_dict_packet(&packets[0].bytes).unwrap();
    assert_eq!(dict.bank.len(), 2);
    assert_eq!(dict.bank.get(0).unwrap().to_string(), "A <*>");
    assert_eq!(dict.bank.get(1).unwrap().to_string(), "B <*>");
    assert_eq!(decode(packets.iter()).unwrap(), input);
}

#[test]
fn scenario_raw_interleaving_preserves_order() {
    let input = lines(&["A 1", "xxx garbage xxx", "A 2"]);
    let cfg = Config::default();
    let packets = encode(input.iter(), &cfg).unwrap();
    let dict = decode_dict_packet(&packets[0].bytes).unwrap();
    let rows = decode_data_packet(&packets[1].bytes, &dict).unwrap();
    assert_eq!(rows, input);
}

#[test]
fn scenario_canonicalization_shape() {
    let canon = Canonicalizer::new();
    let line = "2024-01-01 00:00:00 uid=550e8400-e29b-41d4-a716-446655440000 v=1234567";
    let (c, toks) = canon.canonicalize(line);
    assert_eq!(c, "<TS> uid=<UUID> v=<INT>");
    assert_eq!(toks.len(), 3);
    assert_eq!(uncanonicalize(&c, &toks).unwrap(), line);
}

#[test]
fn scenario_template_overflow_degrades_to_raw() {
    let input: Vec<Vec<u8>> = (0..100_000)
        .map(|i| format!("uniq{i} payload\n").into_bytes())
        .collect();
    let cfg = Config {
        max_templates: 1024,
        window_size: 1000,
        ..Config::default()
    };
    let packets = encode(input.iter(), &cfg).unwrap();
    let dict = decode_dict_packet(&packets[0].bytes).unwrap();
    assert_eq!(dict.bank.len(), 1024);
    assert_eq!(decode(packets.iter()).unwrap(), input);
}

#[test]
fn scenario_cross_packet_steady_state() {
    let input: Vec<Vec<u8>> = std::iter::repeat(b"svc tick seq 42 ok\n".to_vec())
        .take(1000)
        .collect();
    let cfg = Config {
        window_size: 25,
        ..Config::default()
    };
    let packets = encode(input.iter(), &cfg).unwrap();
    let dict_count = packets
        .iter()
        .filter(|p| p.kind == PacketKind::Dict)
        .count();
    assert_eq!(dict_count, 1);
    let sizes: Vec<usize> = packets[1..].iter().map(|p| p.len()).collect();
    // Size settles within two packets on a stationary stream.
    assert!(sizes[2..].iter().all(|&s| s <= sizes[1]));
}

#[test]
fn cold_mode_beats_stream_on_repetitive_input() {
    let input: Vec<Vec<u8>> = (0..2000)
        .map(|i| {
            format!(
                "2024-03-01 10:00:00 INFO worker-{} heartbeat seq={}\n",
                i % 4,
                100000 + i
            )
            .into_bytes()
        })
        .collect();
    let stream = encode_to_container(
        input.iter(),
        &Config {
            mode: Mode::Stream,
            ..Config::default()
        },
    )
    .unwrap();
    let cold = encode_to_container(
        input.iter(),
        &Config {
            mode: Mode::Cold,
            ..Config::default()
        },
    )
    .unwrap();
    assert!(cold.len() < stream.len());
    assert_eq!(decode_container(&cold).unwrap(), input);
}

#[test]
fn container_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.usc");
    let input = mixed_corpus();
    let blob = encode_to_container(input.iter(), &Config::default()).unwrap();
    std::fs::write(&path, &blob).unwrap();
    let read = std::fs::read(&path).unwrap();
    assert_eq!(decode_container(&read).unwrap(), input);
}
