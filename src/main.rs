//! Command-line surface for the Unified State Codec.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use usc::{
    decode_container, decode_rows, encode_to_container, verify_roundtrip, Config, Mode, UscError,
};

#[derive(Parser)]
#[command(name = "usc")]
#[command(version, about = "Lossless template-mining compression for log and trace streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a line stream into a container
    Encode {
        /// Surface mode
        #[arg(long, value_enum, default_value = "stream")]
        mode: ModeArg,
        /// Input path
        #[arg(long = "in")]
        input: PathBuf,
        /// Output path
        #[arg(long)]
        out: PathBuf,
    },
    /// Decode a container back to the original bytes
    Decode {
        /// Input path
        #[arg(long = "in")]
        input: PathBuf,
        /// Output path
        #[arg(long)]
        out: PathBuf,
    },
    /// Print a row range from a hot-lite-full container
    Query {
        /// Input path
        #[arg(long = "in")]
        input: PathBuf,
        /// First row
        #[arg(long, default_value_t = 0)]
        start: u64,
        /// Number of rows
        #[arg(long, default_value_t = 10)]
        count: u64,
    },
    /// Encode a synthetic stream in every mode and print a scoreboard
    Bench {
        /// Number of synthetic lines
        #[arg(long, default_value_t = 10_000)]
        lines: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Stream,
    HotLiteFull,
    Cold,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Mode {
        match m {
            ModeArg::Stream => Mode::Stream,
            ModeArg::HotLiteFull => Mode::HotLiteFull,
            ModeArg::Cold => Mode::Cold,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn exit_code(err: &UscError) -> u8 {
    match err {
        UscError::VersionUnsupported { .. } => 2,
        UscError::Io(_) => 3,
        _ => 1,
    }
}

fn split_lines(contents: &[u8]) -> Vec<&[u8]> {
    contents.split_inclusive(|&b| b == b'\n').collect()
}

fn pretty(n: usize) -> String {
    if n >= 1_000_000 {
        format!("{:.2} MB", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2} KB", n as f64 / 1_000.0)
    } else {
        format!("{n} B")
    }
}

fn ratio(raw: usize, comp: usize) -> f64 {
    raw as f64 / comp.max(1) as f64
}

fn run(command: Commands) -> Result<(), UscError> {
    match command {
        Commands::Encode { mode, input, out } => {
            let contents = std::fs::read(&input)?;
            let lines = split_lines(&contents);
            let cfg = Config {
                mode: mode.into(),
                ..Config::from_env()
            };
            let t0 = Instant::now();
            let blob = encode_to_container(lines.iter(), &cfg)?;
            let ms = t0.elapsed().as_secs_f64() * 1000.0;
            std::fs::write(&out, &blob)?;
            println!("raw:     {}", pretty(contents.len()));
            println!("encoded: {}   build={ms:.2} ms", pretty(blob.len()));
            println!("ratio:   {:.2}x", ratio(contents.len(), blob.len()));
            Ok(())
        }
        Commands::Decode { input, out } => {
            let blob = std::fs::read(&input)?;
            let lines = decode_container(&blob)?;
            let mut contents = Vec::new();
            for line in &lines {
                contents.extend_from_slice(line);
            }
            std::fs::write(&out, &contents)?;
            println!("decoded {} lines, {}", lines.len(), pretty(contents.len()));
            Ok(())
        }
        Commands::Query {
            input,
            start,
            count,
        } => {
            let blob = std::fs::read(&input)?;
            let rows = decode_rows(&blob, start, count)?;
            for row in &rows {
                print!("{}", String::from_utf8_lossy(row));
            }
            debug!(rows = rows.len(), "query complete");
            Ok(())
        }
        Commands::Bench { lines } => bench(lines),
    }
}

/// Deterministic synthetic stream: repetitive service logs, an agent tool
/// trace, and occasional unstructured noise.
fn synthetic_lines(n: usize) -> Vec<Vec<u8>> {
    (0..n)
        .map(|i| {
            let h = (i as u64).wrapping_mul(2654435761) % 1_000_000;
            match i % 8 {
                0 | 1 | 2 => format!(
                    "2024-03-{:02} 10:{:02}:{:02} INFO worker-{} heartbeat seq={}\n",
                    i % 27 + 1,
                    i % 60,
                    (i * 7) % 60,
                    i % 4,
                    100000 + i
                ),
                3 | 4 => format!(
                    "2024-03-01 10:00:00 INFO dfs.DataNode: Receiving block blk_{} src: 10.0.0.{} dest: 10.0.1.{}\n",
                    1_000_000_000_000u64 + h,
                    i % 250 + 1,
                    (i * 3) % 250 + 1
                ),
                5 => format!(
                    "agent tool_call name=search args_hash={:08x} latency_ms={}\n",
                    h,
                    h % 500
                ),
                6 => format!(
                    "agent tool_result id=550e8400-e29b-41d4-a716-{:012x} bytes={}\n",
                    h, h % 9000
                ),
                _ => format!("### unstructured note {} ###\n", i),
            }
            .into_bytes()
        })
        .collect()
}

fn bench(n: usize) -> Result<(), UscError> {
    let lines = synthetic_lines(n);
    let raw: usize = lines.iter().map(|l| l.len()).sum();
    let joined: Vec<u8> = lines.concat();

    println!("lines: {n}   raw: {}", pretty(raw));
    println!("{:-<60}", "");

    let t0 = Instant::now();
    let zstd_only = zstd::encode_all(joined.as_slice(), 19)?;
    println!(
        "{:<16} {:>10}  {:>7.2}x  {:>8.2} ms",
        "zstd(19)",
        pretty(zstd_only.len()),
        ratio(raw, zstd_only.len()),
        t0.elapsed().as_secs_f64() * 1000.0
    );

    for mode in [Mode::Stream, Mode::HotLiteFull, Mode::Cold] {
        let cfg = Config {
            mode,
            ..Config::from_env()
        };
        verify_roundtrip(&lines, &cfg)?;
        let t0 = Instant::now();
        let blob = encode_to_container(lines.iter(), &cfg)?;
        let ms = t0.elapsed().as_secs_f64() * 1000.0;
        let name = match mode {
            Mode::Stream => "usc stream",
            Mode::HotLiteFull => "usc hot-lite-full",
            Mode::Cold => "usc cold",
        };
        println!(
            "{:<16} {:>10}  {:>7.2}x  {:>8.2} ms",
            name,
            pretty(blob.len()),
            ratio(raw, blob.len()),
            ms
        );
    }
    println!("{:-<60}", "");
    println!("roundtrip verified for all modes");
    Ok(())
}
