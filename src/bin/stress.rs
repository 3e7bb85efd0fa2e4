//! kvdb-stress - multi-process stress harness
//!
//! Runs a mix of concurrent workers against one key for a fixed time. Every
//! operation is a fresh `kvdb` process, so the only coordination between
//! them is the store's own locks. At the end the log must hold at most one
//! record for the key.

use std::path::PathBuf;
use std::process::{ExitCode, Stdio};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(name = "kvdb-stress", about = "Hammer one key from many kvdb processes")]
struct Args {
    /// How long to run, in seconds
    #[arg(long, default_value_t = 60)]
    duration: u64,

    /// Key every worker operates on
    #[arg(long, default_value = "apple")]
    key: String,

    /// Number of concurrent setter workers
    #[arg(long, default_value_t = 2)]
    setters: usize,

    /// Upper bound on the random pause between operations, in milliseconds
    #[arg(long, default_value_t = 1000)]
    max_pause_ms: u64,

    /// Pause between deletes, in seconds
    #[arg(long, default_value_t = 10)]
    delete_every: u64,

    /// Path to the kvdb binary (defaults to the one next to this executable)
    #[arg(long)]
    binary: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Set,
    Get,
    Del,
    Ts,
}

// == Worker Tally ==
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    ok: u64,
    not_found: u64,
    failed: u64,
}

#[derive(Debug, Clone)]
struct Runner {
    binary: PathBuf,
    common: Vec<String>,
}

impl Runner {
    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.common).args(args).stdin(Stdio::null());
        cmd
    }

    /// Runs one kvdb operation to completion.
    async fn run(&self, op: Op, key: &str, value: &str, tally: &mut Tally) {
        let args: Vec<&str> = match op {
            Op::Set => vec!["set", key, value],
            Op::Get => vec!["get", key],
            Op::Del => vec!["del", key],
            Op::Ts => vec!["ts", key],
        };
        match self.command(&args).output().await {
            Ok(output) if output.status.success() => tally.ok += 1,
            Ok(output) if String::from_utf8_lossy(&output.stdout).trim() == "Key not found" => {
                tally.not_found += 1
            }
            Ok(output) => {
                warn!(
                    "{:?} failed: {}",
                    op,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                tally.failed += 1;
            }
            Err(e) => {
                warn!("Failed to spawn {}: {}", self.binary.display(), e);
                tally.failed += 1;
            }
        }
    }
}

async fn worker(runner: Runner, op: Op, args: Args, id: usize, deadline: Instant) -> Tally {
    let mut rng = StdRng::from_entropy();
    let mut tally = Tally::default();

    while Instant::now() < deadline {
        let value = rng.gen_range(1..=100).to_string();
        debug!("Worker {} running {:?}", id, op);
        runner.run(op, &args.key, &value, &mut tally).await;

        let pause = match op {
            Op::Del => Duration::from_secs(args.delete_every),
            _ => Duration::from_millis(rng.gen_range(0..=args.max_pause_ms)),
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        sleep(pause.min(remaining)).await;
    }
    tally
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kvdb_stress=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let binary = match &args.binary {
        Some(path) => path.clone(),
        None => std::env::current_exe()
            .context("cannot locate current executable")?
            .with_file_name("kvdb"),
    };
    let mut common = Vec::new();
    if let Some(dir) = &args.data_dir {
        common.push("--data-dir".to_string());
        common.push(dir.display().to_string());
    }
    if let Some(dir) = &args.cache_dir {
        common.push("--cache-dir".to_string());
        common.push(dir.display().to_string());
    }
    let runner = Runner { binary, common };

    let mut ops = vec![Op::Set; args.setters];
    ops.extend([Op::Get, Op::Del, Op::Ts]);

    info!(
        "Running {} workers on '{}' for {}s",
        ops.len(),
        args.key,
        args.duration
    );
    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let handles: Vec<_> = ops
        .iter()
        .enumerate()
        .map(|(id, &op)| {
            let task = worker(runner.clone(), op, args.clone(), id, deadline);
            (op, tokio::spawn(task))
        })
        .collect();

    let mut failed = 0;
    for (id, (op, handle)) in handles.into_iter().enumerate() {
        let tally = handle.await.context("worker panicked")?;
        println!(
            "worker {} {:?}: ok={} not_found={} failed={}",
            id, op, tally.ok, tally.not_found, tally.failed
        );
        failed += tally.failed;
    }

    let output = runner
        .command(&["dump"])
        .output()
        .await
        .context("failed to run final dump")?;
    if !output.status.success() {
        bail!(
            "final dump failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let prefix = format!("{}\t", args.key);
    let copies = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| line.starts_with(&prefix))
        .count();

    println!("records for '{}': {}", args.key, copies);
    if copies > 1 {
        bail!("log holds {} records for '{}'", copies, args.key);
    }
    if failed > 0 {
        bail!("{} operations failed", failed);
    }
    Ok(())
}
