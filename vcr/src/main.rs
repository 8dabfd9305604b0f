//! `codex-vcr` entry point.
//!
//! Operator commands for a cassette store.
//!
//! ## Commands
//!
//! - `codex-vcr status` - Show the resolved mode and store contents
//! - `codex-vcr verify` - Check every cassette seal (CI pre-flight)
//! - `codex-vcr sweep` - Delete cassettes past the retention age
//! - `codex-vcr forget <provider> <signature>` - Delete one cassette
//!
//! Exit codes: 0 ok, 1 warning, 2 failure.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use codex_vcr::CassetteStore;
use codex_vcr::Provider;
use codex_vcr::RetentionSweeper;
use codex_vcr::Signature;
use codex_vcr::VcrConfig;
use codex_vcr::VcrSession;
use tokio_util::sync::CancellationToken;

/// Record/replay store maintenance
#[derive(Debug, Parser)]
#[command(name = "codex-vcr", version)]
struct Cli {
    /// Config file (default: $CODEX_VCR_CONFIG or ~/.config/codex/vcr.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the resolved mode, store root and cassette counts
    Status,

    /// Verify the integrity seal of every cassette
    ///
    /// Exits 2 if any cassette is corrupt. Run this before a strict-mode
    /// CI job to fail fast on tampered fixtures.
    Verify(VerifyArgs),

    /// Delete cassettes older than the retention age
    Sweep(SweepArgs),

    /// Delete one cassette so the next auto/record run captures it again
    Forget(ForgetArgs),
}

#[derive(Debug, Parser)]
struct VerifyArgs {
    /// Output as JSON for automation
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct SweepArgs {
    /// Override retention.max_age_days from config
    #[arg(long, value_name = "DAYS")]
    max_age_days: Option<u64>,

    /// Keep running, sweeping every retention.sweep_interval_secs until Ctrl+C
    #[arg(long)]
    watch: bool,
}

#[derive(Debug, Parser)]
struct ForgetArgs {
    /// Provider namespace (openai, anthropic, gemini, ollama)
    provider: Provider,

    /// 32-character cassette signature
    signature: Signature,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => VcrConfig::load_from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => VcrConfig::load().context("loading vcr config")?,
    };
    if cli.config.is_some() {
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
    }
    let session = VcrSession::from_config(&config)?;

    let code = match cli.command {
        Command::Status => run_status(&session)?,
        Command::Verify(args) => run_verify(&session, &args)?,
        Command::Sweep(args) => run_sweep(&session, &args).await?,
        Command::Forget(args) => run_forget(&session, &args)?,
    };
    Ok(ExitCode::from(code))
}

fn run_status(session: &VcrSession) -> anyhow::Result<u8> {
    let store = session.store();
    let cassettes = store.list()?;

    let mut counts: BTreeMap<Provider, usize> = BTreeMap::new();
    for cassette in &cassettes {
        *counts.entry(cassette.provider).or_default() += 1;
    }

    println!("mode:       {}", session.mode());
    println!("store:      {}", store.root().display());
    println!(
        "seal:       {}",
        if store.sealer().is_keyed() { "hmac-sha256" } else { "sha256" }
    );
    match session.retention() {
        Some(age) => println!("retention:  {} days", age.as_secs() / 86_400),
        None => println!("retention:  disabled"),
    }
    println!("cassettes:  {}", cassettes.len());
    for provider in Provider::ALL {
        println!(
            "  {:<10} {}",
            provider.as_str(),
            counts.get(&provider).copied().unwrap_or(0)
        );
    }
    Ok(0)
}

fn run_verify(session: &VcrSession, args: &VerifyArgs) -> anyhow::Result<u8> {
    let store = session.store();
    let entries = store.verify_all()?;
    let corrupt: Vec<_> = entries.iter().filter(|e| e.corruption.is_some()).collect();

    if args.json {
        let checks: Vec<serde_json::Value> = entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "provider": entry.cassette.provider,
                    "signature": entry.cassette.signature,
                    "path": entry.cassette.path,
                    "status": if entry.corruption.is_some() { "corrupt" } else { "ok" },
                    "expected": entry.corruption.as_ref().map(|c| &c.expected),
                    "actual": entry.corruption.as_ref().map(|c| &c.actual),
                    "detail": entry.corruption.as_ref().map(|c| &c.detail),
                })
            })
            .collect();
        let output = serde_json::json!({
            "store": store.root(),
            "cassettes": checks,
            "overall": if corrupt.is_empty() { "pass" } else { "fail" },
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for entry in &corrupt {
            if let Some(corruption) = &entry.corruption {
                println!(
                    "\x1b[31m[FAIL]\x1b[0m {}/{}: {}",
                    entry.cassette.provider, entry.cassette.signature, corruption.detail
                );
                println!("       expected {}", corruption.expected);
                println!("       computed {}", corruption.actual);
                println!(
                    "       Fix: inspect {}, then `codex-vcr forget {} {}` and re-record",
                    entry.cassette.path.display(),
                    entry.cassette.provider,
                    entry.cassette.signature
                );
            }
        }
        if corrupt.is_empty() {
            println!(
                "\x1b[32mResult: all {} cassettes verified\x1b[0m",
                entries.len()
            );
        } else {
            println!(
                "\x1b[31mResult: {}/{} cassettes corrupt\x1b[0m",
                corrupt.len(),
                entries.len()
            );
        }
    }

    Ok(if corrupt.is_empty() { 0 } else { 2 })
}

async fn run_sweep(session: &VcrSession, args: &SweepArgs) -> anyhow::Result<u8> {
    let max_age = args
        .max_age_days
        .map(|days| Duration::from_secs(days.saturating_mul(86_400)))
        .or(session.retention());
    let Some(max_age) = max_age else {
        eprintln!("retention is disabled; pass --max-age-days or set retention.max_age_days");
        return Ok(2);
    };
    if max_age.is_zero() {
        eprintln!("--max-age-days must be positive");
        return Ok(2);
    }

    let store: Arc<CassetteStore> = Arc::new(session.store());
    let sweeper = RetentionSweeper::new(store, max_age)?;

    if !args.watch {
        let report = sweeper.sweep().await?;
        println!(
            "deleted {}, retained {}, skipped {}",
            report.deleted, report.retained, report.skipped
        );
        return Ok(if report.skipped > 0 { 1 } else { 0 });
    }

    let cancel = CancellationToken::new();
    let handle = sweeper.spawn(session.sweep_interval(), cancel.clone());
    tracing::info!(
        interval_secs = session.sweep_interval().as_secs(),
        "retention sweeper running; Ctrl+C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    cancel.cancel();
    handle.await.context("sweeper task")?;
    Ok(0)
}

fn run_forget(session: &VcrSession, args: &ForgetArgs) -> anyhow::Result<u8> {
    let store = session.store();
    let path = store.cassette_path(args.provider, &args.signature);
    if store.remove(args.provider, &args.signature)? {
        println!("removed {}", path.display());
        Ok(0)
    } else {
        println!("no cassette at {}", path.display());
        Ok(1)
    }
}
