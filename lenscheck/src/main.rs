// lenscheck/src/main.rs
//
// lenscheck: image provenance worker
//
// Long-lived NDJSON worker. A supervising process writes one request per line
// to stdin and reads one response per line from stdout. Each response merges
// the classifier ensemble's AI-generation verdict with three forensic signals
// (ELA, EXIF metadata, noise residual).
//
// The classifier ensemble runs as one long-lived predictor child process,
// started at boot and fed one image path per request (see ensemble.rs).
//
// stdout carries protocol records only; all logging goes to stderr.
//
// Exit codes:
//   0  stdin closed
//   1  the predictor could not be started or never reported ready
//      (after an error readiness record)
//
// Usage:
//   lenscheck --predictor ./predict.py --model resnet34 --model efficientnet_b0
//   lenscheck --predictor ./predict.py --policy forensics.json --ela-quality 95
//   RUST_LOG=lenscheck=debug lenscheck --predictor ./predict.py --disable-forensics

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod detectors;
mod ensemble;
mod error;
mod forensics;
mod protocol;
mod worker;

use config::{EnsembleConfig, ForensicPolicy};
use ensemble::CommandLoader;
use forensics::Forensics;
use worker::Startup;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "lenscheck",
    about   = "Image provenance worker: AI-generation verdict + tamper forensics over NDJSON",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, help = "Classifier ensemble executable, started once as <predictor> [args...]")]
    predictor: Option<PathBuf>,

    #[arg(long = "predictor-arg", allow_hyphen_values = true,
          help = "Extra predictor startup argument (repeatable)")]
    predictor_args: Vec<String>,

    #[arg(long = "model", help = "Ensemble member name announced at startup (repeatable)")]
    models: Vec<String>,

    #[arg(long, help = "JSON forensic policy file")]
    policy: Option<PathBuf>,

    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100),
          help = "JPEG quality for the ELA re-encode [default: 90]")]
    ela_quality: Option<u8>,

    #[arg(long, help = "Run without the forensic suite")]
    disable_forensics: bool,
}

impl Cli {
    fn forensic_policy(&self) -> Result<ForensicPolicy> {
        if self.disable_forensics {
            return Err(anyhow!("disabled by --disable-forensics"));
        }
        let mut policy = match &self.policy {
            Some(path) => ForensicPolicy::from_file(path)?,
            None => ForensicPolicy::default(),
        };
        if let Some(q) = self.ela_quality {
            policy.ela.quality = q;
        }
        Ok(policy)
    }

    fn ensemble_config(&self) -> EnsembleConfig {
        EnsembleConfig {
            predictor:      self.predictor.clone(),
            predictor_args: self.predictor_args.clone(),
            models:         self.models.clone(),
        }
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("lenscheck=info".parse()?))
        .with_writer(std::io::stderr)
        .compact().init();

    let cli       = Cli::parse();
    let forensics = Forensics::negotiate(cli.forensic_policy());
    let loader    = CommandLoader::new(cli.ensemble_config());
    let startup   = worker::start(&loader, forensics);

    let mut stdout = tokio::io::stdout();
    worker::write_record(&mut stdout, &serde_json::to_vec(startup.record())?).await?;

    let ctx = match startup {
        Startup::Ready(ctx, _) => ctx,
        Startup::Failed(_) => std::process::exit(1),
    };

    info!("Reading requests from stdin");
    let stdin = BufReader::new(tokio::io::stdin());
    worker::serve(ctx, stdin, &mut stdout).await?;
    Ok(())
}
