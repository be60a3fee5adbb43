use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::run;
use crate::verify;

/// conform - run or verify a HELM conformance EvidencePack.
#[derive(Parser)]
#[command(name = "conform")]
#[command(about = "HELM conformance engine CLI: run gates against an EvidencePack, or verify one on disk")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct ConformCli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose (debug-level) logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a profile's required gates against an EvidencePack, writing 01_SCORE.json/00_INDEX.json.
    Run {
        /// Conformance profile key (SMB, CORE, ENTERPRISE, REGULATED_FINANCE, REGULATED_HEALTH, AGENTIC_WEB_ROUTER)
        #[arg(long)]
        profile: String,

        /// Jurisdiction code recorded on the report
        #[arg(long)]
        jurisdiction: String,

        /// Comma-separated gate ids to run instead of the profile's required set
        #[arg(long)]
        gate_filter: Option<String>,

        /// EvidencePack directory to run against
        #[arg(long)]
        output: PathBuf,
    },

    /// Re-hash every indexed file and recompute every receipt's hash/signature, failing on any mismatch.
    Verify {
        /// EvidencePack directory to verify
        evidence_dir: PathBuf,

        /// Hex-encoded Ed25519 public key to check 07_ATTESTATIONS/conformance_report.sig against, if present
        #[arg(long)]
        signer_public_key_hex: Option<String>,
    },

    /// Report whether this binary can reach the conformance engine. Always succeeds.
    Status,
}

impl ConformCli {
    pub fn is_json(&self) -> bool {
        self.format == "json"
    }

    pub async fn execute(&self) -> Result<()> {
        let level = if self.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
        tracing_subscriber::fmt().with_max_level(level).init();

        info!("conform v{}", env!("CARGO_PKG_VERSION"));

        match &self.command {
            Commands::Run { profile, jurisdiction, gate_filter, output } => {
                let pass = run::handle_run(profile, jurisdiction, gate_filter.as_deref(), output, self.is_json()).await?;
                std::process::exit(if pass { 0 } else { 1 });
            }
            Commands::Verify { evidence_dir, signer_public_key_hex } => {
                let ok = verify::handle_verify(evidence_dir, signer_public_key_hex.as_deref(), self.is_json()).await?;
                std::process::exit(if ok { 0 } else { 1 });
            }
            Commands::Status => {
                self.handle_status();
                Ok(())
            }
        }
    }

    fn handle_status(&self) {
        if self.is_json() {
            println!(
                "{}",
                serde_json::json!({
                    "status": "operational",
                    "version": env!("CARGO_PKG_VERSION"),
                })
            );
        } else {
            println!("conform: operational (v{})", env!("CARGO_PKG_VERSION"));
        }
    }
}
