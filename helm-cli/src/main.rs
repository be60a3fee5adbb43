// conform - the HELM conformance CLI: run a profile's gates against an
// EvidencePack, or verify a pack already on disk.

use clap::Parser;
use anyhow::Result;

mod cli;
mod run;
mod verify;

use cli::ConformCli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ConformCli::parse();
    cli.execute().await
}
