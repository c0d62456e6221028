//! bookgen CLI: researches a book on the web and writes an article about it.
//!
//! Every run resumes from what earlier runs stored, so an interrupted or
//! partly failed run can simply be started again.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
