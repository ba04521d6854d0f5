mod cli;
mod engine;
mod error;
mod logging;
mod maps;
mod model;
mod orchestrator;
mod prefs;
#[cfg(test)]
mod test_support;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    // The TUI owns the terminal, so its diagnostics go to a file.
    let log_init = if args.uses_tui() {
        match logging::default_log_path() {
            Some(path) => logging::init_file(&path),
            None => Ok(()),
        }
    } else {
        logging::init_stderr()
    };
    if let Err(e) = log_init {
        eprintln!("warning: {e:#}");
    }

    cli::run(args).await
}
