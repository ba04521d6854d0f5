use crate::engine::{RunSink, RunSupervisor};
use crate::error::RunError;
use crate::model::RunEvent;
use crate::orchestrator::RunRegistry;
use crate::prefs::{self, Prefs};
use anyhow::{Context, Result};
use clap::Parser;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output routing for the stdout/stderr writer.
#[derive(Debug, PartialEq, Eq)]
enum OutputLine {
    /// Render output exactly as received.
    StdoutRaw(String),
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = stdout.lock();
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::StdoutRaw(chunk) => {
                    let _ = out.write_all(chunk.as_bytes());
                    let _ = out.flush();
                }
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                    let _ = out.flush();
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "overviewer-tui",
    version,
    about = "Launch and monitor Minecraft Overviewer renders from the terminal"
)]
pub struct Cli {
    /// Path to the Overviewer executable (overrides the saved setting)
    #[arg(long)]
    pub executable: Option<PathBuf>,

    /// Minecraft save folder containing one folder per map (overrides the saved setting)
    #[arg(long)]
    pub saves: Option<PathBuf>,

    /// Folder that receives one rendered map folder per map (overrides the saved setting)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Run without the TUI and stream render output to stdout
    #[arg(long)]
    pub headless: bool,

    /// Map to render in headless mode (repeatable)
    #[arg(long = "map", value_name = "NAME")]
    pub maps: Vec<String>,

    /// Print the maps found in the save folder and exit
    #[arg(long)]
    pub list_maps: bool,

    /// Maximum number of Overviewer processes running at once (unlimited by default)
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// How long to wait for a stopped Overviewer process to exit before retrying the kill
    #[arg(long, default_value = "5s")]
    pub stop_timeout: humantime::Duration,

    /// Settings file (defaults to the user config directory)
    #[arg(long)]
    pub prefs: Option<PathBuf>,

    /// Do not write settings back on exit
    #[arg(long)]
    pub no_save_prefs: bool,
}

impl Cli {
    /// Interactive mode: no headless flags, no maps named on the command line.
    pub fn uses_tui(&self) -> bool {
        !self.headless && !self.list_maps && self.maps.is_empty()
    }

    pub fn prefs_path(&self) -> Option<PathBuf> {
        self.prefs.clone().or_else(prefs::default_prefs_path)
    }

    pub fn supervisor(&self) -> RunSupervisor {
        RunSupervisor::new(Duration::from(self.stop_timeout))
    }

    pub fn registry(&self) -> RunRegistry {
        RunRegistry::new(self.supervisor(), self.max_concurrent)
    }
}

/// Saved settings, with first-launch defaults for empty fields and CLI overrides on top.
pub fn resolve_settings(args: &Cli) -> Result<Prefs> {
    let defaults = Prefs::defaults_for(dirs::home_dir().as_deref());
    let saved = match args.prefs_path() {
        Some(path) => prefs::load(&path)?,
        None => None,
    };
    let mut settings = saved.unwrap_or_default().or_defaults(&defaults);
    if let Some(p) = &args.executable {
        settings.executable = p.display().to_string();
    }
    if let Some(p) = &args.saves {
        settings.saves_folder = p.display().to_string();
    }
    if let Some(p) = &args.output {
        settings.output_folder = p.display().to_string();
    }
    Ok(settings)
}

pub async fn run(args: Cli) -> Result<()> {
    if args.list_maps {
        let settings = resolve_settings(&args)?;
        let maps = crate::maps::list_maps(std::path::Path::new(settings.saves_folder.trim()))?;
        for map in maps {
            println!("{map}");
        }
        return Ok(());
    }

    if args.uses_tui() {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            return Err(anyhow::anyhow!(
                "built without TUI support; use --headless --map <NAME>"
            ));
        }
    }

    run_headless(args).await
}

/// Splits relayed chunks into whole lines so output of several maps can be interleaved
/// with a per-map prefix.
#[derive(Debug, Default)]
struct LineSplitter {
    partial: String,
}

impl LineSplitter {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let rest = self.partial.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.partial, rest);
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}

async fn run_headless(args: Cli) -> Result<()> {
    let (out_tx, out_handle) = spawn_output_writer();
    let res = render_headless(&args, out_tx).await;
    let _ = out_handle.await;
    res
}

/// Render the requested maps without the TUI, writing to `out_tx`. Maps beyond
/// `--max-concurrent` wait for a free slot. Fails if any map did not complete with
/// exit code 0.
async fn render_headless(args: &Cli, out_tx: mpsc::UnboundedSender<OutputLine>) -> Result<()> {
    if args.maps.is_empty() {
        return Err(anyhow::anyhow!("--headless needs at least one --map <NAME>"));
    }
    let settings = resolve_settings(args)?;
    let mut registry = args.registry();

    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<RunEvent>();
    let sink: Arc<dyn RunSink> = Arc::new(evt_tx);

    let mut pending: VecDeque<String> = VecDeque::new();
    for map in &args.maps {
        if !pending.contains(map) {
            pending.push_back(map.clone());
        }
    }
    let total = pending.len();
    let prefixed = total > 1;
    let mut outstanding = 0usize;
    let mut failures = 0usize;
    let mut splitters: HashMap<String, LineSplitter> = HashMap::new();

    let start_pending = |registry: &mut RunRegistry,
                             pending: &mut VecDeque<String>,
                             outstanding: &mut usize,
                             failures: &mut usize| {
        while let Some(map) = pending.front().cloned() {
            match registry.request_run(&settings.request(&map), sink.clone()) {
                Ok(handle) => {
                    let _ = out_tx.send(OutputLine::Stderr(format!(
                        "[{map}] started: {}",
                        handle.command().display()
                    )));
                    *outstanding += 1;
                }
                Err(RunError::ConcurrencyLimit { .. }) => break,
                Err(e) => {
                    let _ = out_tx.send(OutputLine::Stderr(format!("[{map}] {e}")));
                    *failures += 1;
                }
            }
            pending.pop_front();
        }
    };

    start_pending(&mut registry, &mut pending, &mut outstanding, &mut failures);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    while outstanding > 0 {
        tokio::select! {
            ev = evt_rx.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    RunEvent::Output { id, chunk, .. } => {
                        if prefixed {
                            let splitter = splitters.entry(id.clone()).or_default();
                            for line in splitter.push(&chunk) {
                                let _ = out_tx.send(OutputLine::Stdout(format!("[{id}] {line}")));
                            }
                        } else {
                            let _ = out_tx.send(OutputLine::StdoutRaw(chunk));
                        }
                    }
                    RunEvent::Finished { id, state, .. } => {
                        if let Some(rest) = splitters.get_mut(&id).and_then(LineSplitter::finish) {
                            let _ = out_tx.send(OutputLine::Stdout(format!("[{id}] {rest}")));
                        }
                        let elapsed = registry
                            .get(&id)
                            .map(|h| format!(" after {}", crate::model::format_elapsed(h.started_at().elapsed())))
                            .unwrap_or_default();
                        let _ = out_tx.send(OutputLine::Stderr(format!(
                            "[{id}] {}{elapsed}",
                            state.describe()
                        )));
                        if !matches!(state.outcome(), Some(Ok(_))) {
                            failures += 1;
                        }
                        outstanding = outstanding.saturating_sub(1);
                        if !interrupted {
                            start_pending(&mut registry, &mut pending, &mut outstanding, &mut failures);
                        }
                    }
                    _ => {}
                }
            }
            res = &mut ctrl_c, if !interrupted => {
                res.context("listen for Ctrl-C")?;
                interrupted = true;
                failures += pending.len();
                pending.clear();
                let _ = out_tx.send(OutputLine::Stderr("Stopping…".into()));
                registry.stop_all();
            }
        }
    }

    if failures > 0 {
        return Err(anyhow::anyhow!(
            "{failures} of {total} run(s) did not complete successfully"
        ));
    }
    Ok(())
}
