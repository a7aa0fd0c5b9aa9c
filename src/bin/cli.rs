//! Binary entry point for the gitmill CLI.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use gitmill::checkpoint::CheckpointManager;
use gitmill::config::{parse_size, EngineConfig, StreamingMode};
use gitmill::error::{EngineError, Result};
use gitmill::plan::{compute_schedule, ScheduleInputs};
use gitmill::testkit::{self, NdjsonSink, NullParser, SyntheticRepo};
use gitmill::{ReportFormat, StreamingOrchestrator};

#[derive(Parser, Debug)]
#[command(
    name = "gitmill",
    version,
    about = "Memory-bounded streaming engine for Git-history analysis",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value = "yaml",
        help = "Report output format"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Print engine statistics after the run"
    )]
    stats: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StreamingArg {
    Auto,
    On,
    Off,
}

impl From<StreamingArg> for StreamingMode {
    fn from(value: StreamingArg) -> Self {
        match value {
            StreamingArg::Auto => StreamingMode::Auto,
            StreamingArg::On => StreamingMode::On,
            StreamingArg::Off => StreamingMode::Off,
        }
    }
}

#[derive(Args, Debug)]
struct EngineArgs {
    #[arg(
        long,
        value_name = "SIZE",
        help = "Memory budget (256MB, 2GiB; 0 = unlimited). Takes precedence over other sizing knobs"
    )]
    memory_budget: Option<String>,

    #[arg(long, value_name = "N", help = "Pipeline worker threads")]
    workers: Option<usize>,

    #[arg(long, value_name = "N", help = "Leaf worker threads")]
    leaf_workers: Option<usize>,

    #[arg(long, value_name = "N", help = "Bounded buffer size between stages")]
    buffer_size: Option<usize>,

    #[arg(long, value_name = "N", help = "Commits per blob batch")]
    commit_batch_size: Option<usize>,

    #[arg(long, value_name = "SIZE", help = "Blob cache capacity")]
    blob_cache_size: Option<String>,

    #[arg(long, value_name = "N", help = "Diff cache capacity (entries)")]
    diff_cache_size: Option<usize>,

    #[arg(long, value_name = "SIZE", help = "Syntax-tree arena budget")]
    blob_arena_size: Option<String>,

    #[arg(long, value_name = "N", help = "Allocator tuning percent (>= 0)")]
    gc_percent: Option<i64>,

    #[arg(long, value_name = "SIZE", help = "Ballast allocation held for the process lifetime")]
    ballast_size: Option<String>,

    #[arg(long, action = ArgAction::SetTrue, help = "Save checkpoints at chunk boundaries")]
    checkpoint: bool,

    #[arg(long, value_name = "DIR", help = "Checkpoint directory")]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, action = ArgAction::SetTrue, help = "Resume from an existing checkpoint")]
    resume: bool,

    #[arg(long, action = ArgAction::SetTrue, help = "Remove any existing checkpoint first")]
    clear_checkpoint: bool,

    #[arg(long, value_enum, default_value = "auto", help = "Streaming mode")]
    streaming: StreamingArg,

    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        help = "Follow first parents only at merges"
    )]
    first_parent: bool,

    #[arg(long, value_name = "FILE", help = "TOML config file overlay")]
    config: Option<PathBuf>,
}

impl EngineArgs {
    fn build(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::default();
        if let Some(path) = &self.config {
            config = config.overlay_file(path)?;
        }
        if let Some(s) = &self.memory_budget {
            config.memory_budget = parse_size(s)? as i64;
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
        if let Some(v) = self.leaf_workers {
            config.leaf_workers = v;
        }
        if let Some(v) = self.buffer_size {
            config.buffer_size = v;
        }
        if let Some(v) = self.commit_batch_size {
            config.commit_batch_size = v;
        }
        if let Some(s) = &self.blob_cache_size {
            config.blob_cache_size = parse_size(s)?;
        }
        if let Some(v) = self.diff_cache_size {
            config.diff_cache_size = v;
        }
        if let Some(s) = &self.blob_arena_size {
            config.blob_arena_size = parse_size(s)?;
        }
        if let Some(v) = self.gc_percent {
            config.gc_percent = Some(gitmill::memory::validate_gc_percent(v)?);
        }
        if let Some(s) = &self.ballast_size {
            config.ballast_size = parse_size(s)?;
        }
        config.checkpoint = self.checkpoint;
        config.checkpoint_dir = self.checkpoint_dir.clone();
        config.resume = self.resume;
        config.clear_checkpoint = self.clear_checkpoint;
        config.streaming = self.streaming.into();
        config.first_parent = self.first_parent;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct HistoryArgs {
    #[arg(long, default_value_t = 1000, help = "Synthetic history length")]
    commits: usize,

    #[arg(long, default_value_t = 5, help = "Synthetic author count")]
    authors: usize,

    #[arg(long, default_value_t = 42, help = "History generator seed")]
    seed: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full analyzer set over a synthetic history.
    Analyze {
        #[command(flatten)]
        history: HistoryArgs,

        #[command(flatten)]
        engine: EngineArgs,

        #[arg(long, action = ArgAction::SetTrue, help = "Parse syntax trees for supported files")]
        uast: bool,

        #[arg(
            long,
            value_name = "FILE",
            help = "Stream TCs to an NDJSON file instead of aggregating"
        )]
        tc_sink: Option<PathBuf>,
    },
    /// Print the chunk schedule for a budget without running.
    Plan {
        #[command(flatten)]
        history: HistoryArgs,

        #[command(flatten)]
        engine: EngineArgs,

        #[arg(
            long,
            value_name = "SIZE",
            default_value = "512KiB",
            help = "Declared working-state growth per commit"
        )]
        work_state: String,

        #[arg(long, default_value_t = 1, help = "Buffering factor cap (1-3)")]
        max_buffering: usize,
    },
    /// Inspect or clear checkpoints.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand, Debug)]
enum CheckpointAction {
    /// Print checkpoint metadata.
    Inspect {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    /// Remove a checkpoint directory.
    Clear {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    gitmill::logging::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version requests are not usage errors.
            if e.use_stderr() {
                eprintln!("{e}");
                return ExitCode::from(1);
            }
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gitmill: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Analyze {
            history,
            engine,
            uast,
            tc_sink,
        } => analyze(cli.format, cli.stats, history, engine, uast, tc_sink),
        Command::Plan {
            history,
            engine,
            work_state,
            max_buffering,
        } => plan(history, engine, &work_state, max_buffering),
        Command::Checkpoint { action } => checkpoint(action),
    }
}

fn analyze(
    format: OutputFormat,
    show_stats: bool,
    history: HistoryArgs,
    engine_args: EngineArgs,
    uast: bool,
    tc_sink: Option<PathBuf>,
) -> Result<()> {
    let config = engine_args.build()?;
    let repo = Arc::new(SyntheticRepo::generate(
        history.seed,
        history.commits,
        history.authors,
    ));
    let (analyzers, core_count) = testkit::standard_analyzers();
    let parser = uast.then(|| Arc::new(NullParser) as Arc<dyn gitmill::pipeline::uast::UastParser>);

    let mut engine =
        StreamingOrchestrator::new(repo, analyzers, core_count, parser, config)?;

    let sink_mode = tc_sink.is_some();
    if let Some(path) = tc_sink {
        let file = std::fs::File::create(path)?;
        engine.set_tc_sink(Box::new(NdjsonSink::new(file)));
    }

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::with_template("{spinner} chunk {pos} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    let bar = progress.clone();
    engine.set_on_chunk_complete(Box::new(move |_runner, _chunk_index| {
        bar.inc(1);
        Ok(())
    }));

    let outcome = engine.run()?;
    progress.finish_and_clear();

    if sink_mode {
        println!("tc-sink mode: {} analyzer reports (aggregation bypassed)", outcome.reports.len());
    } else {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let report_format = match format {
            OutputFormat::Yaml => ReportFormat::Yaml,
            OutputFormat::Json => ReportFormat::Json,
        };
        for (name, report) in &outcome.reports {
            use std::io::Write;
            writeln!(out, "--- # {name}")?;
            match report_format {
                ReportFormat::Yaml => serde_yaml::to_writer(&mut out, report)
                    .map_err(|e| EngineError::Other(e.to_string()))?,
                ReportFormat::Json => {
                    serde_json::to_writer_pretty(&mut out, report)
                        .map_err(|e| EngineError::Other(e.to_string()))?;
                    writeln!(out)?;
                }
            }
        }
    }

    if show_stats {
        print_stats(&outcome.stats);
    }
    Ok(())
}

fn plan(
    history: HistoryArgs,
    engine_args: EngineArgs,
    work_state: &str,
    max_buffering: usize,
) -> Result<()> {
    let config = engine_args.build()?;
    let inputs = ScheduleInputs {
        total_commits: history.commits,
        memory_budget: config.memory_budget,
        pipeline_overhead: config.pipeline_overhead,
        work_state_per_commit: parse_size(work_state)?,
        avg_tc_size: 128,
        max_buffering,
    };
    let schedule = compute_schedule(&inputs);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "total_commits": history.commits,
            "chunk_size": schedule.chunk_size,
            "chunk_count": schedule.chunks.len(),
            "buffering_factor": schedule.buffering_factor,
            "agg_spill_budget": schedule.agg_spill_budget,
        }))
        .map_err(|e| EngineError::Other(e.to_string()))?
    );
    Ok(())
}

fn checkpoint(action: CheckpointAction) -> Result<()> {
    match action {
        CheckpointAction::Inspect { dir } => {
            let raw = std::fs::read_to_string(dir.join(gitmill::checkpoint::METADATA_FILE))
                .map_err(|_| {
                    EngineError::Config(format!("no checkpoint metadata in {}", dir.display()))
                })?;
            println!("{raw}");
            Ok(())
        }
        CheckpointAction::Clear { dir } => {
            let manager = CheckpointManager::new(dir.clone(), &dir);
            manager.clear()?;
            println!("cleared {}", dir.display());
            Ok(())
        }
    }
}

fn print_stats(stats: &gitmill::EngineStats) {
    println!("\n=== Engine Statistics ===");
    println!("Chunks processed:    {}", stats.chunks_processed);
    println!("Hibernation cycles:  {}", stats.hibernation_cycles);
    println!("Checkpoints saved:   {}", stats.checkpoints_saved);
    println!("Replans:             {}", stats.planner.replan_count);
    println!("TCs routed:          {}", stats.total_tcs);
    println!("Peak memory:         {} bytes", stats.peak_used_bytes);
    println!(
        "Pipeline (ms):       tree-diff {} | blobs {} | diffs {} | parse {}",
        stats.pipeline.tree_diff_ms,
        stats.pipeline.blob_ms,
        stats.pipeline.diff_ms,
        stats.pipeline.parse_ms
    );
    println!(
        "Blob cache:          {:.1}% hit rate ({} bloom skips)",
        stats.pipeline.blob_cache.hit_rate() * 100.0,
        stats.pipeline.blob_cache.bloom_skips
    );
    println!(
        "Diff cache:          {:.1}% hit rate",
        stats.pipeline.diff_cache.hit_rate() * 100.0
    );
}
