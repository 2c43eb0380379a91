use blockmerge::checkpoint_manager::CheckpointManager;
use blockmerge::config::MergeConfig;
use blockmerge::controller::{Command, RunController, RunState};
use blockmerge::executor::{CancelToken, LocalExecutor};
use blockmerge::status::status;
use blockmerge::store::{BlockOutput, FsBlockOutput, FsBlockStore};
use blockmerge::MergeError;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "blockmerge")]
#[command(about = "Reconcile per-block instance labels into one global labeling", long_about = None)]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Discard the checkpoint and merged outputs first
    #[arg(long)]
    restart: bool,
    /// Merge on any nonzero overlap, ignoring the selection thresholds
    #[arg(long)]
    force_overlap: bool,
    #[arg(long)]
    workers: Option<usize>,
    /// Minimum shared boundary voxels for two labels to merge
    #[arg(long)]
    min_overlap: Option<u64>,
    /// Rewrite blocks that already have output
    #[arg(long)]
    reapply: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect overlap evidence for every block pair and assign global labels
    Pools(RunArgs),
    /// Write relabeled blocks using the assigned labels
    Apply(RunArgs),
    /// Pools followed by apply
    Run(RunArgs),
    /// Show checkpoint phase and per-block output state
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Remove the checkpoint and merged outputs
    Clean,
}

fn load_config(cli: &Cli) -> Result<MergeConfig, MergeError> {
    match &cli.config {
        Some(path) => MergeConfig::load(path),
        None => {
            let config = MergeConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn apply_overrides(config: &mut MergeConfig, args: &RunArgs) -> Result<(), MergeError> {
    config.restart |= args.restart;
    config.force_overlap |= args.force_overlap;
    config.reapply |= args.reapply;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(min_overlap) = args.min_overlap {
        config.selection.min_overlap_voxels = min_overlap;
    }
    config.validate()
}

fn run(config: &MergeConfig, command: Command) -> Result<RunState, MergeError> {
    println!("[blockmerge] Metadata directory: {}", config.metadata_dir.display());
    println!("[blockmerge] Output directory: {}", config.output_dir.display());

    let store = FsBlockStore::open(&config.metadata_dir)?;
    let output = FsBlockOutput::new(&config.output_dir);
    let checkpoints = CheckpointManager::new(&config.checkpoint_dir);
    let executor = LocalExecutor::new(config.workers);

    let cancel = CancelToken::new();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        // A second signal while stopping exits immediately.
        signal_hook::flag::register_conditional_shutdown(signal, 1, cancel.flag())?;
        signal_hook::flag::register(signal, cancel.flag())?;
    }

    let mut controller = RunController::new(
        &store,
        &output,
        &executor,
        &checkpoints,
        config.run_options(),
        cancel,
    );
    let report = controller.run(command)?;
    print!("{}", report);
    if report.state == RunState::Interrupted {
        println!("[blockmerge] Interrupted; progress saved to {}", checkpoints.path().display());
    }
    Ok(report.state)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    blockmerge::init_tracing(cli.debug);

    let result = load_config(&cli).and_then(|mut config| match &cli.command {
        Commands::Pools(args) | Commands::Apply(args) | Commands::Run(args) => {
            apply_overrides(&mut config, args)?;
            let command = match &cli.command {
                Commands::Pools(_) => Command::Pools,
                Commands::Apply(_) => Command::Apply,
                _ => Command::Run,
            };
            run(&config, command).map(|state| state == RunState::Done)
        }
        Commands::Status { json } => {
            let store = FsBlockStore::open(&config.metadata_dir)?;
            let output = FsBlockOutput::new(&config.output_dir);
            let checkpoints = CheckpointManager::new(&config.checkpoint_dir);
            let report = status(&store, &output, &checkpoints);
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
            }
            Ok(true)
        }
        Commands::Clean => {
            CheckpointManager::new(&config.checkpoint_dir).clear()?;
            FsBlockOutput::new(&config.output_dir).clear()?;
            println!("[blockmerge] Removed checkpoint and merged outputs");
            Ok(true)
        }
    });

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            eprintln!("[blockmerge] {}", e);
            ExitCode::FAILURE
        }
    }
}
