mod demo;

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use femstate::{AnalysisConfig, Datastore, ExchangeChannel, StaticAnalysis};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use demo::report::{render_summary, Summary};

#[derive(Parser, Debug)]
#[command(name = "femstate")]
#[command(about = "Run a checkpointed static analysis of a demonstration truss")]
struct Args {
    /// JSON file with the analysis settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// File receiving a checkpoint of every committed step
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose.
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    // Load the solver settings. Without a file the defaults take ten equal
    // load steps with a tolerance relative to the external load.
    let mut config = match &args.config {
        Some(path) => AnalysisConfig::from_path(path)?,
        None => AnalysisConfig::default(),
    };
    // Asking for a checkpoint file implies checkpointing at least every step.
    if args.checkpoint.is_some() && config.checkpoint_interval == 0 {
        config.checkpoint_interval = 1;
    }

    // Build the two-bar truss. Its bars carry a plastic material, a fiber
    // section and a corotational transformation, so every checkpoint nests
    // polymorphic members inside the elements.
    let (mut domain, model) = demo::model::build()?;

    // Committed steps are written to an in-memory store that is only saved
    // when a checkpoint path was given.
    let mut store = Datastore::new();
    let channel: Option<&mut dyn ExchangeChannel> = if args.checkpoint.is_some() {
        Some(&mut store)
    } else {
        None
    };
    // Step the load factor to one. Converged steps are committed and
    // diverging ones reverted and retried with half the increment.
    let report = StaticAnalysis::new(config).run(&mut domain, channel)?;

    if let Some(path) = &args.checkpoint {
        store.save_to_path(path)?;
        info!(path = %path.display(), commits = store.commit_tags().len(), "checkpoints saved");
    }

    // Print a short report of the committed response for the CLI user.
    let summary = Summary::collect(&domain, &model, &report);
    print!("{}", render_summary(&summary)?);
    Ok(())
}
