use anyhow::{Context, Result};
use cellmesh_app::{Scenario, ScenarioConfig};
use cellmesh_core::CellAppConfig;
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "cellmesh",
    version,
    about = "Run entity distribution scenarios on an in-process cell cluster"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Populate a cluster, let entities drift across cells, then shut it down.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Number of cell processes, laid out as vertical strips.
    #[arg(long, default_value_t = 3)]
    processes: u32,
    #[arg(long, default_value_t = 60)]
    entities: u32,
    #[arg(long, default_value_t = 200)]
    ticks: u64,
    #[arg(long, env = "CELLMESH_SEED", default_value_t = 0x5EED)]
    seed: u64,
    /// DuckDB file for archiving and shutdown write-back.
    #[arg(long)]
    db: Option<PathBuf>,
    /// Kill the middle process at this tick.
    #[arg(long)]
    kill_at: Option<u64>,
    /// JSON file with cell process knobs; missing knobs keep their defaults.
    #[arg(long, env = "CELLMESH_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_cell_config(path: Option<&PathBuf>) -> Result<CellAppConfig> {
    let Some(path) = path else {
        return Ok(CellAppConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    CellAppConfig::from_json_str(&raw)
        .with_context(|| format!("invalid config {}", path.display()))
}

fn run(args: RunArgs) -> Result<()> {
    let cell = load_cell_config(args.config.as_ref())?;
    let config = ScenarioConfig {
        processes: args.processes,
        entities: args.entities,
        ticks: args.ticks,
        seed: args.seed,
        db: args.db,
        kill_at: args.kill_at,
        cell,
    };
    info!(
        processes = config.processes,
        entities = config.entities,
        ticks = config.ticks,
        seed = config.seed,
        "starting scenario"
    );
    let summary = Scenario::new(config)?.run()?;
    info!(
        alive = summary.entities_alive,
        offloads = summary.offloads_started,
        repairs = summary.repairs,
        violations = summary.exclusivity_violations,
        "scenario finished"
    );
    let rendered =
        serde_json::to_string_pretty(&summary).context("failed to format scenario summary")?;
    println!("{rendered}");
    Ok(())
}
