use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use safeguard_domain::{ApplyMode, CheckpointId, RunId, RunStatus, RunStatusReport};
use safeguard_engine::{replay_audit, Engine, EngineConfig, EngineError, RunConfig};
use safeguard_plan::load_change_set_from_path;
use safeguard_target::{
    HttpJsonTarget, HttpTargetParams, JsonFileTarget, TargetState, TargetSystem,
};
use safeguard_trace_core::RunStore;
use safeguard_trace_sqlite::SqliteRunStore;
use serde_json::{json, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "safeguard")]
#[command(about = "Gated change application with checkpoints, rollback and a hash-chained audit trail")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Seed a JSON target state file.
    InitTarget(InitTargetArgs),
    Start(StartArgs),
    Advance(RunArgs),
    Decide(DecideArgs),
    Cancel(CancelArgs),
    Status(RunArgs),
    Rollback(RollbackArgs),
    Trace(TraceArgs),
    Replay(ReplayArgs),
    Export(ExportArgs),
}

#[derive(Debug, Args)]
struct EngineArgs {
    #[arg(long)]
    trace_db: PathBuf,
    /// JSON state file of the target.
    #[arg(long, conflicts_with = "target_url")]
    target_state: Option<PathBuf>,
    /// Base URL of an HTTP target.
    #[arg(long)]
    target_url: Option<String>,
    /// YAML engine config.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct InitTargetArgs {
    #[arg(long)]
    target_state: PathBuf,
    /// JSON object mapping each resource to its initial fields.
    #[arg(long)]
    seed: PathBuf,
    #[arg(long, default_value_t = false)]
    unhealthy: bool,
}

#[derive(Debug, Args)]
struct StartArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    plan: PathBuf,
    /// Overrides the mode in the plan document.
    #[arg(long)]
    mode: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    external_correlation_id: Option<String>,
    #[arg(long, default_value = "operator")]
    requested_by: String,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
struct DecideArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    step: usize,
    #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
    approve: bool,
    #[arg(long)]
    reject: bool,
    #[arg(long)]
    reason: Option<String>,
    #[arg(long, default_value = "operator")]
    decided_by: String,
}

#[derive(Debug, Args)]
struct CancelArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    reason: Option<String>,
    #[arg(long, default_value = "operator")]
    cancelled_by: String,
}

#[derive(Debug, Args)]
struct RollbackArgs {
    #[command(flatten)]
    engine: EngineArgs,
    #[arg(long)]
    checkpoint_id: String,
}

#[derive(Debug, Args)]
struct TraceArgs {
    #[command(subcommand)]
    command: TraceSubcommand,
}

#[derive(Debug, Subcommand)]
enum TraceSubcommand {
    Runs {
        #[arg(long)]
        trace_db: PathBuf,
    },
    Events {
        #[arg(long)]
        trace_db: PathBuf,
        #[arg(long)]
        run_id: String,
    },
}

#[derive(Debug, Args)]
struct ReplayArgs {
    #[arg(long)]
    trace_db: PathBuf,
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    trace_db: PathBuf,
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    out: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("safeguard=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitTarget(args) => init_target_command(&args),
        Commands::Start(args) => start_command(&args),
        Commands::Advance(args) => advance_command(&args),
        Commands::Decide(args) => decide_command(&args),
        Commands::Cancel(args) => cancel_command(&args),
        Commands::Status(args) => status_command(&args),
        Commands::Rollback(args) => rollback_command(&args),
        Commands::Trace(args) => trace_command(args),
        Commands::Replay(args) => replay_command(&args),
        Commands::Export(args) => export_command(&args),
    }
}

/// Store, target and config opened for one invocation.
struct Session {
    store: SqliteRunStore,
    target: Box<dyn TargetSystem>,
    config: EngineConfig,
}

impl Session {
    fn open(args: &EngineArgs) -> Result<Self> {
        let store = SqliteRunStore::open(&args.trace_db)?;
        store.migrate()?;
        let target: Box<dyn TargetSystem> = match (&args.target_state, &args.target_url) {
            (Some(path), None) => Box::new(JsonFileTarget::new(path)),
            (None, Some(url)) => Box::new(HttpJsonTarget::new(HttpTargetParams::for_url(url))?),
            _ => return Err(anyhow!("pass exactly one of --target-state or --target-url")),
        };
        let config = match &args.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        tracing::debug!(target_system = target.target_name(), "session opened");
        Ok(Self {
            store,
            target,
            config,
        })
    }

    fn engine(&self) -> Engine<'_> {
        Engine::new(&self.store, self.target.as_ref(), self.config.clone())
    }
}

fn init_target_command(args: &InitTargetArgs) -> Result<()> {
    let body = fs::read_to_string(&args.seed)
        .with_context(|| format!("failed to read seed at {}", args.seed.display()))?;
    let seed: Value = serde_json::from_str(&body)
        .with_context(|| format!("invalid seed JSON at {}", args.seed.display()))?;
    let resources = seed
        .as_object()
        .ok_or_else(|| anyhow!("seed must be a JSON object of resource -> fields"))?;

    let mut state = TargetState::default().with_unhealthy(args.unhealthy);
    for (resource, fields) in resources {
        if !fields.is_object() {
            return Err(anyhow!("fields of {resource} must be a JSON object"));
        }
        state = state.with_resource(resource, fields);
    }
    JsonFileTarget::init(&args.target_state, &state)?;

    println!(
        "initialized {} resource(s) in {}",
        resources.len(),
        args.target_state.display()
    );
    Ok(())
}

fn start_command(args: &StartArgs) -> Result<()> {
    let envelope = load_change_set_from_path(&args.plan)?;
    let mode = match args.mode.as_deref() {
        Some(mode) => ApplyMode::from_str(mode)?,
        None => envelope.document.mode,
    };
    let run_id = args.run_id.as_deref().map(RunId::from_str).transpose()?;

    let session = Session::open(&args.engine)?;
    let engine = session.engine();
    let run_config = RunConfig {
        run_id,
        external_correlation_id: args.external_correlation_id.clone(),
        requested_by: args.requested_by.clone(),
        cli_args_json: json!({
            "plan": args.plan,
            "plan_source_hash": envelope.source_hash,
            "trace_db": args.engine.trace_db,
            "target_state": args.engine.target_state,
            "target_url": args.engine.target_url,
            "mode": mode,
        }),
    };

    let run_id = engine
        .start_run(
            &envelope.document.change_set,
            &envelope.document.scope,
            mode,
            &run_config,
        )
        .map_err(engine_error)?;
    engine.advance(run_id).map_err(engine_error)?;
    print_progress(&engine, run_id)
}

fn advance_command(args: &RunArgs) -> Result<()> {
    let session = Session::open(&args.engine)?;
    let engine = session.engine();
    let run_id = RunId::from_str(&args.run_id)?;
    engine.advance(run_id).map_err(engine_error)?;
    print_progress(&engine, run_id)
}

fn decide_command(args: &DecideArgs) -> Result<()> {
    let session = Session::open(&args.engine)?;
    let engine = session.engine();
    let run_id = RunId::from_str(&args.run_id)?;
    let approved = args.approve && !args.reject;

    let status = engine
        .handle_gate_decision(
            run_id,
            args.step,
            approved,
            args.reason.as_deref(),
            &args.decided_by,
        )
        .map_err(engine_error)?;
    if status == RunStatus::Running {
        engine.advance(run_id).map_err(engine_error)?;
    }
    print_progress(&engine, run_id)
}

fn cancel_command(args: &CancelArgs) -> Result<()> {
    let session = Session::open(&args.engine)?;
    let engine = session.engine();
    let run_id = RunId::from_str(&args.run_id)?;
    engine
        .cancel_run(run_id, &args.cancelled_by, args.reason.as_deref())
        .map_err(engine_error)?;
    print_progress(&engine, run_id)
}

fn status_command(args: &RunArgs) -> Result<()> {
    let session = Session::open(&args.engine)?;
    let engine = session.engine();
    let run_id = RunId::from_str(&args.run_id)?;
    let report = engine.get_run_status(run_id).map_err(engine_error)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn rollback_command(args: &RollbackArgs) -> Result<()> {
    let session = Session::open(&args.engine)?;
    let engine = session.engine();
    let checkpoint_id = CheckpointId::from_str(&args.checkpoint_id)?;
    let result = engine.rollback(checkpoint_id).map_err(engine_error)?;

    for outcome in &result.resources {
        println!(
            "resource={} target_version={} restored={} attempts={}",
            outcome.resource, outcome.target_version, outcome.restored, outcome.attempts
        );
    }
    println!(
        "checkpoint_id={} fully_restored={}",
        result.checkpoint_id,
        result.fully_restored()
    );
    if result.fully_restored() {
        Ok(())
    } else {
        Err(anyhow!(
            "rollback incomplete; manual intervention required for {} resource(s)",
            result.failed_resources().len()
        ))
    }
}

fn trace_command(args: TraceArgs) -> Result<()> {
    match args.command {
        TraceSubcommand::Runs { trace_db } => {
            let store = SqliteRunStore::open(&trace_db)?;
            store.migrate()?;
            for run in store.list_runs()? {
                println!("{}", serde_json::to_string(&run)?);
            }
        }
        TraceSubcommand::Events { trace_db, run_id } => {
            let store = SqliteRunStore::open(&trace_db)?;
            let run_id = RunId::from_str(&run_id)?;
            for event in store.list_events_for_run(run_id)? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }
    Ok(())
}

fn replay_command(args: &ReplayArgs) -> Result<()> {
    let store = SqliteRunStore::open(&args.trace_db)?;
    let run_id = RunId::from_str(&args.run_id)?;
    store
        .get_run(run_id)?
        .ok_or_else(|| anyhow!("run_id {run_id} not found"))?;
    let report = replay_audit(&store, run_id)?;

    match report.first_invalid_seq {
        None => println!(
            "run_id={} events={} chain_valid={}",
            report.run_id, report.events, report.chain_valid
        ),
        Some(seq) => println!(
            "run_id={} events={} chain_valid={} first_invalid_seq={seq}",
            report.run_id, report.events, report.chain_valid
        ),
    }
    Ok(())
}

fn export_command(args: &ExportArgs) -> Result<()> {
    let store = SqliteRunStore::open(&args.trace_db)?;
    let run_id = RunId::from_str(&args.run_id)?;
    let events = store.list_events_for_run(run_id)?;
    let event_count = events.len();

    let output = File::create(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let mut writer = BufWriter::new(output);
    for event in &events {
        writeln!(writer, "{}", serde_json::to_string(&event)?)?;
    }
    writer.flush()?;

    println!("exported {} events to {}", event_count, args.out.display());
    Ok(())
}

/// One `key=value` line describing where a run stands now.
fn print_progress(engine: &Engine<'_>, run_id: RunId) -> Result<()> {
    let report = engine.get_run_status(run_id).map_err(engine_error)?;
    println!("{}", progress_line(&report));
    Ok(())
}

fn progress_line(report: &RunStatusReport) -> String {
    let mut line = format!(
        "run_id={} status={}",
        report.run.run_id,
        report.run.status.as_str()
    );
    if let Some(gate) = report.pending_gate() {
        line.push_str(&format!(
            " gate_step={} gate_step_code={}",
            gate.step_index,
            gate.step_code.as_str()
        ));
    }
    if let Some(kind) = report.run.failure_kind {
        line.push_str(&format!(" failure_kind={}", kind.as_str()));
    }
    if let Some(checkpoint_id) = report.run.checkpoint_id {
        line.push_str(&format!(" checkpoint_id={checkpoint_id}"));
    }
    if report.run.manual_intervention_required {
        line.push_str(" manual_intervention_required=true");
    }
    line
}

fn engine_error(err: EngineError) -> anyhow::Error {
    let code = err.code();
    anyhow!(err).context(format!("error_code={code}"))
}
