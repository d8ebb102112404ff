//! `shipyard` command-line driver.

mod config;
mod simulation;

use clap::{Parser, Subcommand, ValueEnum};
use config::ShipyardConfig;
use shipyard_core::{
    approval_required, AgentType, GateStore, InMemoryDeliverableStore, InMemoryGateStore,
    PhaseName,
};
use shipyard_events::{CallbackSubscriber, Event, EventBus};
use shipyard_orchestrator::{
    read_decision_log, AgentStatus, FileToolExecutor, JsonlDecisionLogger, Orchestrator,
    TaskExecutor,
};
use shipyard_phases::{
    Advance, BuildPipeline, JsonReportStore, PhaseArchive, PhaseManager, PhaseTransitionService,
    PhaseValidator, QualitySnapshot,
};
use simulation::{simulated_coverage, PlaybookDecider, SimulatedAgent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shipyard", about = "Shipyard, agent fleet build orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "shipyard.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated build end to end with scripted agents
    Run {
        /// Project id (overrides config)
        #[arg(long)]
        project: Option<String>,
        /// Project goal (overrides config)
        #[arg(long)]
        goal: Option<String>,
        /// Sign-off level 1-5 (overrides config)
        #[arg(long)]
        approval_level: Option<u8>,
        /// Worker count (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Data directory (overrides config)
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Approve every gate instead of stopping at the first one
        #[arg(long)]
        auto_approve: bool,
        /// Give up after this many advance attempts
        #[arg(long, default_value_t = 50)]
        max_rounds: usize,
    },
    /// Show the phase order, checklists and sign-off matrix
    Phases,
    /// Validate the config file and print the resolved settings
    CheckConfig,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = ShipyardConfig::load(&cli.config).await.map_err(|e| {
        anyhow::anyhow!("Failed to load config '{}': {e}", cli.config.display())
    })?;

    match cli.command {
        Commands::Run {
            project,
            goal,
            approval_level,
            workers,
            data_dir,
            auto_approve,
            max_rounds,
        } => {
            if let Some(project) = project {
                config.project.id = project;
            }
            if let Some(goal) = goal {
                config.project.goal = goal;
            }
            if let Some(level) = approval_level {
                config.project.approval_level = level;
            }
            if let Some(workers) = workers {
                config.executor.workers = workers;
            }
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            config.validate()?;
            run_simulation(&config, auto_approve, max_rounds).await?;
        }
        Commands::Phases => print_phases(),
        Commands::CheckConfig => {
            println!("Config OK: {}", cli.config.display());
            println!("  project:    {} ({})", config.project.id, config.project.goal);
            println!(
                "  autonomy:   {} / sign-off level {}",
                config.autonomy()?,
                config.project.approval_level
            );
            println!(
                "  executor:   {} workers, {}s timeout, {} retries, {}ms poll",
                config.executor.workers,
                config.executor.task_timeout_secs,
                config.executor.max_retries,
                config.executor.poll_interval_ms
            );
            println!("  events:     {} per project", config.events.history_capacity);
            println!(
                "  validation: coverage {}% (warn within {})",
                config.validation.coverage_threshold, config.validation.coverage_margin
            );
            println!("  data dir:   {}", config.storage.data_dir.display());
        }
    }

    Ok(())
}

fn print_phases() {
    println!("Phases:");
    for phase in PhaseName::ORDER {
        println!("  {}. {phase}", phase.index() + 1);
        for item in phase.checklist() {
            println!("     - {item}");
        }
    }
    println!("\nSign-off required (level x phase):");
    print!("  {:<16}", "");
    for level in 1..=5u8 {
        print!("{level:>4}");
    }
    println!();
    for phase in PhaseName::ORDER {
        print!("  {:<16}", phase.as_str());
        for level in 1..=5u8 {
            let mark = if approval_required(level, phase) { "x" } else { "." };
            print!("{mark:>4}");
        }
        println!();
    }
}

async fn run_simulation(
    config: &ShipyardConfig,
    auto_approve: bool,
    max_rounds: usize,
) -> anyhow::Result<()> {
    let project_id = config.project.id.clone();
    let data_dir = config.storage.data_dir.clone();
    let workspace = data_dir.join("workspace").join(&project_id);
    tokio::fs::create_dir_all(&workspace).await?;
    info!(project = %project_id, data_dir = %data_dir.display(), "starting simulated build");

    let events = Arc::new(EventBus::with_capacity(config.events.history_capacity));
    events.subscribe_all(Arc::new(CallbackSubscriber::new(|event: &Event| {
        debug!(event = %event.event_type, project = %event.project_id, data = %event.data, "event");
        Ok(())
    })));

    let gates = Arc::new(InMemoryGateStore::new());
    let deliverables = Arc::new(InMemoryDeliverableStore::new());
    let decision_log = Arc::new(JsonlDecisionLogger::new(
        data_dir.join("decisions").join(format!("{project_id}.jsonl")),
    ));

    let orchestrator = Arc::new(
        Orchestrator::new(config.orchestrator_config()?, events.clone())
            .with_llm(Arc::new(PlaybookDecider::new()))
            .with_gate_store(gates.clone())
            .with_deliverable_store(deliverables.clone())
            .with_decision_logger(decision_log.clone())
            .with_tool_executor(Arc::new(FileToolExecutor::new(&workspace))),
    );
    for agent_type in AgentType::ALL {
        orchestrator
            .register_agent(Arc::new(SimulatedAgent::new(agent_type, &workspace)))
            .await?;
    }

    let phases = Arc::new(PhaseManager::new(events.clone()));
    let validator = Arc::new(
        PhaseValidator::new(deliverables.clone(), gates.clone(), phases.clone())
            .with_config(config.validator_config()),
    );
    let transitions = PhaseTransitionService::new(
        orchestrator.clone(),
        phases.clone(),
        validator.clone(),
        PhaseArchive::new(&workspace, &data_dir),
        JsonReportStore::new(&data_dir),
    );
    let pipeline = BuildPipeline::new(
        orchestrator.clone(),
        phases.clone(),
        validator,
        transitions,
        config.project.approval_level,
    );

    let executor_config = config.executor_config();
    let poll = executor_config.poll_interval;
    let executor = Arc::new(TaskExecutor::new(orchestrator.clone(), executor_config));
    executor.start();

    let queued = pipeline.start_build().await?;
    println!("Build '{project_id}' started: {} workshopping tasks queued", queued.len());

    let mut finished = false;
    for _ in 0..max_rounds {
        wait_until_idle(&orchestrator, &executor, poll).await;
        if let Some(active) = phases.active_phase(&project_id) {
            phases.record_quality(
                &project_id,
                active.name,
                QualitySnapshot::default()
                    .with_tests(120, 120)
                    .with_coverage(simulated_coverage(active.name)),
            )?;
        }

        match pipeline.advance_if_ready().await? {
            Advance::Transitioned {
                report,
                report_path,
                tasks,
            } => {
                println!("{}", report.summary);
                println!("  report: {}", report_path.display());
                println!("  queued: {} tasks", tasks.len());
            }
            Advance::AwaitingApproval { phase, gate_id } => {
                if !auto_approve {
                    println!("Waiting for sign-off on {phase} (gate {gate_id})");
                    break;
                }
                orchestrator.resolve_gate(&gate_id, true, "shipyard-cli").await?;
                println!("Auto-approved sign-off for {phase}");
            }
            Advance::Blocked {
                phase,
                blockers,
                warnings,
            } => {
                if auto_approve && approve_pending(&orchestrator, gates.as_ref()).await? > 0 {
                    continue;
                }
                println!("{phase} is blocked:");
                for blocker in &blockers {
                    println!("  ✗ {blocker}");
                }
                for warning in &warnings {
                    println!("  ! {warning}");
                }
                break;
            }
            Advance::Finished => {
                finished = true;
                break;
            }
        }
    }

    executor.stop().await;
    decision_log.close().await;

    let summary = orchestrator.task_summary();
    let stats = executor.stats();
    println!();
    println!(
        "{} '{project_id}': {} tasks ({} completed, {} failed), {} retries",
        if finished { "Finished" } else { "Stopped" },
        summary.total,
        summary.completed,
        summary.failed,
        stats.retried
    );
    for record in phases.phases(&project_id) {
        println!("  {:<16} {:?}", record.name.as_str(), record.status);
    }
    match read_decision_log(decision_log.path()).await {
        Ok(entries) => println!("  decisions logged: {}", entries.len()),
        Err(e) => warn!(error = %e, "could not read decision log"),
    }
    Ok(())
}

/// Sleep until no task is queued or running. Tasks parked for a paused
/// role do not count.
async fn wait_until_idle(orchestrator: &Orchestrator, executor: &TaskExecutor, poll: Duration) {
    loop {
        let summary = orchestrator.task_summary();
        if orchestrator.queue_len() == 0
            && summary.pending <= executor.parked_count()
            && summary.assigned == 0
            && summary.in_progress == 0
        {
            return;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Approve every pending gate and resume paused agents. Returns the number of
/// gates approved.
async fn approve_pending(
    orchestrator: &Orchestrator,
    gates: &dyn GateStore,
) -> anyhow::Result<usize> {
    let pending = gates.get_pending_gates(orchestrator.project_id()).await?;
    for gate in &pending {
        orchestrator
            .resolve_gate(&gate.id, true, "shipyard-cli")
            .await?;
        println!("Auto-approved gate: {}", gate.reason);
    }
    for agent in orchestrator.agents().await {
        if agent.status == AgentStatus::Paused {
            orchestrator.resume_agent(&agent.id).await?;
        }
    }
    Ok(pending.len())
}
