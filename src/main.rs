//! `calseq` command-line entry point
//!
//! ```bash
//! calseq validate --sequence dcv.json --library library.json
//! calseq catalog --library library.json --category "Digital Multimeter"
//! calseq run --config config/calseq.toml --sequence dcv.json --bulk
//! calseq procedure --config config/calseq.toml --flow flow.json --section dcv --action verify
//! ```

use anyhow::{bail, Context, Result};
use calseq::action::{ActionStateMachine, ProcedureGraph, TriggerRequest};
use calseq::catalog::DriverCatalog;
use calseq::config::EngineConfig;
use calseq::executor::{total_delay, CancelSignal, RunContext, SequenceExecutor};
use calseq::logging;
use calseq::runner::ProcedureRunner;
use calseq::sequence::{BindingContext, SequenceDocument};
use calseq::transport::InterfaceManager;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_stream::StreamExt;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "calseq")]
#[command(about = "Instrument command sequencing for calibration procedures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a sequence and report every validation error
    Validate {
        /// Sequence document (JSON)
        #[arg(long)]
        sequence: PathBuf,
        /// Driver library (JSON)
        #[arg(long)]
        library: Option<PathBuf>,
    },

    /// List the drivers in a library and check its instructions
    Catalog {
        #[arg(long)]
        library: PathBuf,
        /// Only drivers in this category
        #[arg(long)]
        category: Option<String>,
    },

    /// Execute one sequence against the configured interfaces
    Run {
        /// Engine configuration (TOML)
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        sequence: PathBuf,
        #[arg(long)]
        library: Option<PathBuf>,
        /// Emit one batch at the end instead of one line per step
        #[arg(long)]
        bulk: bool,
    },

    /// Start an action of a deployed procedure and wait for it to finish
    Procedure {
        #[arg(long)]
        config: PathBuf,
        /// Deployed flow (JSON array of nodes)
        #[arg(long)]
        flow: PathBuf,
        /// Section short name
        #[arg(long)]
        section: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        library: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { sequence, library } => {
            logging::init("warn", "pretty");
            validate(&sequence, library.as_deref())
        }
        Commands::Catalog { library, category } => {
            logging::init("warn", "pretty");
            catalog(&library, category.as_deref())
        }
        Commands::Run {
            config,
            sequence,
            library,
            bulk,
        } => run(&config, &sequence, library.as_deref(), bulk).await,
        Commands::Procedure {
            config,
            flow,
            section,
            action,
            library,
        } => procedure(&config, &flow, &section, &action, library.as_deref()).await,
    }
}

fn load_catalog(library: Option<&Path>) -> Result<DriverCatalog> {
    match library {
        Some(path) => DriverCatalog::load(path)
            .with_context(|| format!("Failed to load library {}", path.display())),
        None => Ok(DriverCatalog::default()),
    }
}

fn load_sequence(path: &Path) -> Result<SequenceDocument> {
    SequenceDocument::load(path).with_context(|| format!("Failed to load sequence {}", path.display()))
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    let config = EngineConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration {}", path.display()))?;
    config.validate().context("Invalid configuration")?;
    logging::init(&config.application.log_level, &config.application.log_format);
    Ok(config)
}

fn build_interfaces(config: &EngineConfig) -> Result<Arc<InterfaceManager>> {
    let manager = InterfaceManager::from_configs(&config.interfaces, config.execution.timeouts())
        .context("Failed to build communication interfaces")?;
    Ok(Arc::new(manager))
}

fn validate(sequence: &Path, library: Option<&Path>) -> Result<()> {
    let catalog = load_catalog(library)?;
    let document = load_sequence(sequence)?;
    match document.compile(&catalog, &BindingContext::new()) {
        Ok(plan) => {
            println!(
                "{}: {} step(s), {:?} of delays",
                sequence.display(),
                plan.len(),
                total_delay(&plan)
            );
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("{}", error);
            }
            bail!("{} validation error(s)", errors.len())
        }
    }
}

fn catalog(library: &Path, category: Option<&str>) -> Result<()> {
    let catalog = load_catalog(Some(library))?;
    let drivers = match category {
        Some(category) => catalog.drivers_in_category(category),
        None => catalog.drivers().iter().collect(),
    };
    for driver in drivers {
        let sets: usize = driver.instruction_sets.len() + driver.builtin_instruction_sets().len();
        println!(
            "{} {} ({}) - {} instruction set(s), terminator {}",
            driver.manufacturer, driver.model, driver.nomenclature, sets, driver.terminator
        );
    }

    let issues = catalog.validate();
    for issue in &issues {
        eprintln!("{}", issue);
    }
    if !issues.is_empty() {
        bail!("{} library issue(s)", issues.len());
    }
    Ok(())
}

async fn run(config: &Path, sequence: &Path, library: Option<&Path>, bulk: bool) -> Result<()> {
    let config = load_config(config)?;
    let catalog = load_catalog(library)?;
    let mut document = load_sequence(sequence)?;
    document.respond_in_bulk |= bulk;

    let plan = match document.compile(&catalog, &BindingContext::new()) {
        Ok(plan) => plan,
        Err(errors) => {
            for error in &errors {
                eprintln!("{}", error);
            }
            bail!("{} validation error(s)", errors.len());
        }
    };

    let interfaces = build_interfaces(&config)?;
    let executor = Arc::new(SequenceExecutor::from_config(&config, Arc::clone(&interfaces)));
    executor.bind(&plan).context("Sequence cannot run on this bench")?;
    interfaces.enable_all();

    let cancel = CancelSignal::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let run = RunContext::new(Uuid::new_v4().to_string());
    let (mut events, task) = executor.spawn(plan, run, cancel);
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
    }
    let outcome = task.await.context("Executor task panicked")?;
    ctrl_c.abort();
    interfaces.disable_all().await;

    let results = outcome.context("Sequence execution failed")?;
    eprintln!("{} step(s) executed", results.len());
    Ok(())
}

async fn procedure(
    config: &Path,
    flow: &Path,
    section: &str,
    action: &str,
    library: Option<&Path>,
) -> Result<()> {
    let config = load_config(config)?;
    let catalog = Arc::new(load_catalog(library)?);
    let graph = ProcedureGraph::load(flow)
        .with_context(|| format!("Failed to load flow {}", flow.display()))?;

    let interfaces = build_interfaces(&config)?;
    let executor = Arc::new(SequenceExecutor::from_config(&config, Arc::clone(&interfaces)));
    let machine = Arc::new(ActionStateMachine::new(
        Arc::new(graph),
        interfaces,
        config.execution.event_capacity,
    ));
    let runner = ProcedureRunner::new(machine, executor, catalog);

    let request = TriggerRequest::start(section, action).with_run_id(&Uuid::new_v4().to_string());
    let report = runner
        .run(&request)
        .await
        .with_context(|| format!("Action '{}' in section '{}' failed", action, section))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
